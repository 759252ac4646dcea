use std::fs::File;
use std::io::BufReader;
use std::time::Instant;

use anyhow::Context;
use clap::{Arg, Command, ValueHint};
use input::{Input, Search};
use log::info;
use sieve_core::exchange::{TcpMesh, Transport};
use sieve_core::index::FragmentIndex;
use sieve_core::manager::SearchManager;
use sieve_core::spectrum::SpectrumProcessor;

mod input;
mod ms2;
mod output;

pub struct Runner {
    index: FragmentIndex,
    search: Search,
    start: Instant,
}

impl Runner {
    pub fn new(search: Search) -> anyhow::Result<Self> {
        let start = Instant::now();
        let file = File::open(&search.index)
            .with_context(|| format!("Failed to open index `{}`", search.index.display()))?;
        let index: FragmentIndex = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("Failed to parse index `{}`", search.index.display()))?;

        info!(
            "loaded {} peptides, {} ion chunks in {}ms",
            index.peptides.len(),
            index.chunks.len(),
            start.elapsed().as_millis()
        );
        if index.scale != search.params.scale {
            anyhow::bail!(
                "index was binned at scale {}, parameters say {}",
                index.scale,
                search.params.scale
            );
        }
        Ok(Self {
            index,
            search,
            start,
        })
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let params = self.search.params.clone();

        let transport: Option<Box<dyn Transport>> = match params.nodes {
            1 => None,
            _ => {
                info!(
                    "joining {}-node exchange as node {}",
                    params.nodes, params.myid
                );
                Some(Box::new(TcpMesh::connect(params.myid, &self.search.peers)?))
            }
        };

        let reader = ms2::Ms2Reader::new(SpectrumProcessor::new(
            params.scale,
            params.max_mass,
        ));
        let paths = self
            .search
            .ms2_paths
            .iter()
            .map(std::path::PathBuf::from)
            .collect::<Vec<_>>();

        let manager = SearchManager::new(&self.index, &params)?;
        let (psms, stats) = manager.search_files(&paths, reader, transport)?;

        info!(
            "searched {} spectra in {} batches, reporting {} PSMs",
            stats.spectra, stats.batches, stats.psms
        );

        let filenames = self.search.ms2_paths.clone();
        let path = self.write_psms(&psms, &filenames)?;
        self.search.output_paths.push(path);

        let path = self.make_path("results.json".into());
        let bytes = serde_json::to_vec_pretty(&self.search)?;
        std::fs::write(&path, bytes)?;
        self.search.output_paths.push(path.display().to_string());

        for path in &self.search.output_paths {
            info!("wrote {}", path);
        }
        info!("finished in {}s", self.start.elapsed().as_secs());
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(
            env_logger::Env::default().filter_or("SIEVE_LOG", "error,sieve=info,sieve_core=info"),
        )
        .init();

    let matches = Command::new("sieve")
        .version(clap::crate_version!())
        .about("Distributed fragment-index search for tandem mass spectra")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("ms2_paths")
                .num_args(1..)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Paths to MS2 files to process. Overrides files listed in the \
                     configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("index")
                .short('i')
                .long("index")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path to the fragment index. Overrides the index specified \
                     in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where search results will be written. Overrides the \
                     directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let input = Input::from_arguments(&matches)?;
    let runner = input.build().and_then(Runner::new)?;
    runner.run()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use sieve_core::config::SearchParams;
    use sieve_core::index::{IonChunk, PeptideEntry};
    use sieve_core::spectrum::PROTON;

    fn tiny_index() -> FragmentIndex {
        let peptides = vec![PeptideEntry {
            mass: 1000.0,
            seq_id: 0,
            mod_sites: 0,
        }];
        // Ten ions in bins matching the m/z values written below
        let entries = (0..10u32)
            .map(|i| (0, i, 10_000 + i * 100))
            .collect::<Vec<_>>();
        let chunk = IonChunk::from_ions(6, 1, 1, 200_000, &entries);
        FragmentIndex::new(peptides, vec![chunk], 100, 2000.0).unwrap()
    }

    #[test]
    fn runner_end_to_end() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let index_path = dir.path().join("tiny.idx");
        bincode::serialize_into(File::create(&index_path)?, &tiny_index())?;

        let ms2_path = dir.path().join("tiny.ms2");
        let mut ms2 = format!("S\t1\t1\t500.73\nZ\t1\t{}\n", 1000.0 + PROTON);
        for i in 0..10 {
            ms2.push_str(&format!("{}.0 1000.0\n", 100 + i));
        }
        std::fs::write(&ms2_path, ms2)?;

        let search = Search {
            version: "test".into(),
            params: SearchParams::default(),
            index: index_path,
            ms2_paths: vec![ms2_path.display().to_string()],
            output_directory: dir.path().into(),
            peers: Vec::new(),
            output_paths: Vec::new(),
        };

        Runner::new(search)?.run()?;

        let tsv = std::fs::read_to_string(dir.path().join("results.sieve.tsv"))?;
        let mut lines = tsv.lines();
        assert!(lines.next().unwrap().starts_with("filename\tscannr"));

        // One matching peptide, all ten peaks shared, E-value suppressed
        let row = lines.next().expect("one PSM row");
        let fields = row.split('\t').collect::<Vec<_>>();
        assert_eq!(fields[2], "1");
        assert_eq!(fields[3], "0");
        assert_eq!(fields[5], "10");
        assert_eq!(fields[11], "");
        assert!(lines.next().is_none());

        assert!(dir.path().join("results.json").exists());
        Ok(())
    }
}
