//! Configuration loading: a JSON parameter file in which the command line
//! can override data paths and the output directory.

use std::path::PathBuf;

use anyhow::Context;
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use sieve_core::config::{DistPolicy, SearchParams};

#[derive(Deserialize, Serialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct Input {
    /// Path to a serialized fragment index
    pub index: Option<String>,
    pub ms2_paths: Option<Vec<String>>,
    pub output_directory: Option<String>,
    /// One listen address per node, indexed by node id
    pub peers: Option<Vec<String>>,

    pub threads: Option<usize>,
    pub max_prep_threads: Option<usize>,
    pub min_len: Option<u32>,
    pub max_len: Option<u32>,
    pub max_charge: Option<u32>,
    pub topmatches: Option<usize>,
    pub scale: Option<u32>,
    pub df: Option<u32>,
    pub dm: Option<f32>,
    pub min_shp: Option<u16>,
    pub min_cpsm: Option<u32>,
    pub expect_max: Option<f64>,
    pub min_mass: Option<f32>,
    pub max_mass: Option<f32>,
    pub nodes: Option<usize>,
    pub myid: Option<usize>,
    pub policy: Option<DistPolicy>,
    pub use_gpu: Option<bool>,
}

/// Fully resolved search settings.
#[derive(Serialize, Debug)]
pub struct Search {
    pub version: String,
    pub params: SearchParams,
    pub index: PathBuf,
    pub ms2_paths: Vec<String>,
    pub output_directory: PathBuf,
    pub peers: Vec<String>,
    #[serde(skip)]
    pub output_paths: Vec<String>,
}

impl Input {
    pub fn from_arguments(matches: &ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .expect("required argument");
        let mut input: Input = serde_json::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read parameters from `{}`", path))?,
        )
        .with_context(|| format!("Failed to parse parameters in `{}`", path))?;

        // Command line overrides
        if let Some(index) = matches.get_one::<String>("index") {
            input.index = Some(index.clone());
        }
        if let Some(paths) = matches.get_many::<String>("ms2_paths") {
            input.ms2_paths = Some(paths.cloned().collect());
        }
        if let Some(dir) = matches.get_one::<String>("output_directory") {
            input.output_directory = Some(dir.clone());
        }
        Ok(input)
    }

    pub fn build(self) -> anyhow::Result<Search> {
        if self.use_gpu.unwrap_or(false) {
            anyhow::bail!("this build has no GPU scoring backend");
        }

        let defaults = SearchParams::default();
        let params = SearchParams {
            threads: self.threads.unwrap_or_else(num_cpus::get),
            max_prep_threads: self.max_prep_threads.unwrap_or(defaults.max_prep_threads),
            min_len: self.min_len.unwrap_or(defaults.min_len),
            max_len: self.max_len.unwrap_or(defaults.max_len),
            max_charge: self.max_charge.unwrap_or(defaults.max_charge),
            topmatches: self.topmatches.unwrap_or(defaults.topmatches),
            scale: self.scale.unwrap_or(defaults.scale),
            df: self.df.unwrap_or(defaults.df),
            dm: self.dm.unwrap_or(defaults.dm),
            min_shp: self.min_shp.unwrap_or(defaults.min_shp),
            min_cpsm: self.min_cpsm.unwrap_or(defaults.min_cpsm),
            expect_max: self.expect_max.unwrap_or(defaults.expect_max),
            min_mass: self.min_mass.unwrap_or(defaults.min_mass),
            max_mass: self.max_mass.unwrap_or(defaults.max_mass),
            nodes: self.nodes.unwrap_or(defaults.nodes),
            myid: self.myid.unwrap_or(defaults.myid),
            policy: self.policy.unwrap_or(defaults.policy),
        };
        params
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid parameters: {}", e))?;

        let index = self
            .index
            .ok_or_else(|| anyhow::anyhow!("a fragment index must be provided"))?;
        let ms2_paths = self
            .ms2_paths
            .filter(|paths| !paths.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no MS2 files provided"))?;

        let peers = self.peers.unwrap_or_default();
        if params.nodes > 1 && peers.len() != params.nodes {
            anyhow::bail!(
                "{} nodes configured but {} peer addresses listed",
                params.nodes,
                peers.len()
            );
        }

        Ok(Search {
            version: clap::crate_version!().into(),
            params,
            index: index.into(),
            ms2_paths,
            output_directory: self.output_directory.unwrap_or_else(|| ".".into()).into(),
            peers,
            output_paths: Vec::new(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_applies_defaults_and_validates() {
        let input: Input = serde_json::from_str(
            r#"{
                "index": "db.idx",
                "ms2_paths": ["a.ms2"],
                "dm": 3.5,
                "policy": "zigzag"
            }"#,
        )
        .unwrap();
        let search = input.build().unwrap();
        assert_eq!(search.params.dm, 3.5);
        assert_eq!(search.params.policy, DistPolicy::Zigzag);
        assert_eq!(search.params.topmatches, 10);
    }

    #[test]
    fn gpu_requests_are_rejected() {
        let input: Input = serde_json::from_str(
            r#"{"index": "db.idx", "ms2_paths": ["a.ms2"], "use_gpu": true}"#,
        )
        .unwrap();
        assert!(input.build().is_err());
    }

    #[test]
    fn distributed_config_needs_peer_addresses() {
        let input: Input = serde_json::from_str(
            r#"{"index": "db.idx", "ms2_paths": ["a.ms2"], "nodes": 2, "myid": 0}"#,
        )
        .unwrap();
        assert!(input.build().is_err());
    }

    #[test]
    fn chunk_policy_parses_with_span() {
        let input: Input = serde_json::from_str(
            r#"{
                "index": "db.idx",
                "ms2_paths": ["a.ms2"],
                "policy": {"chunk": {"span": 512}}
            }"#,
        )
        .unwrap();
        let search = input.build().unwrap();
        assert_eq!(search.params.policy, DistPolicy::Chunk { span: 512 });
    }
}
