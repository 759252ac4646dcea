//! TSV result writer. Rows arrive already sorted by (file, spectrum,
//! rank), so output is reproducible across runs and thread counts.

use std::path::PathBuf;

use sieve_core::manager::Psm;

use crate::Runner;

impl Runner {
    fn serialize_psm(&self, psm: &Psm, filenames: &[String]) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        record.push_field(filenames[psm.file_id as usize].as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.query_id).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.rank).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.peptide_id).as_bytes());
        record.push_field(ryu::Buffer::new().format(psm.hyperscore).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.shared_ions).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.total_ions).as_bytes());
        record.push_field(ryu::Buffer::new().format(psm.precursor_mass).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.charge).as_bytes());
        record.push_field(ryu::Buffer::new().format(psm.rtime).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.cpsms).as_bytes());
        match psm.evalue {
            Some(evalue) => {
                record.push_field(ryu::Buffer::new().format(evalue).as_bytes());
            }
            // Suppressed: the spectrum had too little distribution data
            None => record.push_field(b""),
        }
        record
    }

    pub fn write_psms(&self, psms: &[Psm], filenames: &[String]) -> anyhow::Result<String> {
        let path = self.make_path(match self.search.params.nodes {
            1 => "results.sieve.tsv".into(),
            _ => format!("results.{}.sieve.tsv", self.search.params.myid),
        });

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&path)?;

        let headers = csv::ByteRecord::from(vec![
            "filename",
            "scannr",
            "rank",
            "peptide_id",
            "hyperscore",
            "shared_ions",
            "total_ions",
            "precursor_mass",
            "charge",
            "rt",
            "cpsms",
            "evalue",
        ]);
        wtr.write_byte_record(&headers)?;

        for psm in psms {
            wtr.write_byte_record(&self.serialize_psm(psm, filenames))?;
        }
        wtr.flush()?;
        Ok(path.display().to_string())
    }

    pub fn make_path(&self, file_name: String) -> PathBuf {
        let mut path = self.search.output_directory.clone();
        path.push(file_name);
        path
    }
}
