//! Search parameters, passed by value to every component rather than held
//! in process-wide state.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::spectrum::QCHUNK;

/// How spectrum ids are assigned to owner nodes for the final E-value fit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistPolicy {
    /// `qid % nodes`
    Cyclic,
    /// Runs of `span` consecutive ids per node, round-robin
    Chunk {
        #[serde(default = "default_span")]
        span: u32,
    },
    /// Boustrophedon sweep over blocks of `nodes` ids
    Zigzag,
}

fn default_span() -> u32 {
    QCHUNK as u32
}

impl Default for DistPolicy {
    fn default() -> Self {
        DistPolicy::Cyclic
    }
}

impl DistPolicy {
    /// Deterministic owner node for a spectrum id.
    pub fn owner(&self, qid: i32, nodes: usize) -> usize {
        let q = qid.max(0) as usize;
        match *self {
            DistPolicy::Cyclic => q % nodes,
            DistPolicy::Chunk { span } => (q / span.max(1) as usize) % nodes,
            DistPolicy::Zigzag => {
                let block = q / nodes;
                let offset = q % nodes;
                if block % 2 == 0 {
                    offset
                } else {
                    nodes - 1 - offset
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Scoring parallelism
    pub threads: usize,
    /// Upper bound on I/O preparation threads (scheduler-governed)
    pub max_prep_threads: usize,
    /// Smallest peptide length to query
    pub min_len: u32,
    /// Largest peptide length to query
    pub max_len: u32,
    /// Maximum fragment charge state stored in the index
    pub max_charge: u32,
    /// Bound of the per-spectrum top-K candidate heap
    pub topmatches: usize,
    /// Integer scaling factor for m/z binning
    pub scale: u32,
    /// Fragment tolerance in bins, applied symmetrically
    pub df: u32,
    /// Precursor tolerance in Da; negative disables the window
    pub dm: f32,
    /// Minimum shared (b + y) peaks for candidacy
    pub min_shp: u16,
    /// Minimum candidate PSMs required to fit a survival model
    pub min_cpsm: u32,
    /// Reporting E-value cutoff
    pub expect_max: f64,
    /// Global precursor mass bounds
    pub min_mass: f32,
    pub max_mass: f32,
    /// Distributed topology
    pub nodes: usize,
    pub myid: usize,
    pub policy: DistPolicy,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            threads: 1,
            max_prep_threads: 1,
            min_len: 6,
            max_len: 40,
            max_charge: 3,
            topmatches: 10,
            scale: 100,
            df: 0,
            dm: 500.0,
            min_shp: 4,
            min_cpsm: 4,
            expect_max: 20.0,
            min_mass: 500.0,
            max_mass: 5000.0,
            nodes: 1,
            myid: 0,
            policy: DistPolicy::Cyclic,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.threads == 0 {
            return Err(EngineError::InvalidParam("threads must be >= 1"));
        }
        if self.max_prep_threads == 0 {
            return Err(EngineError::InvalidParam("max_prep_threads must be >= 1"));
        }
        if self.min_len < 2 || self.max_len < self.min_len {
            return Err(EngineError::InvalidParam("bad peptide length bounds"));
        }
        if self.max_charge == 0 {
            return Err(EngineError::InvalidParam("max_charge must be >= 1"));
        }
        if self.topmatches == 0 {
            return Err(EngineError::InvalidParam("topmatches must be >= 1"));
        }
        if self.scale == 0 {
            return Err(EngineError::InvalidParam("scale must be >= 1"));
        }
        if self.max_mass <= self.min_mass {
            return Err(EngineError::InvalidParam("max_mass must exceed min_mass"));
        }
        if self.expect_max <= 0.0 {
            return Err(EngineError::InvalidParam("expect_max must be positive"));
        }
        if self.nodes == 0 || self.myid >= self.nodes {
            return Err(EngineError::InvalidParam("bad node topology"));
        }
        Ok(())
    }

    pub fn distributed(&self) -> bool {
        self.nodes > 1
    }
}
