use thiserror::Error;

/// Errors surfaced by the search engine.
///
/// Numerical degeneracies in the survival model are *not* errors - they are
/// ordinary [`crate::survival::FitOutcome`] values and scoring continues.
/// Everything here is either a programming error or a transport failure, and
/// aborts the run when it propagates out of the manager.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required input is missing or inconsistent.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The per-worker scorecard was not sized for the peptide table.
    #[error("scorecard smaller than peptide table ({have} < {need})")]
    InvalidMemory { have: usize, need: usize },

    /// A decoded histogram tail indexes outside the configured bins.
    #[error("decoded tail out of bounds: bins {min}..={max}")]
    InvalidIndex { min: usize, max: usize },

    /// A size or payload exchange with a peer node failed.
    #[error("transfer failed: {0}")]
    TransferFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
