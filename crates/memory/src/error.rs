use thiserror::Error;

/// Failure categories the coordinator must distinguish when deciding whether
/// to retry, degrade, or surface.  Everything else travels as `anyhow`
/// context on the ordinary result path.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Fatal to the current operation; prior state is intact.
    #[error("filesystem write failed: {0}")]
    StoreWrite(String),

    /// Non-fatal: the session degrades to filesystem-only linear scans.
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// The LLM reply could not be parsed as structured JSON.  Tolerated —
    /// the handler falls back to a degraded record.
    #[error("malformed structured response: {0}")]
    MalformedResponse(String),

    /// LLM or embedding transport failure; aborts the current call.
    #[error("port transport failure: {0}")]
    Transport(String),
}
