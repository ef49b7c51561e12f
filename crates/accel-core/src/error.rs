use thiserror::Error;

/// Failure taxonomy surfaced by the engine.
///
/// Recoverable variants are consumed by the retry loops inside workers;
/// everything that escapes a worker is fatal to the whole run.
#[derive(Debug, Error)]
pub enum AccelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot connect to {host}:{port} as {user} after {attempts} attempts: {message}")]
    Connect {
        host: String,
        port: u16,
        user: String,
        attempts: u32,
        message: String,
    },

    #[error("table `{table}`: row count mismatch (expected {expected}, got {actual})")]
    RowCountMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    #[error("table `{table}`: dump failed after {attempts} attempts")]
    DumpRetriesExhausted { table: String, attempts: u32 },

    #[error("table `{table}`: mysqldump fallback failed after {attempts} attempts")]
    FallbackRetriesExhausted { table: String, attempts: u32 },

    #[error("table `{table}`: bulk load failed: {message}")]
    Load { table: String, message: String },

    #[error("schema apply failed during {stage}: {message}")]
    Schema { stage: String, message: String },
}
