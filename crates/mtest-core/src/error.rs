//! Domain-level error taxonomy for mtest.

/// Errors produced while parsing a server startup banner.
#[derive(Debug, thiserror::Error)]
pub enum BannerError {
    #[error("server banner is missing the word size")]
    MissingBits,

    #[error("server banner is missing the OID width")]
    MissingOids,

    #[error("server banner is missing the module list")]
    MissingModules,

    #[error("server produced no output")]
    Empty,
}

/// mtest domain errors.
#[derive(Debug, thiserror::Error)]
pub enum MtestError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid test name: {0}")]
    InvalidTestName(String),

    #[error("platform probe failed: {0}")]
    Banner(#[from] BannerError),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mtest domain operations.
pub type Result<T> = std::result::Result<T, MtestError>;
