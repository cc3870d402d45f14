use std::path::PathBuf;

/// Error returned from light-curve loading, reconstruction engines and drivers
#[derive(Debug, thiserror::Error)]
pub enum PixonError {
    #[error("cannot access \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("\"{path}\", record {record}: expected `time flux error` columns")]
    MalformedRecord { path: PathBuf, record: usize },

    #[error("observation times must be strictly increasing (sample {0})")]
    UnsortedTimes(usize),

    #[error("flux uncertainties must be positive (sample {0})")]
    BadUncertainty(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("matrix is not positive definite in {0}")]
    NotPositiveDefinite(&'static str),

    #[error("non-finite {0} encountered")]
    NonFinite(&'static str),

    #[error("\"{path}\": {message}")]
    PosteriorSample { path: PathBuf, message: String },
}
