use std::path::PathBuf;

use thiserror::Error;

pub type CloudioResult<T> = Result<T, CloudioError>;

#[derive(Debug, Error)]
pub enum CloudioError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("serializing config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
