use std::{io, path::PathBuf};

use thiserror::Error;

use crate::broker::ports::PortRange;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing '{field}' for {section}")]
    MissingField {
        section: String,
        field: &'static str,
    },
    #[error("port range [{begin}, {end}) is not a valid interval")]
    InvalidPortRange { begin: u16, end: u16 },
    #[error("port ranges {first} and {second} overlap")]
    OverlappingPortRanges { first: PortRange, second: PortRange },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
