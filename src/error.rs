use std::io;

use thiserror::Error;

/// Failure to obtain or attach the shared event region.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid channel name {0:?}: must start with '/' and contain no NUL or further '/'")]
    InvalidName(String),

    #[error("ring capacity {0} is not a power of two >= 2")]
    InvalidCapacity(u64),

    #[error("ring of {0} slots does not fit in the address space")]
    TooLarge(u64),

    #[error("shm_open({name}) failed: {source}")]
    Open { name: String, source: io::Error },

    #[error("sizing {name} to {len} bytes failed: {source}")]
    Resize {
        name: String,
        len: usize,
        source: io::Error,
    },

    #[error("mapping {name} failed: {source}")]
    Map { name: String, source: io::Error },

    #[error("region {name} is {actual} bytes, expected at least {expected}")]
    Truncated {
        name: String,
        actual: usize,
        expected: usize,
    },

    #[error("region {name} holds {existing} slots, requested {requested}")]
    CapacityMismatch {
        name: String,
        existing: u32,
        requested: u32,
    },
}

/// Invalid configuration value or file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Value {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("cannot read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("invalid config file {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Everything that makes load-time installation fail. Always fatal.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("could not resolve the real `{0}`")]
    Unresolved(&'static str),

    #[error("hooks already installed")]
    AlreadyInstalled,

    #[error("registering the fork handler failed: {0}")]
    ForkHandler(io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
