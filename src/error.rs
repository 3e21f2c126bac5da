use std::path::PathBuf;
use thiserror::Error;

/// Fatal startup errors.
///
/// Only configuration problems are fatal. Everything that can go wrong once
/// the balancer is running (bind, accept, worker connect, relay I/O) is
/// retried or logged in place and never surfaces as an `Error`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read config file `{}`: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file has no [mappings] section")]
    MissingMappings,
}
