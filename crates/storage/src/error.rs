use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to create directory {}", path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to list backup root {}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove backup entry {}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write marker {}", path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to compress {}", path.display())]
    Compress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Pruning stopped part way; `removed` entries are already gone.
    #[error("pruning stopped after removing {} entries", removed.len())]
    Prune {
        removed: Vec<String>,
        #[source]
        source: Box<LifecycleError>,
    },
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;
