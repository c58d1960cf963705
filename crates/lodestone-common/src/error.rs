use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum LodestoneError {
    IoError(std::io::Error),
    /// Persisted structure does not match the expected layout (corrupt
    /// allocation table, malformed level.dat, invalid world directory).
    FormatError(String),
    /// Storage lifecycle failure: a write that cannot be completed, or an
    /// operation on a store that cannot satisfy it.
    StorageError(String),
}

impl fmt::Display for LodestoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LodestoneError::IoError(err) => write!(f, "IO error: {}", err),
            LodestoneError::FormatError(msg) => write!(f, "Format error: {}", msg),
            LodestoneError::StorageError(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl Error for LodestoneError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LodestoneError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LodestoneError {
    fn from(err: std::io::Error) -> Self {
        LodestoneError::IoError(err)
    }
}
