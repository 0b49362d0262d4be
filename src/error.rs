use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` is the error type shared by compaction planning and execution.
/// It is `Clone` so a failure status can be handed to the release path and
/// still be returned to the caller.
#[derive(Clone, Debug)]
pub enum Error {
	Abort,              // The compaction was aborted (shutdown or cancellation)
	Io(Arc<io::Error>), // An I/O error occurred
	Corruption(String), // A table failed validation
	InvalidArgument(String),
	InvalidTableFormat,
	KeyNotInOrder,
	FileNotFound(u64),
	FileAlreadyBeingCompacted(u64),
	FileNotBeingCompacted(u64),
	CompactionReleased(u64),
}

// Implementation of Display trait for Error
impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Abort => write!(f, "Compaction aborted"),
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::Corruption(err) => write!(f, "Data corruption detected: {err}"),
			Error::InvalidArgument(err) => write!(f, "Invalid argument: {err}"),
			Error::InvalidTableFormat => write!(f, "Invalid table format"),
			Error::KeyNotInOrder => write!(f, "Keys are not in order"),
			Error::FileNotFound(number) => write!(f, "File #{number} not found in version"),
			Error::FileAlreadyBeingCompacted(number) => {
				write!(f, "File #{number} is already being compacted")
			}
			Error::FileNotBeingCompacted(number) => {
				write!(f, "File #{number} is not marked as being compacted")
			}
			Error::CompactionReleased(id) => {
				write!(f, "Compaction #{id} has already been released")
			}
		}
	}
}

// Implementation of Error trait for Error
impl std::error::Error for Error {}

// Implementation to convert io::Error into Error
impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(Arc::new(e))
	}
}
