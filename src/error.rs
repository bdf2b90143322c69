use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the index engine. Every failure propagates to the
/// caller of the failing operation; nothing is retried internally.
#[derive(Clone, Debug)]
pub enum Error {
	Io(Arc<io::Error>),
	NullKey,
	UnsupportedType(String),
	TypeMismatch(String),
	CacheUndersized(String),
	CorruptMetadata(String),
	Corruption(String),
	InvalidArgument(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::NullKey => write!(f, "Key must not be empty"),
			Error::UnsupportedType(err) => write!(f, "Unsupported type: {err}"),
			Error::TypeMismatch(err) => write!(f, "Type mismatch: {err}"),
			Error::CacheUndersized(err) => write!(f, "Node cache undersized: {err}"),
			Error::CorruptMetadata(err) => write!(f, "Corrupt tree metadata: {err}"),
			Error::Corruption(err) => write!(f, "Data corruption detected: {err}"),
			Error::InvalidArgument(err) => write!(f, "Invalid argument: {err}"),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(Arc::new(e))
	}
}
