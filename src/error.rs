use std::fmt::Display;
use std::io;
use std::path::Path;

/// Storage-layer errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The named key or file does not exist.
    NotFound(String),
    /// Malformed on-disk data: a bad block trailer, an entry that decodes
    /// outside its block, or an internal key with an undefined tag.
    Corruption(String),
    /// An underlying filesystem or OS call failed.
    IO(String),
    /// The environment does not implement an optional operation.
    NotSupported(String),
    /// A caller violated an operation's preconditions.
    InvalidArgument(String),
}

impl Error {
    /// An `IO` (or `NotFound`) error carrying the path it concerns.
    pub fn io(context: &Path, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::NotFound {
            return Error::NotFound(context.display().to_string());
        }
        Error::IO(format!("{}: {err}", context.display()))
    }

    /// Whether this is a `Corruption` error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_maps_missing_files_to_not_found() {
        let err = Error::io(
            Path::new("/no/such/file"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, Error::NotFound(_)));

        let err = Error::io(
            Path::new("/dev/full"),
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        assert!(matches!(err, Error::IO(_)));
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::Corruption("bad entry in block".to_string());
        assert_eq!(err.to_string(), "corruption: bad entry in block");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_errcorruption_macro() {
        fn fails() -> Result<()> {
            errcorruption!("restart count {} too large", 99)
        }
        assert_eq!(
            fails(),
            Err(Error::Corruption("restart count 99 too large".to_string()))
        );
    }
}
