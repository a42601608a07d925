use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

/// The top-level result type for storage manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the ways a storage manager operation
/// may fail.
#[derive(Debug)]
pub enum Error {
    /// A block, fork or segment container does not exist.
    NotFound(String),
    /// A read, write, sync or metadata operation failed when
    /// interacting with the file system. Reading or writing past
    /// the end of a container also lands here.
    Io(io::Error),
    /// A container was created while one already existed, outside
    /// of recovery or bootstrap processing.
    AlreadyExists(String),
    /// An ownership or lifecycle contract was violated, for instance
    /// using a closed handle or a stale segment file.
    InvalidState(String),
    /// The selected backend does not implement this operation, or
    /// the system has been configured in an unsupported way.
    Unsupported(String),
}

impl Error {
    /// Returns `true` for `Error::NotFound`.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns `true` for `Error::AlreadyExists`.
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Returns `true` for `Error::Io`.
    pub const fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Returns `true` for `Error::InvalidState`.
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }

    /// Returns `true` for `Error::Unsupported`.
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            NotFound(what) => NotFound(what.clone()),
            AlreadyExists(what) => AlreadyExists(what.clone()),
            InvalidState(why) => InvalidState(why.clone()),
            Unsupported(why) => Unsupported(why.clone()),
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (NotFound(l), NotFound(r)) => l == r,
            (AlreadyExists(l), AlreadyExists(r)) => l == r,
            (InvalidState(l), InvalidState(r)) => l == r,
            (Unsupported(l), Unsupported(r)) => l == r,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use self::Error::*;

        match error {
            Io(ioe) => ioe,
            NotFound(what) => io::Error::new(io::ErrorKind::NotFound, what),
            AlreadyExists(what) => {
                io::Error::new(io::ErrorKind::AlreadyExists, what)
            }
            InvalidState(why) => io::Error::new(io::ErrorKind::Other, why),
            Unsupported(why) => io::Error::new(io::ErrorKind::Unsupported, why),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(ioe) => Some(ioe),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            NotFound(ref what) => write!(f, "Not found: {}", what),
            Io(ref e) => write!(f, "IO error: {}", e),
            AlreadyExists(ref what) => write!(f, "Already exists: {}", what),
            InvalidState(ref why) => write!(f, "Invalid state: {}", why),
            Unsupported(ref why) => write!(f, "Unsupported: {}", why),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_never_compare_equal() {
        let a = Error::from(io::Error::new(io::ErrorKind::Other, "a"));
        assert_ne!(a, a.clone());
        assert_eq!(
            Error::NotFound("x".into()),
            Error::NotFound("x".into()).clone()
        );
        assert_ne!(Error::NotFound("x".into()), Error::InvalidState("x".into()));
    }

    #[test]
    fn converts_back_into_io_error_kinds() {
        let ioe: io::Error = Error::NotFound("gone".into()).into();
        assert_eq!(ioe.kind(), io::ErrorKind::NotFound);
        let ioe: io::Error = Error::AlreadyExists("here".into()).into();
        assert_eq!(ioe.kind(), io::ErrorKind::AlreadyExists);
    }
}
