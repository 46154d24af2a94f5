use std::fmt;

/// Tagged error kind used throughout the crate, matching the vocabulary a
/// remote caller would see as a numeric error code over the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Success,
    Unknown,
    InvalidValue,
    InvalidPath,
    InvalidProperty,
    InvalidState,
    InvalidData,
    Permission,
    NotFound,
    AlreadyExists,
    Busy,
    NoSpace,
    Queued,
    ContainerDoesNotExist,
    ContainerAlreadyExists,
    VolumeAlreadyExists,
    VolumeNotFound,
    LayerAlreadyExists,
    LayerNotFound,
    HasChildren,
    TooMany,
    TaskFailed,
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Wire-stable ordering for the double-pipe child-setup protocol. Not the
/// same as the enum's declaration order so that inserting a new variant
/// above never renumbers an already-deployed wire value.
const WIRE_KINDS: &[ErrorKind] = &[
    ErrorKind::Success,
    ErrorKind::Unknown,
    ErrorKind::InvalidValue,
    ErrorKind::InvalidPath,
    ErrorKind::InvalidProperty,
    ErrorKind::InvalidState,
    ErrorKind::InvalidData,
    ErrorKind::Permission,
    ErrorKind::NotFound,
    ErrorKind::AlreadyExists,
    ErrorKind::Busy,
    ErrorKind::NoSpace,
    ErrorKind::Queued,
    ErrorKind::ContainerDoesNotExist,
    ErrorKind::ContainerAlreadyExists,
    ErrorKind::VolumeAlreadyExists,
    ErrorKind::VolumeNotFound,
    ErrorKind::LayerAlreadyExists,
    ErrorKind::LayerNotFound,
    ErrorKind::HasChildren,
    ErrorKind::TooMany,
    ErrorKind::TaskFailed,
    ErrorKind::System,
];

impl ErrorKind {
    pub(crate) fn to_wire(self) -> u32 {
        WIRE_KINDS.iter().position(|k| *k == self).unwrap_or(0) as u32
    }

    pub(crate) fn from_wire(value: u32) -> Self {
        WIRE_KINDS
            .get(value as usize)
            .copied()
            .unwrap_or(ErrorKind::Unknown)
    }
}

/// Single tagged error value carried across every fallible operation in the
/// crate: kind, optional errno, message. Upper layers wrap with additional
/// context via [`Error::context`] but never discard the original kind.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}{}", errno.map(|e| format!(" ({e})")).unwrap_or_default())]
pub struct Error {
    kind: ErrorKind,
    errno: Option<nix::errno::Errno>,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_errno(kind: ErrorKind, errno: nix::errno::Errno, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno: Some(errno),
            message: message.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_errno(mut self, errno: nix::errno::Errno) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn errno(&self) -> Option<nix::errno::Errno> {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wraps this error with additional context while preserving `kind`.
    pub fn context(self, message: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            errno: self.errno,
            message: message.into(),
            source: Some(Box::new(self)),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::from_errno(ErrorKind::System, errno, errno.desc().to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            _ => ErrorKind::System,
        };
        let errno = err.raw_os_error().map(nix::errno::Errno::from_raw);
        Self {
            kind,
            errno,
            message: err.to_string(),
            source: None,
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::new(ErrorKind::InvalidData, err.to_string())
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(err: std::ffi::NulError) -> Self {
        Self::new(ErrorKind::InvalidValue, err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::new(ErrorKind::InvalidValue, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidData, err.to_string())
    }
}

/// Swallows an expected `std::io::ErrorKind`, propagates everything else
/// as a tagged [`Error`].
pub fn ignore_io(result: std::io::Result<()>, kind: std::io::ErrorKind) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == kind => Ok(()),
        Err(err) => Err(err.into()),
    }
}
