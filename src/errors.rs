//! Error type and extension traits for `Result`/`Option`.
//!
//! Internal plumbing uses [`Error`]: attach context with `.error(<msg>)?` when
//! propagating an error from an external library, or `.or_error(|| ..)?` to
//! turn an `Option` into a `Result`. Errors that cross the RPC boundary are
//! the typed [`DaemonError`] variants; everything else is recovered locally.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

pub type ErrorMessage = Cow<'static, str>;

type CauseBox = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// An error that occurred somewhere inside the daemon.
#[derive(Debug, Clone)]
pub struct Error {
    pub message: Option<ErrorMessage>,
    pub cause: Option<CauseBox>,
    /// Native path of the device the error happened on, if any.
    pub device: Option<String>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn new<T: Into<ErrorMessage>>(message: T) -> Self {
        Self {
            message: Some(message.into()),
            cause: None,
            device: None,
        }
    }
}

pub trait ErrorContext<T> {
    fn error<M: Into<ErrorMessage>>(self, message: M) -> Result<T>;
    fn or_error<M: Into<ErrorMessage>, F: FnOnce() -> M>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T> for Result<T, E> {
    fn error<M: Into<ErrorMessage>>(self, message: M) -> Result<T> {
        self.map_err(|e| Error {
            message: Some(message.into()),
            cause: Some(Arc::new(e)),
            device: None,
        })
    }

    fn or_error<M: Into<ErrorMessage>, F: FnOnce() -> M>(self, f: F) -> Result<T> {
        self.map_err(|e| Error {
            message: Some(f().into()),
            cause: Some(Arc::new(e)),
            device: None,
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn error<M: Into<ErrorMessage>>(self, message: M) -> Result<T> {
        self.ok_or_else(|| Error::new(message))
    }

    fn or_error<M: Into<ErrorMessage>, F: FnOnce() -> M>(self, f: F) -> Result<T> {
        self.ok_or_else(|| Error::new(f()))
    }
}

pub trait ErrorDevice<T> {
    /// Tag the error with the native path of the device it happened on.
    fn in_device(self, native_path: &str) -> Result<T>;
}

impl<T> ErrorDevice<T> for Result<T> {
    fn in_device(self, native_path: &str) -> Result<T> {
        self.map_err(|mut e| {
            e.device.get_or_insert_with(|| native_path.to_string());
            e
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(device) = &self.device {
            write!(f, "[{device}] ")?;
        }
        f.write_str(self.message.as_deref().unwrap_or("unknown error"))?;
        if let Some(cause) = &self.cause {
            write!(f, " (cause: {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// The client-facing error taxonomy. Only these propagate out of the RPC
/// surface; see the mapping in `rpc`.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("subject '{0}' is not authorized for {1}")]
    AuthDenied(String, &'static str),
    #[error("{0} is not supported on this system")]
    CapabilityMissing(&'static str),
    #[error("helper '{helper}' failed: {detail}")]
    HookFailed { helper: String, detail: String },
    #[error("no such device: {0}")]
    NoSuchDevice(String),
    #[error("{0}")]
    General(#[from] Error),
}
