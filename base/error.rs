//! A single error type shared across the workspace.
//!
//! Every component surfaces a tagged [`Error`] at its contract boundary
//! (see the error handling design): callers can match on [`ErrorKind`] to
//! decide whether to retry, surface to an operator, or treat as fatal.

use std::fmt;

/// Classifies an [`Error`] for callers that need to decide how to react
/// (retry, surface, abort) without parsing the message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transient I/O or network failure; safe to retry with backoff.
    Transient,
    /// No eligible resource (e.g. no disk has enough free space).
    ResourceExhausted,
    /// A catalog row refers to something missing on disk; skip and continue.
    Integrity,
    /// Invalid argument supplied by a caller.
    InvalidArgument,
    /// The requested entity does not exist.
    NotFound,
    /// The requested entity already exists.
    AlreadyExists,
    /// A schema or invariant violation; the process should abort.
    Invariant,
    /// A dependency (e.g. an upload) has not completed yet; not a failure.
    DependencyNotReady,
    /// A remote service permanently rejected the request (e.g. HTTP 4xx).
    PermanentRejection,
    /// The operation was cancelled.
    Cancelled,
    /// Uncategorized.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::Integrity => "integrity",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Invariant => "invariant violation",
            ErrorKind::DependencyNotReady => "dependency not ready",
            ErrorKind::PermanentRejection => "permanent rejection",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The workspace's general-purpose error type.
///
/// Unlike a plain `anyhow::Error`, this carries an [`ErrorKind`] so the
/// outbound queue, chunk coalescer, etc. can distinguish "retry me" from
/// "abort the process" without string matching.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap<E>(kind: ErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns a `Display`-able value that prints this error plus its full
    /// source chain, one "caused by" line per level. Useful at the top of
    /// `main` where a human reads the message.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = std::error::Error::source(self.0);
        while let Some(c) = cause {
            write!(f, "\ncaused by: {c}")?;
            cause = c.source();
        }
        Ok(())
    }
}

/// Extension methods for attaching an [`ErrorKind`] and message to an
/// arbitrary `Result`.
pub trait ResultExt<T> {
    fn err_kind(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(kind, message, e))
    }
}

/// Builds an [`Error`] of the given kind from a format string, without
/// returning. Mirrors the `err!(Kind, "...")` idiom used throughout this
/// workspace's components.
#[macro_export]
macro_rules! err {
    ($kind:ident, $($arg:tt)*) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($($arg)*))
    };
}

/// Like [`err!`], but returns immediately with `Err(...)`.
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        return Err($crate::err!($kind, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let e = err!(NotFound, "no such disk {}", 42);
        assert_eq!(e.to_string(), "not found: no such disk 42");
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn chain_includes_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "enoent");
        let e = Error::wrap(ErrorKind::Transient, "reading segment", io_err);
        let chained = e.chain().to_string();
        assert!(chained.contains("transient: reading segment"));
        assert!(chained.contains("caused by: enoent"));
    }
}
