//! Error type shared by every factorflow crate.
//!
//! Errors carry a human readable message, a coarse [`ErrorKind`] used by
//! callers to decide what failed (compilation, validation, execution, or
//! misuse of a streaming context), optional structured fields for debugging,
//! and an optional source error.
use std::borrow::Cow;
use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Broad classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed operator graph. Compilation is aborted.
    Compile,
    /// Buffer shape, dtype or layout doesn't match the module. Only the run
    /// being validated is aborted, the module stays usable.
    Shape,
    /// A stage kernel failed while executing.
    Execution,
    /// A streaming context was used incorrectly.
    StreamMisuse,
    /// Everything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Compile => "Compile error",
            Self::Shape => "Shape error",
            Self::Execution => "Execution error",
            Self::StreamMisuse => "Stream misuse",
            Self::Internal => "Internal error",
        };
        write!(f, "{s}")
    }
}

pub struct DbError {
    inner: Box<DbErrorInner>,
}

struct DbErrorInner {
    msg: String,
    kind: ErrorKind,
    fields: Vec<ErrorField>,
    source: Option<Box<dyn Error + Send + Sync>>,
}

struct ErrorField {
    key: Cow<'static, str>,
    value: Box<dyn fmt::Debug + Send + Sync>,
}

impl DbError {
    /// Create a new internal error.
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Internal, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                msg: msg.into(),
                kind,
                fields: Vec::new(),
                source: None,
            }),
        }
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Compile, msg)
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Shape, msg)
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Execution, msg)
    }

    pub fn stream_misuse(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::StreamMisuse, msg)
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    /// Attach a key/value pair that's printed alongside the message.
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<Cow<'static, str>>,
        V: fmt::Debug + Send + Sync + 'static,
    {
        self.inner.fields.push(ErrorField {
            key: key.into(),
            value: Box::new(value),
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn message(&self) -> &str {
        &self.inner.msg
    }

    /// Get the debug representation of a field by key.
    pub fn field(&self, key: &str) -> Option<String> {
        self.inner
            .fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| format!("{:?}", f.value))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.inner.kind, self.inner.msg)?;

        if !self.inner.fields.is_empty() {
            write!(f, " (")?;
            for (idx, field) in self.inner.fields.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {:?}", field.key, field.value)?;
            }
            write!(f, ")")?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Wrap foreign errors with a message.
pub trait ResultExt<T, E> {
    fn context(self, msg: &str) -> Result<T>;
    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Error + Send + Sync + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| DbError::with_source(msg, Box::new(e)))
    }

    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| DbError::with_source(f(), Box::new(e)))
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, what: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::new(format!("Missing required value: {what}"))),
        }
    }
}

/// Return early with a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = std::format!($($arg)+);
        return Err($crate::DbError::new(std::format!("Not yet implemented: {msg}")));
    }};
}
