use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Parse,
    UnknownAlias,
    UnknownField,
    NotFound,
    Integrity,
    RetryExhausted,
    InvalidInput,
    InvalidState,
    Config,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn unknown_alias(alias: &str) -> Self {
        Error::new(ErrorKind::UnknownAlias, format!("unknown collection alias '{}'", alias))
    }

    pub fn unknown_field(collection: &str, field: &str) -> Self {
        Error::new(
            ErrorKind::UnknownField,
            format!("unknown field '{}' on collection {}", field, collection),
        )
    }

    /// Duplicate keys, broken foreign keys and similar constraint failures
    /// raised by a record store.
    pub fn integrity(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Integrity, context.into())
    }

    pub fn is_parse(&self) -> bool {
        self.kind == ErrorKind::Parse
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Config,
            context: err.to_string(),
        }
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error {
            kind: ErrorKind::Internal,
            context: format!("grammar compilation failed: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
