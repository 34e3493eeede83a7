// Closed error taxonomy for mapped windows, line cursors, and the CLI surface.
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    OpenFailed,
    StatFailed,
    MapFailed,
    InvalidOffset,
    InvalidPosition,
    NotMapped,
    EndOfFile,
    WriteError,
    Usage,
    Io,
    Internal,
}

impl ErrorKind {
    /// `EndOfFile` ends a stream normally; every other kind is a fault.
    pub fn is_end_of_file(self) -> bool {
        matches!(self, ErrorKind::EndOfFile)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::OpenFailed => 3,
        ErrorKind::StatFailed => 4,
        ErrorKind::MapFailed => 5,
        ErrorKind::InvalidOffset => 6,
        ErrorKind::InvalidPosition => 7,
        ErrorKind::NotMapped => 8,
        ErrorKind::WriteError => 9,
        ErrorKind::Io => 10,
        ErrorKind::EndOfFile => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};
    use std::error::Error as StdError;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::OpenFailed, 3),
            (ErrorKind::StatFailed, 4),
            (ErrorKind::MapFailed, 5),
            (ErrorKind::InvalidOffset, 6),
            (ErrorKind::InvalidPosition, 7),
            (ErrorKind::NotMapped, 8),
            (ErrorKind::WriteError, 9),
            (ErrorKind::Io, 10),
            (ErrorKind::EndOfFile, 0),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::InvalidOffset)
            .with_message("offset beyond end of file")
            .with_path("/tmp/AAPL.csv")
            .with_offset(42);
        let text = err.to_string();
        assert!(text.starts_with("InvalidOffset: offset beyond end of file"));
        assert!(text.contains("(path: /tmp/AAPL.csv)"));
        assert!(text.contains("(offset: 42)"));
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err = Error::new(ErrorKind::OpenFailed).with_source(io);
        assert!(err.source().is_some());
        assert!(!err.kind().is_end_of_file());
        assert!(ErrorKind::EndOfFile.is_end_of_file());
    }
}
