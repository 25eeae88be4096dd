use std::path::{Path, PathBuf};

use thiserror::Error;

/// An IO error that remembers which path it happened at.
///
/// A bare `std::io::Error` saying "permission denied" with no path is
/// useless to the user, so all file operations go through
/// [`IntoIoError::path`] to attach one.
#[derive(Debug, Error)]
#[error("at path: {path:?}\nio error: {error}")]
pub struct IoError {
    pub error: std::io::Error,
    pub path: PathBuf,
}

pub trait IntoIoError<T> {
    fn path(self, path: impl AsRef<Path>) -> Result<T, IoError>;
}

impl<T> IntoIoError<T> for Result<T, std::io::Error> {
    fn path(self, path: impl AsRef<Path>) -> Result<T, IoError> {
        self.map_err(|error| IoError {
            error,
            path: path.as_ref().to_owned(),
        })
    }
}

/// A JSON parse error bundled with (a truncated view of) the document
/// that failed to parse.
#[derive(Debug, Error)]
#[error("json error: {error}\nwhile parsing: {}", truncated(.document))]
pub struct JsonError {
    pub error: serde_json::Error,
    pub document: String,
}

fn truncated(document: &str) -> &str {
    const LIMIT: usize = 256;
    if document.len() <= LIMIT {
        document
    } else {
        let mut end = LIMIT;
        while !document.is_char_boundary(end) {
            end -= 1;
        }
        &document[..end]
    }
}

pub trait IntoJsonError<T> {
    fn json(self, document: String) -> Result<T, JsonError>;
}

impl<T> IntoJsonError<T> for Result<T, serde_json::Error> {
    fn json(self, document: String) -> Result<T, JsonError> {
        self.map_err(|error| JsonError { error, document })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_keeps_path() {
        let res: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        let err = res.path("/tmp/missing.json").unwrap_err();
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn json_error_truncates_long_documents() {
        let doc = "x".repeat(5000);
        let err = serde_json::from_str::<serde_json::Value>(&doc)
            .json(doc)
            .unwrap_err();
        assert!(err.to_string().len() < 1000);
    }
}
