//! Parsing `--init-data`, `--run-data` and `--path-mapping-rules` values.

use std::fs;
use std::io;
use std::path::PathBuf;

use adaptor_protocol::{PathMapping, Payload};
use serde_json::Value;
use thiserror::Error;

const FILE_SCHEME: &str = "file://";

/// Problems with a data argument.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The `file://` target could not be read.
    #[error("failed to read data file {path}: {source}")]
    Read {
        /// File named by the argument.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The text is not JSON.
    #[error("data is not valid JSON: {source}")]
    Parse {
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The JSON is valid but not an object.
    #[error("data must be a JSON object")]
    NotObject,
    /// The object does not hold valid path mapping rules.
    #[error("invalid path mapping rules: {source}")]
    PathMapping {
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Parses inline JSON or the contents of a `file://` path. A missing
/// argument is an empty object.
pub(crate) fn parse_payload(raw: Option<&str>) -> Result<Payload, PayloadError> {
    let Some(raw) = raw else {
        return Ok(Payload::new());
    };
    let text = match raw.strip_prefix(FILE_SCHEME) {
        Some(path) => fs::read_to_string(path).map_err(|source| PayloadError::Read {
            path: PathBuf::from(path),
            source,
        })?,
        None => raw.to_owned(),
    };
    match serde_json::from_str(&text).map_err(|source| PayloadError::Parse { source })? {
        Value::Object(map) => Ok(map),
        _ => Err(PayloadError::NotObject),
    }
}

/// Parses `{"path_mapping_rules": [...]}` given inline or as a `file://`
/// path. A missing argument means no rules.
pub(crate) fn parse_path_mapping(raw: Option<&str>) -> Result<PathMapping, PayloadError> {
    let payload = parse_payload(raw)?;
    serde_json::from_value(Value::Object(payload)).map_err(|source| PayloadError::PathMapping { source })
}
