use std::{fmt, io};

use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum BlockGraphError {
    #[error("Graph store is closed")]
    Closed,
    #[error("Block graph codec error: {0}")]
    Codec(String),
    #[error("Corrupt file: {0}")]
    Corrupt(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("Sync protocol error: {0}")]
    Protocol(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown type identifier '{0}'")]
    UnknownType(String),
}

impl BlockGraphError {
    /// True for errors raised because stored bytes could not be trusted, as opposed to the
    /// storage itself being unavailable.
    pub fn is_corrupt_data(&self) -> bool {
        matches!(
            self,
            BlockGraphError::Corrupt(_)
                | BlockGraphError::Serialization(_)
                | BlockGraphError::Codec(_)
        )
    }
}

impl From<toml::de::Error> for BlockGraphError {
    fn from(src: toml::de::Error) -> BlockGraphError {
        BlockGraphError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for BlockGraphError {
    fn from(src: toml::ser::Error) -> BlockGraphError {
        BlockGraphError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<ciborium::ser::Error<io::Error>> for BlockGraphError {
    fn from(src: ciborium::ser::Error<io::Error>) -> BlockGraphError {
        BlockGraphError::Serialization(format!("CBOR serialization error: {src}"))
    }
}

impl From<ciborium::de::Error<io::Error>> for BlockGraphError {
    fn from(src: ciborium::de::Error<io::Error>) -> BlockGraphError {
        BlockGraphError::Serialization(format!("CBOR deserialization error: {src}"))
    }
}

impl From<ciborium::value::Error> for BlockGraphError {
    fn from(src: ciborium::value::Error) -> BlockGraphError {
        BlockGraphError::Serialization(format!("CBOR value conversion error: {src}"))
    }
}

impl From<io::Error> for BlockGraphError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => BlockGraphError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => BlockGraphError::PermissionDenied,
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                BlockGraphError::Corrupt(format!("{x}"))
            }
            _ => BlockGraphError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for BlockGraphError {
    fn from(x: fmt::Error) -> Self {
        BlockGraphError::Codec(format!("{x}"))
    }
}

impl From<RegexError> for BlockGraphError {
    fn from(x: RegexError) -> Self {
        BlockGraphError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<walkdir::Error> for BlockGraphError {
    fn from(x: walkdir::Error) -> Self {
        match x.into_io_error() {
            Some(io_error) => io_error.into(),
            None => BlockGraphError::Io("directory walk failed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_by_kind() {
        let missing: BlockGraphError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(missing, BlockGraphError::NotFound(_)));
        let truncated: BlockGraphError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(truncated.is_corrupt_data());
        assert!(!BlockGraphError::Closed.is_corrupt_data());
    }

    #[test]
    fn test_errors_serialize_for_hosts() {
        let err = BlockGraphError::UnknownType("mod:pipe".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"UnknownType":"mod:pipe"}"#);
        assert_eq!(serde_json::from_str::<BlockGraphError>(&json).unwrap(), err);
    }
}
