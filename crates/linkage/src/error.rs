use std::fmt;

use crate::model::Source;

#[derive(Debug)]
pub enum LinkError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Config validation error (empty block, threshold out of range, etc.).
    ConfigValidation(String),
    /// A match key references a field that cannot be used the way it is configured.
    UnknownField { matchkey: String, field: String },
    /// The same record id appears twice within one source.
    DuplicateRecord { source: Source, record_id: String },
    /// A record listed in the manifest never reached the matcher.
    MissingRecord { source: Source, record_id: String },
    /// A record reached the matcher that the manifest does not list.
    UnexpectedRecord { source: Source, record_id: String },
    /// Missing required column in input data.
    MissingColumn { source: Source, column: String },
    /// Age value is not an integer.
    AgeParse { source: Source, record_id: String, value: String },
    /// A clerical review decision does not fit the cluster it names.
    Review { cluster_id: Option<u32>, message: String },
    /// Final outputs do not partition the record universe.
    Integrity(String),
    /// IO error (file read, CSV decode, etc.).
    Io(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "config validation error: {msg}"),
            Self::UnknownField { matchkey, field } => {
                write!(f, "matchkey '{matchkey}': field '{field}' cannot be used here")
            }
            Self::DuplicateRecord { source, record_id } => {
                write!(f, "{source}: duplicate record id '{record_id}'")
            }
            Self::MissingRecord { source, record_id } => {
                write!(f, "{source}: record '{record_id}' is in the manifest but not in the input")
            }
            Self::UnexpectedRecord { source, record_id } => {
                write!(f, "{source}: record '{record_id}' is not in the manifest")
            }
            Self::MissingColumn { source, column } => {
                write!(f, "{source}: missing column '{column}'")
            }
            Self::AgeParse { source, record_id, value } => {
                write!(f, "{source}, record '{record_id}': cannot parse age '{value}'")
            }
            Self::Review { cluster_id: Some(id), message } => {
                write!(f, "review decision for cluster {id}: {message}")
            }
            Self::Review { cluster_id: None, message } => write!(f, "review decisions: {message}"),
            Self::Integrity(msg) => write!(f, "integrity error: {msg}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for LinkError {}
