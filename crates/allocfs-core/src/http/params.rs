//! Query-parameter validation.
//!
//! Every endpoint validates its parameters here before touching the
//! filesystem or opening a stream. Nothing in this module performs I/O.

use std::collections::HashMap;

use crate::error::CodedError;
use crate::rpc::{LogType, LogsRequest, Origin};

/// Parsed query string.
pub type QueryParams = HashMap<String, String>;

/// A request parameter was missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("must provide a valid alloc id")]
    AllocIdMissing,

    #[error("must provide a file name")]
    FileNameMissing,

    #[error("must provide task name")]
    TaskMissing,

    #[error("must provide log type (stdout/stderr)")]
    LogTypeMissing,

    #[error("origin must be start or end")]
    InvalidOrigin,

    #[error("failed to parse {field} field to boolean: {value:?}")]
    InvalidBool { field: &'static str, value: String },

    #[error("failed to parse {field} field to integer: {value:?}")]
    InvalidInt { field: &'static str, value: String },

    #[error("{field} must not be negative")]
    Negative { field: &'static str },
}

impl From<ParamError> for CodedError {
    fn from(err: ParamError) -> Self {
        CodedError::new(400, err.to_string())
    }
}

/// Parse a boolean the way `strconv.ParseBool` does: `1 t T TRUE true True`
/// and `0 f F FALSE false False`.
pub fn parse_bool_str(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn non_empty<'a>(query: &'a QueryParams, key: &str) -> Option<&'a str> {
    query.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Optional boolean, false when absent or empty.
pub fn bool_param(query: &QueryParams, field: &'static str) -> Result<bool, ParamError> {
    match non_empty(query, field) {
        None => Ok(false),
        Some(value) => parse_bool_str(value).ok_or_else(|| ParamError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

/// Optional signed integer.
pub fn int_param(query: &QueryParams, field: &'static str) -> Result<Option<i64>, ParamError> {
    non_empty(query, field)
        .map(|value| {
            value.parse::<i64>().map_err(|_| ParamError::InvalidInt {
                field,
                value: value.to_string(),
            })
        })
        .transpose()
}

/// The allocation id taken from the request path.
pub fn alloc_id(raw: &str) -> Result<String, ParamError> {
    if raw.is_empty() {
        return Err(ParamError::AllocIdMissing);
    }
    Ok(raw.to_string())
}

/// `path` for `ls`, defaulting to the allocation root.
pub fn list_path(query: &QueryParams) -> String {
    non_empty(query, "path").unwrap_or("/").to_string()
}

/// Required `path` for `stat` and `cat`.
pub fn file_path(query: &QueryParams) -> Result<String, ParamError> {
    non_empty(query, "path")
        .map(str::to_string)
        .ok_or(ParamError::FileNameMissing)
}

/// Parameters of a `readat` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAtParams {
    pub path: String,
    pub offset: u64,
    /// Maximum bytes to return; `None` reads to end-of-file.
    pub limit: Option<u64>,
}

impl ReadAtParams {
    pub fn parse(query: &QueryParams) -> Result<Self, ParamError> {
        let path = file_path(query)?;
        let offset = match int_param(query, "offset")? {
            Some(offset) => {
                u64::try_from(offset).map_err(|_| ParamError::Negative { field: "offset" })?
            }
            None => {
                return Err(ParamError::InvalidInt {
                    field: "offset",
                    value: String::new(),
                });
            }
        };
        let limit = int_param(query, "limit")?
            .filter(|&limit| limit > 0)
            .map(i64::unsigned_abs);
        Ok(Self {
            path,
            offset,
            limit,
        })
    }
}

/// Build a [`LogsRequest`] from a `logs` query.
pub fn logs_request(
    alloc: &str,
    query: &QueryParams,
    auth_token: Option<&str>,
) -> Result<LogsRequest, ParamError> {
    let alloc_id = alloc_id(alloc)?;
    let task = non_empty(query, "task").ok_or(ParamError::TaskMissing)?;
    let follow = bool_param(query, "follow")?;
    let plain_text = bool_param(query, "plain")?;

    let log_type = non_empty(query, "type")
        .and_then(|value| value.parse::<LogType>().ok())
        .ok_or(ParamError::LogTypeMissing)?;

    let origin = match non_empty(query, "origin") {
        None => Origin::Start,
        Some(value) => value
            .parse::<Origin>()
            .map_err(|()| ParamError::InvalidOrigin)?,
    };
    let offset = int_param(query, "offset")?.unwrap_or(0);

    let mut request = LogsRequest::new(alloc_id, task, log_type);
    request.follow = follow;
    request.plain_text = plain_text;
    request.origin = origin;
    request.offset = offset;
    request.auth_token = auth_token.unwrap_or_default().to_string();
    Ok(request)
}
