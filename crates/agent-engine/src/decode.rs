use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::api::{ExecMode, JobDescriptor, JobInput, UNKNOWN_JOB_ID};

/// Failure to interpret a leased message body as a job payload.
///
/// Decode failures are per-job failures: the lease is retried until the
/// message exhausts its retry budget.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The content-type hint names a shape the jobs channel does not accept.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    /// No applicable rule produced a JSON value from the body.
    #[error("unable to decode message body: {0}")]
    Undecodable(String),
}

/// Decode a leased message body according to its content-type hint.
///
/// Rules, in order:
/// 1. A body that is already a JSON object is returned as-is.
/// 2. A string body with hint `json` (or no hint) is base64-decoded and
///    JSON-parsed; if that fails, the raw string is JSON-parsed.
/// 3. A string body with hint `text` is JSON-parsed directly.
/// 4. Hint `bytes` is rejected: the jobs channel carries no binary payloads.
/// 5. Everything else is a decode error.
pub fn decode_message_body(body: &Value, content_type: Option<&str>) -> Result<Value, DecodeError> {
    if body.is_object() {
        return Ok(body.clone());
    }

    let Value::String(raw) = body else {
        return Err(DecodeError::Undecodable(body.to_string()));
    };

    match content_type.unwrap_or("") {
        "json" | "" => b64_json(raw)
            .or_else(|| serde_json::from_str(raw).ok())
            .ok_or_else(|| DecodeError::Undecodable(raw.clone())),
        "text" => {
            serde_json::from_str(raw).map_err(|_| DecodeError::Undecodable(raw.clone()))
        }
        other => Err(DecodeError::UnsupportedContentType(other.to_string())),
    }
}

fn b64_json(raw: &str) -> Option<Value> {
    let bytes = B64.decode(raw.as_bytes()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

impl JobDescriptor {
    /// Extract the typed descriptor view from a decoded message body.
    ///
    /// A numeric `job_id` is stringified; a missing one becomes
    /// [`UNKNOWN_JOB_ID`]. A non-object `input` is treated as empty.
    pub fn from_body(body: &Value) -> Result<Self, DecodeError> {
        let obj = body
            .as_object()
            .ok_or_else(|| DecodeError::Undecodable(format!("job payload is not an object: {body}")))?;

        let job_id = match obj.get("job_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => UNKNOWN_JOB_ID.to_string(),
        };

        let raw_input = match obj.get("input") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => Value::Object(serde_json::Map::new()),
        };
        let input: JobInput = serde_json::from_value(raw_input.clone())
            .map_err(|err| DecodeError::Undecodable(format!("bad job input: {err}")))?;

        Ok(Self {
            job_id,
            input,
            raw_input,
        })
    }
}

pub(crate) fn de_exec_mode<'de, D>(deserializer: D) -> Result<ExecMode, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(match raw {
        Value::String(s) if s.eq_ignore_ascii_case("host") => ExecMode::Host,
        _ => ExecMode::Container,
    })
}

pub(crate) fn de_local_files<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(match raw {
        Value::Array(entries) => entries,
        _ => Vec::new(),
    })
}
