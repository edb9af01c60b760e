//! Payloads exchanged with the broker
//!
//! Upstream: measurepoint posts and service replies. Downstream: service
//! requests of the form `{"id", "method": "thing.service.<name>", "params"}`,
//! flattened into one [`ServiceCommand`] per parameter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MEASUREPOINT_METHOD: &str = "thing.measurepoint.post";
pub const PROTOCOL_VERSION: &str = "1.0";
pub const SERVICE_METHOD_PREFIX: &str = "thing.service.";
pub const SUCCESS_CODE: u16 = 200;

/// Placeholder used when an incoming field is missing
const MISSING: &str = "invalid";

/// Telemetry packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurePointPost {
    pub id: String,
    pub version: String,
    pub params: MeasurePoints,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurePoints {
    pub measurepoints: BTreeMap<String, f64>,
}

impl MeasurePointPost {
    pub fn new(device_id: &str, readings: BTreeMap<String, f64>) -> Self {
        Self {
            id: device_id.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            params: MeasurePoints {
                measurepoints: readings,
            },
            method: MEASUREPOINT_METHOD.to_string(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Acknowledgement of a service request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReply {
    pub id: String,
    pub code: u16,
    pub data: BTreeMap<String, String>,
}

impl ServiceReply {
    /// Successful reply carrying a single `"<message>": "true"` entry
    pub fn success(msg_id: &str, message: &str) -> Self {
        Self {
            id: msg_id.to_string(),
            code: SUCCESS_CODE,
            data: BTreeMap::from([(message.to_string(), "true".to_string())]),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A service reply together with the service it answers
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReply {
    pub endpoint: String,
    pub reply: ServiceReply,
}

/// One parameter of an incoming service request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCommand {
    pub endpoint: String,
    pub msg_id: String,
    pub param: String,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed service message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Service message is not a JSON object")]
    NotAnObject,
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Remove the first `thing.service.` marker from a method name
pub fn endpoint_from_method(method: &str) -> String {
    match method.find(SERVICE_METHOD_PREFIX) {
        Some(at) => {
            let mut endpoint = method.to_string();
            endpoint.replace_range(at..at + SERVICE_METHOD_PREFIX.len(), "");
            endpoint
        }
        None => method.to_string(),
    }
}

/// Flatten a service request into one command per parameter
pub fn parse_service_message(payload: &[u8]) -> Result<Vec<ServiceCommand>, MessageError> {
    let root: Value = serde_json::from_slice(payload)?;
    let root = root.as_object().ok_or(MessageError::NotAnObject)?;

    let msg_id = root.get("id").map(value_as_text).unwrap_or_else(|| MISSING.to_string());
    let endpoint = root
        .get("method")
        .map(value_as_text)
        .map(|m| endpoint_from_method(&m))
        .unwrap_or_else(|| MISSING.to_string());

    let empty = Map::new();
    let params = root.get("params").and_then(Value::as_object).unwrap_or(&empty);

    Ok(params
        .iter()
        .map(|(param, value)| ServiceCommand {
            endpoint: endpoint.clone(),
            msg_id: msg_id.clone(),
            param: param.clone(),
            value: value_as_text(value),
        })
        .collect())
}
