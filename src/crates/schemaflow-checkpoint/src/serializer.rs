//! Typed blob encoding shared by every store backend
//!
//! Channel values and pending writes are stored as a `(type, payload)` pair. `null`
//! is stored as type `"empty"` with no payload; everything else is JSON, base64-encoded
//! so the payload survives any text column unchanged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub const TYPE_EMPTY: &str = "empty";
pub const TYPE_JSON: &str = "json";

/// Serialized form of one channel value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedBlob {
    pub type_tag: String,
    pub payload: Option<String>,
}

impl TypedBlob {
    pub fn is_empty(&self) -> bool {
        self.type_tag == TYPE_EMPTY
    }
}

pub trait SerializerProtocol: Send + Sync {
    fn dumps_typed(&self, value: &Value) -> Result<TypedBlob>;

    fn loads_typed(&self, blob: &TypedBlob) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps_typed(&self, value: &Value) -> Result<TypedBlob> {
        if value.is_null() {
            return Ok(TypedBlob {
                type_tag: TYPE_EMPTY.to_string(),
                payload: None,
            });
        }
        let bytes = serde_json::to_vec(value)?;
        Ok(TypedBlob {
            type_tag: TYPE_JSON.to_string(),
            payload: Some(STANDARD.encode(bytes)),
        })
    }

    fn loads_typed(&self, blob: &TypedBlob) -> Result<Value> {
        match (&blob.payload, blob.is_empty()) {
            (_, true) | (None, _) => Ok(Value::Null),
            (Some(encoded), false) => {
                let bytes = STANDARD.decode(encoded)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}
