//! Typed encode/decode between user structs and payload values.

use crate::Payload;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Conversion boundary between typed workflow data and [`Payload`] values.
pub trait Codec {
    fn encode<T: Serialize>(value: &T) -> Result<Payload, String>;
    fn decode<T: DeserializeOwned>(payload: &Payload) -> Result<T, String>;
}

/// JSON codec used by the `_typed` context and registry variants.
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(value: &T) -> Result<Payload, String> {
        serde_json::to_value(value).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(payload: &Payload) -> Result<T, String> {
        serde_json::from_value(payload.clone()).map_err(|e| format!("decode: {e}"))
    }
}
