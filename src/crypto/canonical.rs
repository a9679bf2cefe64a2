//! Canonical JSON encoding
//!
//! Object keys are sorted byte-wise and no whitespace is emitted, so the same
//! value always produces the same bytes regardless of how it was built.
//! `serde_json::Map` is a `BTreeMap` unless the `preserve_order` feature is
//! on, which this crate never enables; compact `Display` output is then
//! already canonical.

use serde::Serialize;
use serde_json::Value;

use super::{hash_bytes, Hash};

/// Encode an already-built JSON value canonically
pub fn canonical_json_value(value: &Value) -> String {
    value.to_string()
}

/// Encode any serializable value canonically
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_json_value(&value))
}

/// SHA-256 of the canonical JSON encoding
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<Hash, serde_json::Error> {
    Ok(hash_bytes(canonical_json(value)?.as_bytes()))
}
