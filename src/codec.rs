//! Stateless conversion between the textual intermediate encoding (a JSON
//! object) and the compact binary encoding: field keys are dropped and the
//! values are laid out positionally in descriptor order, then packed as
//! MessagePack. Nested object fields recurse into nested arrays; absent
//! optional fields are packed as nil.

use crate::descriptor::{CompiledField, SchemaDescriptor, Shape};
use crate::error::{ReduceError, Result};
use crate::protocol::FieldKind;
use bytes::Bytes;
use serde_json::{Map, Value};

/// Map JSON object bytes onto the descriptor's shape and pack the result.
///
/// A structural mismatch (non-object root, missing required field, kind
/// mismatch, unknown field) fails with an error the caller treats as
/// recoverable: the original bytes are emitted unmodified and the attempt
/// is counted as a failed reduction.
pub fn encode(text: &[u8], descriptor: &SchemaDescriptor) -> Result<Bytes> {
    let value: Value = serde_json::from_slice(text)?;

    let map = value.as_object().ok_or_else(|| {
        ReduceError::Encode("payload root is not an object".to_string())
    })?;

    let packed = Value::Array(pack_object(descriptor.root(), map)?);
    let binary = rmp_serde::to_vec(&packed)?;

    Ok(Bytes::from(binary))
}

/// Inverse of [`encode`]: unpack a positional MessagePack array back into
/// the JSON object it was reduced from.
pub fn decode(binary: &[u8], descriptor: &SchemaDescriptor) -> Result<Bytes> {
    let value: Value = rmp_serde::from_slice(binary)?;

    let items = value.as_array().ok_or_else(|| {
        ReduceError::Decode("payload root is not an array".to_string())
    })?;

    let map = unpack_object(descriptor.root(), items)?;
    let text = serde_json::to_vec(&Value::Object(map))?;

    Ok(Bytes::from(text))
}

fn pack_object(shape: &Shape, map: &Map<String, Value>) -> Result<Vec<Value>> {
    for key in map.keys() {
        if !shape.fields.iter().any(|f| f.name == *key) {
            return Err(ReduceError::Encode(format!("unknown field '{}'", key)));
        }
    }

    shape
        .fields
        .iter()
        .map(|field| match map.get(&field.name) {
            None | Some(Value::Null) => {
                if field.optional {
                    Ok(Value::Null)
                } else {
                    Err(ReduceError::Encode(
                        format!("missing required field '{}'", field.name)
                    ))
                }
            }
            Some(value) => pack_value(field, value),
        })
        .collect()
}

fn pack_value(field: &CompiledField, value: &Value) -> Result<Value> {
    match field.kind {
        FieldKind::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("encode", field, value)),
        },
        FieldKind::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            _ => Err(kind_mismatch("encode", field, value)),
        },
        FieldKind::Float => match value {
            Value::Number(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("encode", field, value)),
        },
        FieldKind::String => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("encode", field, value)),
        },
        FieldKind::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("encode", field, value)),
        },
        FieldKind::Object => {
            let map = value
                .as_object()
                .ok_or_else(|| kind_mismatch("encode", field, value))?;

            match &field.nested {
                Some(nested) => Ok(Value::Array(pack_object(nested, map)?)),
                None => Err(ReduceError::Encode(
                    format!("object field '{}' has no shape", field.name)
                )),
            }
        }
    }
}

fn unpack_object(shape: &Shape, items: &[Value]) -> Result<Map<String, Value>> {
    if items.len() != shape.fields.len() {
        return Err(ReduceError::Decode(format!(
            "expected {} fields, got {}",
            shape.fields.len(),
            items.len()
        )));
    }

    let mut map = Map::new();

    for (field, item) in shape.fields.iter().zip(items) {
        match item {
            Value::Null => {
                if !field.optional {
                    return Err(ReduceError::Decode(
                        format!("missing required field '{}'", field.name)
                    ));
                }
            }
            value => {
                map.insert(field.name.clone(), unpack_value(field, value)?);
            }
        }
    }

    Ok(map)
}

fn unpack_value(field: &CompiledField, value: &Value) -> Result<Value> {
    match field.kind {
        FieldKind::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("decode", field, value)),
        },
        FieldKind::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            _ => Err(kind_mismatch("decode", field, value)),
        },
        FieldKind::Float => match value {
            Value::Number(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("decode", field, value)),
        },
        FieldKind::String => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("decode", field, value)),
        },
        FieldKind::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(kind_mismatch("decode", field, value)),
        },
        FieldKind::Object => {
            let items = value
                .as_array()
                .ok_or_else(|| kind_mismatch("decode", field, value))?;

            match &field.nested {
                Some(nested) => Ok(Value::Object(unpack_object(nested, items)?)),
                None => Err(ReduceError::Decode(
                    format!("object field '{}' has no shape", field.name)
                )),
            }
        }
    }
}

fn kind_mismatch(op: &str, field: &CompiledField, value: &Value) -> ReduceError {
    let message = format!(
        "field '{}' expects {:?}, got {}",
        field.name,
        field.kind,
        value_name(value)
    );

    match op {
        "encode" => ReduceError::Encode(message),
        _ => ReduceError::Decode(message),
    }
}

fn value_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FieldDef, ShapeDef};

    fn descriptor() -> SchemaDescriptor {
        let def = ShapeDef {
            fields: vec![
                FieldDef::new("id", FieldKind::Int),
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("score", FieldKind::Float).optional(),
                FieldDef::new("tags", FieldKind::Array).optional(),
                FieldDef::new("pos", FieldKind::Object).with_fields(vec![
                    FieldDef::new("x", FieldKind::Float),
                    FieldDef::new("y", FieldKind::Float),
                ]),
            ],
        };

        SchemaDescriptor::compile("s1", &def).unwrap()
    }

    fn roundtrip(descriptor: &SchemaDescriptor, text: &str) -> Value {
        let encoded = encode(text.as_bytes(), descriptor).unwrap();
        let decoded = decode(&encoded, descriptor).unwrap();
        serde_json::from_slice(&decoded).unwrap()
    }

    #[test]
    fn test_roundtrip_full_payload() {
        let descriptor = descriptor();
        let text = r#"{"id": 7, "name": "probe", "score": 0.5, "tags": ["a", "b"], "pos": {"x": 1.5, "y": -2.5}}"#;

        let output = roundtrip(&descriptor, text);
        let input: Value = serde_json::from_str(text).unwrap();

        assert_eq!(input, output);
    }

    #[test]
    fn test_roundtrip_omits_absent_optionals() {
        let descriptor = descriptor();
        let text = r#"{"id": 7, "name": "probe", "pos": {"x": 1.5, "y": -2.5}}"#;

        let output = roundtrip(&descriptor, text);
        let input: Value = serde_json::from_str(text).unwrap();

        assert_eq!(input, output);
    }

    #[test]
    fn test_encode_is_smaller_than_text() {
        let descriptor = descriptor();
        let text = r#"{"id": 7, "name": "probe", "score": 0.5, "tags": ["a"], "pos": {"x": 1.5, "y": -2.5}}"#;

        let encoded = encode(text.as_bytes(), &descriptor).unwrap();

        assert!(encoded.len() < text.len());
    }

    #[test]
    fn test_encode_rejects_missing_required_field() {
        let descriptor = descriptor();
        let text = r#"{"id": 7, "pos": {"x": 1.0, "y": 2.0}}"#;

        assert!(matches!(
            encode(text.as_bytes(), &descriptor),
            Err(ReduceError::Encode(_))
        ));
    }

    #[test]
    fn test_encode_rejects_unknown_field() {
        let descriptor = descriptor();
        let text = r#"{"id": 7, "name": "probe", "pos": {"x": 1.0, "y": 2.0}, "extra": 1}"#;

        assert!(matches!(
            encode(text.as_bytes(), &descriptor),
            Err(ReduceError::Encode(_))
        ));
    }

    #[test]
    fn test_encode_rejects_kind_mismatch() {
        let descriptor = descriptor();
        let text = r#"{"id": "seven", "name": "probe", "pos": {"x": 1.0, "y": 2.0}}"#;

        assert!(matches!(
            encode(text.as_bytes(), &descriptor),
            Err(ReduceError::Encode(_))
        ));
    }

    #[test]
    fn test_encode_rejects_non_object_root() {
        let descriptor = descriptor();

        assert!(encode(b"[1, 2, 3]", &descriptor).is_err());
        assert!(encode(b"not json at all", &descriptor).is_err());
    }

    #[test]
    fn test_encode_rejects_null_in_required_field() {
        let descriptor = descriptor();
        let text = r#"{"id": null, "name": "probe", "pos": {"x": 1.0, "y": 2.0}}"#;

        assert!(encode(text.as_bytes(), &descriptor).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        let descriptor = descriptor();
        let packed = rmp_serde::to_vec(&serde_json::json!([1, "x"])).unwrap();

        assert!(matches!(
            decode(&packed, &descriptor),
            Err(ReduceError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let descriptor = descriptor();

        assert!(decode(b"\xff\xff\xff", &descriptor).is_err());
    }

    #[test]
    fn test_decode_rejects_kind_mismatch() {
        let descriptor = descriptor();
        let packed =
            rmp_serde::to_vec(&serde_json::json!(["seven", "probe", null, null, [1.0, 2.0]]))
                .unwrap();

        assert!(matches!(
            decode(&packed, &descriptor),
            Err(ReduceError::Decode(_))
        ));
    }

    #[test]
    fn test_concurrent_encode_decode() {
        use std::sync::Arc;
        use std::thread;

        let descriptor = Arc::new(descriptor());
        let text = r#"{"id": 7, "name": "probe", "pos": {"x": 1.5, "y": -2.5}}"#;
        let expected = encode(text.as_bytes(), &descriptor).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let descriptor = Arc::clone(&descriptor);
                let expected = expected.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let encoded = encode(text.as_bytes(), &descriptor).unwrap();
                        assert_eq!(encoded, expected);
                        decode(&encoded, &descriptor).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
