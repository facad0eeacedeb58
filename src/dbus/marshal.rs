//! Conversion between JSON values and D-Bus values.
//!
//! Marshaling is driven by a [`TypeSpec`]: either the signature known from
//! introspection, one supplied by the caller, or one inferred from the shape
//! of the JSON value. Coercions are explicit: numbers must fit the target
//! integer width, objects only become dicts, arrays become arrays or structs.
//!
//! A variant with a specific inner type can be requested with a typed-variant
//! object: `{"$signature": "u", "$value": 5}`.

use serde_json::{Map, Number, Value as Json};
use thiserror::Error;
use zbus::zvariant::{Array, Dict, ObjectPath, Signature, StructureBuilder, Value};

use super::signature::{signature_of, TypeSpec};

/// Key naming the inner signature of a typed-variant object.
pub const TYPED_SIGNATURE_KEY: &str = "$signature";
/// Key holding the inner value of a typed-variant object.
pub const TYPED_VALUE_KEY: &str = "$value";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("expected {expected} for '{signature}', got {found}")]
    TypeMismatch {
        signature: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("value {value} is out of range for '{signature}'")]
    OutOfRange { value: String, signature: String },

    #[error("struct '{signature}' has {expected} fields, got {found}")]
    FieldCount {
        signature: String,
        expected: usize,
        found: usize,
    },

    #[error("expected {expected} arguments, got {found}")]
    ArgumentCount { expected: usize, found: usize },

    #[error("invalid object path '{0}'")]
    InvalidObjectPath(String),

    #[error("invalid signature '{0}'")]
    InvalidSignature(String),

    #[error("unix file descriptors cannot be passed through the API")]
    UnixFd,

    #[error("cannot infer a D-Bus type for null")]
    Null,

    #[error("{0}")]
    Encoding(String),
}

impl From<zbus::zvariant::Error> for MarshalError {
    fn from(err: zbus::zvariant::Error) -> Self {
        MarshalError::Encoding(err.to_string())
    }
}

impl From<MarshalError> for crate::error::Error {
    fn from(err: MarshalError) -> Self {
        crate::error::Error::InvalidParameter(err.to_string())
    }
}

fn kind_of(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn mismatch(spec: &TypeSpec, expected: &'static str, json: &Json) -> MarshalError {
    MarshalError::TypeMismatch {
        signature: spec.to_string(),
        expected,
        found: kind_of(json),
    }
}

fn typed_variant(map: &Map<String, Json>) -> Option<(&str, &Json)> {
    if map.len() != 2 {
        return None;
    }
    let signature = map.get(TYPED_SIGNATURE_KEY)?.as_str()?;
    let value = map.get(TYPED_VALUE_KEY)?;
    Some((signature, value))
}

/// Infer a D-Bus type from the shape of a JSON value.
///
/// Integers become `i` when they fit, `x`/`t` otherwise; other numbers are
/// `d`. Homogeneous arrays keep their element type, mixed ones become `av`.
/// Objects become `a{sv}`.
pub fn infer_type(json: &Json) -> Result<TypeSpec, MarshalError> {
    let spec = match json {
        Json::Null => return Err(MarshalError::Null),
        Json::Bool(_) => TypeSpec::Boolean,
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    TypeSpec::Int32
                } else {
                    TypeSpec::Int64
                }
            } else if n.is_u64() {
                TypeSpec::UInt64
            } else {
                TypeSpec::Double
            }
        }
        Json::String(_) => TypeSpec::String,
        Json::Array(items) => {
            let mut element: Option<TypeSpec> = None;
            for item in items {
                let item_spec = infer_type(item)?;
                match &element {
                    None => element = Some(item_spec),
                    Some(existing) if *existing == item_spec => {}
                    Some(_) => {
                        element = Some(TypeSpec::Variant);
                        break;
                    }
                }
            }
            TypeSpec::Array(Box::new(element.unwrap_or(TypeSpec::String)))
        }
        Json::Object(map) => {
            if typed_variant(map).is_some() {
                TypeSpec::Variant
            } else {
                TypeSpec::Dict(Box::new(TypeSpec::String), Box::new(TypeSpec::Variant))
            }
        }
    };
    Ok(spec)
}

fn zsignature(spec: &TypeSpec) -> Result<Signature, MarshalError> {
    let text = spec.to_string();
    Signature::try_from(text.as_str()).map_err(|_| MarshalError::InvalidSignature(text))
}

fn zsignature_list(types: &[TypeSpec]) -> Result<Signature, MarshalError> {
    let text = signature_of(types);
    Signature::try_from(text.as_str()).map_err(|_| MarshalError::InvalidSignature(text))
}

fn integer_of(json: &Json) -> Option<i128> {
    match json {
        Json::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from)),
        Json::String(s) => s.trim().parse::<i128>().ok(),
        _ => None,
    }
}

fn integer<T>(json: &Json, spec: &TypeSpec) -> Result<T, MarshalError>
where
    T: TryFrom<i128>,
{
    let value = integer_of(json).ok_or_else(|| mismatch(spec, "integer", json))?;
    T::try_from(value).map_err(|_| MarshalError::OutOfRange {
        value: value.to_string(),
        signature: spec.to_string(),
    })
}

/// Convert a JSON value into a D-Bus value of the given type.
pub fn to_value(json: &Json, spec: &TypeSpec) -> Result<Value<'static>, MarshalError> {
    let value = match spec {
        TypeSpec::Byte => Value::U8(integer(json, spec)?),
        TypeSpec::Boolean => match json {
            Json::Bool(b) => Value::Bool(*b),
            other => return Err(mismatch(spec, "boolean", other)),
        },
        TypeSpec::Int16 => Value::I16(integer(json, spec)?),
        TypeSpec::UInt16 => Value::U16(integer(json, spec)?),
        TypeSpec::Int32 => Value::I32(integer(json, spec)?),
        TypeSpec::UInt32 => Value::U32(integer(json, spec)?),
        TypeSpec::Int64 => Value::I64(integer(json, spec)?),
        TypeSpec::UInt64 => Value::U64(integer(json, spec)?),
        TypeSpec::Double => match json {
            Json::Number(n) => Value::F64(n.as_f64().unwrap_or_default()),
            other => return Err(mismatch(spec, "number", other)),
        },
        TypeSpec::String => match json {
            Json::String(s) => Value::from(s.clone()),
            other => return Err(mismatch(spec, "string", other)),
        },
        TypeSpec::ObjectPath => match json {
            Json::String(s) => {
                let path = ObjectPath::try_from(s.clone())
                    .map_err(|_| MarshalError::InvalidObjectPath(s.clone()))?;
                Value::ObjectPath(path)
            }
            other => return Err(mismatch(spec, "object path string", other)),
        },
        TypeSpec::Signature => match json {
            Json::String(s) => {
                // zvariant does not check dict keys, TypeSpec does.
                let types = TypeSpec::parse_list(s)
                    .map_err(|_| MarshalError::InvalidSignature(s.clone()))?;
                Value::Signature(zsignature_list(&types)?)
            }
            other => return Err(mismatch(spec, "signature string", other)),
        },
        TypeSpec::UnixFd => return Err(MarshalError::UnixFd),
        TypeSpec::Variant => {
            let inner = match json {
                Json::Object(map) => match typed_variant(map) {
                    Some((signature, value)) => {
                        let inner_spec = TypeSpec::parse(signature)
                            .map_err(|_| MarshalError::InvalidSignature(signature.to_string()))?;
                        to_value(value, &inner_spec)?
                    }
                    None => to_value(json, &infer_type(json)?)?,
                },
                other => to_value(other, &infer_type(other)?)?,
            };
            Value::Value(Box::new(inner))
        }
        TypeSpec::Array(element) => {
            let mut array = Array::new(&zsignature(element)?);
            match (json, element.as_ref()) {
                (Json::String(s), TypeSpec::Byte) => {
                    for byte in s.bytes() {
                        array.append(Value::U8(byte))?;
                    }
                }
                (Json::Array(items), _) => {
                    for item in items {
                        array.append(to_value(item, element)?)?;
                    }
                }
                (other, _) => return Err(mismatch(spec, "array", other)),
            }
            Value::Array(array)
        }
        TypeSpec::Dict(key, value) => {
            let map = json.as_object().ok_or_else(|| mismatch(spec, "object", json))?;
            let mut dict = Dict::new(&zsignature(key)?, &zsignature(value)?);
            for (k, v) in map {
                dict.append(dict_key(k, key)?, to_value(v, value)?)?;
            }
            Value::Dict(dict)
        }
        TypeSpec::Struct(fields) => {
            let items = json.as_array().ok_or_else(|| mismatch(spec, "array", json))?;
            if items.len() != fields.len() {
                return Err(MarshalError::FieldCount {
                    signature: spec.to_string(),
                    expected: fields.len(),
                    found: items.len(),
                });
            }
            let mut builder = StructureBuilder::new();
            for (item, field) in items.iter().zip(fields) {
                builder = builder.append_field(to_value(item, field)?);
            }
            Value::Structure(builder.build()?)
        }
    };
    Ok(value)
}

/// JSON object keys are always strings; non-string key types are parsed.
fn dict_key(key: &str, spec: &TypeSpec) -> Result<Value<'static>, MarshalError> {
    let json = match spec {
        TypeSpec::String | TypeSpec::ObjectPath | TypeSpec::Signature => {
            Json::String(key.to_string())
        }
        _ => serde_json::from_str(key).unwrap_or_else(|_| Json::String(key.to_string())),
    };
    to_value(&json, spec)
}

/// Marshal a list of call arguments.
///
/// With a known signature the argument count must match exactly; without one
/// each argument's type is inferred.
pub fn to_values(
    args: &[Json],
    signature: Option<&[TypeSpec]>,
) -> Result<Vec<Value<'static>>, MarshalError> {
    match signature {
        Some(types) => {
            if types.len() != args.len() {
                return Err(MarshalError::ArgumentCount {
                    expected: types.len(),
                    found: args.len(),
                });
            }
            args.iter()
                .zip(types)
                .map(|(arg, spec)| to_value(arg, spec))
                .collect()
        }
        None => args
            .iter()
            .map(|arg| to_value(arg, &infer_type(arg)?))
            .collect(),
    }
}

/// Convert a D-Bus value into JSON.
///
/// Variants are unwrapped, structs become arrays, dicts become objects with
/// stringified keys. Non-finite doubles and file descriptors become `null`.
pub fn to_json(value: &Value<'_>) -> Json {
    match value {
        Value::U8(v) => Json::from(*v),
        Value::Bool(v) => Json::Bool(*v),
        Value::I16(v) => Json::from(*v),
        Value::U16(v) => Json::from(*v),
        Value::I32(v) => Json::from(*v),
        Value::U32(v) => Json::from(*v),
        Value::I64(v) => Json::from(*v),
        Value::U64(v) => Json::from(*v),
        Value::F64(v) => Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null),
        Value::Str(s) => Json::String(s.to_string()),
        Value::Signature(s) => Json::String(s.to_string()),
        Value::ObjectPath(p) => Json::String(p.to_string()),
        Value::Value(inner) => to_json(inner),
        Value::Array(array) => Json::Array(array.iter().map(to_json).collect()),
        Value::Dict(dict) => Json::Object(
            dict.iter()
                .map(|(k, v)| (key_string(k), to_json(v)))
                .collect(),
        ),
        Value::Structure(s) => Json::Array(s.fields().iter().map(to_json).collect()),
        #[allow(unreachable_patterns)]
        _ => Json::Null,
    }
}

fn key_string(key: &Value<'_>) -> String {
    match to_json(key) {
        Json::String(s) => s,
        other => other.to_string(),
    }
}
