//! D-Bus type signatures as an explicit tagged type.
//!
//! Signatures from introspection data (`as`, `a{sv}`, `(uso)`, ...) are parsed
//! by zvariant and converted into [`TypeSpec`] trees, which drive argument
//! marshaling.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zbus::zvariant::Signature;

/// Maximum signature length allowed by the D-Bus specification.
pub const MAX_SIGNATURE_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is empty")]
    Empty,

    #[error("signature exceeds {MAX_SIGNATURE_LEN} bytes")]
    TooLong,

    #[error("invalid signature '{0}'")]
    Invalid(String),

    #[error("dict key '{0}' must be a basic type")]
    NonBasicKey(String),

    #[error("type '{0}' is not supported on D-Bus")]
    Unsupported(String),

    #[error("expected a single complete type, found {0}")]
    NotSingle(usize),
}

/// A single complete D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSpec {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
    Array(Box<TypeSpec>),
    Dict(Box<TypeSpec>, Box<TypeSpec>),
    Struct(Vec<TypeSpec>),
}

impl TypeSpec {
    /// Parse a signature holding any number of complete types.
    ///
    /// The empty signature is valid and yields no types.
    pub fn parse_list(signature: &str) -> Result<Vec<TypeSpec>, SignatureError> {
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }
        let parsed = Signature::from_str(signature)
            .map_err(|_| SignatureError::Invalid(signature.to_string()))?;

        // zvariant folds several top-level types into one structure, so
        // `is` and `(is)` only differ in their rendered length.
        match &parsed {
            Signature::Unit => Ok(Vec::new()),
            Signature::Structure(fields) if parsed.string_len() != signature.len() => {
                fields.iter().map(TypeSpec::try_from).collect()
            }
            single => Ok(vec![TypeSpec::try_from(single)?]),
        }
    }

    /// Parse a signature that must contain exactly one complete type.
    pub fn parse(signature: &str) -> Result<TypeSpec, SignatureError> {
        let mut types = Self::parse_list(signature)?;
        match types.len() {
            0 => Err(SignatureError::Empty),
            1 => Ok(types.remove(0)),
            n => Err(SignatureError::NotSingle(n)),
        }
    }

    /// Basic types are the fixed and string-like types usable as dict keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            TypeSpec::Variant | TypeSpec::Array(_) | TypeSpec::Dict(_, _) | TypeSpec::Struct(_)
        )
    }
}

impl TryFrom<&Signature> for TypeSpec {
    type Error = SignatureError;

    fn try_from(signature: &Signature) -> Result<Self, Self::Error> {
        Ok(match signature {
            Signature::U8 => TypeSpec::Byte,
            Signature::Bool => TypeSpec::Boolean,
            Signature::I16 => TypeSpec::Int16,
            Signature::U16 => TypeSpec::UInt16,
            Signature::I32 => TypeSpec::Int32,
            Signature::U32 => TypeSpec::UInt32,
            Signature::I64 => TypeSpec::Int64,
            Signature::U64 => TypeSpec::UInt64,
            Signature::F64 => TypeSpec::Double,
            Signature::Str => TypeSpec::String,
            Signature::ObjectPath => TypeSpec::ObjectPath,
            Signature::Signature => TypeSpec::Signature,
            #[cfg(unix)]
            Signature::Fd => TypeSpec::UnixFd,
            Signature::Variant => TypeSpec::Variant,
            Signature::Array(element) => {
                TypeSpec::Array(Box::new(TypeSpec::try_from(&**element)?))
            }
            Signature::Dict { key, value } => {
                let key_spec = TypeSpec::try_from(&**key)?;
                if !key_spec.is_basic() {
                    return Err(SignatureError::NonBasicKey(key.to_string()));
                }
                TypeSpec::Dict(Box::new(key_spec), Box::new(TypeSpec::try_from(&**value)?))
            }
            Signature::Structure(fields) => TypeSpec::Struct(
                fields
                    .iter()
                    .map(TypeSpec::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            other => return Err(SignatureError::Unsupported(other.to_string())),
        })
    }
}

/// Render a list of types back into one signature string.
pub fn signature_of(types: &[TypeSpec]) -> String {
    types.iter().map(ToString::to_string).collect()
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Byte => f.write_str("y"),
            TypeSpec::Boolean => f.write_str("b"),
            TypeSpec::Int16 => f.write_str("n"),
            TypeSpec::UInt16 => f.write_str("q"),
            TypeSpec::Int32 => f.write_str("i"),
            TypeSpec::UInt32 => f.write_str("u"),
            TypeSpec::Int64 => f.write_str("x"),
            TypeSpec::UInt64 => f.write_str("t"),
            TypeSpec::Double => f.write_str("d"),
            TypeSpec::String => f.write_str("s"),
            TypeSpec::ObjectPath => f.write_str("o"),
            TypeSpec::Signature => f.write_str("g"),
            TypeSpec::UnixFd => f.write_str("h"),
            TypeSpec::Variant => f.write_str("v"),
            TypeSpec::Array(element) => write!(f, "a{}", element),
            TypeSpec::Dict(key, value) => write!(f, "a{{{}{}}}", key, value),
            TypeSpec::Struct(fields) => write!(f, "({})", signature_of(fields)),
        }
    }
}

impl FromStr for TypeSpec {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TypeSpec::parse(s)
    }
}

impl Serialize for TypeSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TypeSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TypeSpec::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_types() {
        assert_eq!(TypeSpec::parse("s").unwrap(), TypeSpec::String);
        assert_eq!(TypeSpec::parse("t").unwrap(), TypeSpec::UInt64);
        assert_eq!(TypeSpec::parse("h").unwrap(), TypeSpec::UnixFd);
        assert_eq!(TypeSpec::parse("v").unwrap(), TypeSpec::Variant);
    }

    #[test]
    fn test_parse_containers() {
        assert_eq!(
            TypeSpec::parse("a{sv}").unwrap(),
            TypeSpec::Dict(Box::new(TypeSpec::String), Box::new(TypeSpec::Variant))
        );
        assert_eq!(
            TypeSpec::parse("a(uso)").unwrap(),
            TypeSpec::Array(Box::new(TypeSpec::Struct(vec![
                TypeSpec::UInt32,
                TypeSpec::String,
                TypeSpec::ObjectPath,
            ])))
        );
    }

    #[test]
    fn test_parse_list() {
        let types = TypeSpec::parse_list("sa{sv}as").unwrap();
        assert_eq!(types.len(), 3);
        assert_eq!(signature_of(&types), "sa{sv}as");
        assert!(TypeSpec::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_display_matches_input() {
        for sig in ["a{oa{sa{sv}}}", "(ia(sv))", "aay", "a{ys}"] {
            assert_eq!(TypeSpec::parse(sig).unwrap().to_string(), sig);
        }
    }

    #[test]
    fn test_reject_malformed() {
        assert_eq!(TypeSpec::parse(""), Err(SignatureError::Empty));
        for bad in ["a", "()", "(s", "a{sss}", "{sv}", "z"] {
            assert!(
                matches!(TypeSpec::parse(bad), Err(SignatureError::Invalid(_))),
                "{} should not parse",
                bad
            );
        }
        assert_eq!(
            TypeSpec::parse("a{vs}"),
            Err(SignatureError::NonBasicKey("v".into()))
        );
        assert_eq!(TypeSpec::parse("ss"), Err(SignatureError::NotSingle(2)));
    }

    #[test]
    fn test_struct_is_not_an_argument_list() {
        assert_eq!(
            TypeSpec::parse_list("(is)").unwrap(),
            vec![TypeSpec::Struct(vec![TypeSpec::Int32, TypeSpec::String])]
        );
        assert_eq!(
            TypeSpec::parse_list("is").unwrap(),
            vec![TypeSpec::Int32, TypeSpec::String]
        );
        assert_eq!(TypeSpec::parse_list("(i)(s)").unwrap().len(), 2);
    }

    #[test]
    fn test_nesting_limit() {
        let ok = format!("{}y", "a".repeat(32));
        assert!(TypeSpec::parse(&ok).is_ok());

        let too_deep = format!("{}y", "a".repeat(33));
        assert!(matches!(
            TypeSpec::parse(&too_deep),
            Err(SignatureError::Invalid(_))
        ));
    }

    #[test]
    fn test_length_limit() {
        let long = "s".repeat(256);
        assert_eq!(TypeSpec::parse_list(&long), Err(SignatureError::TooLong));
    }

    #[test]
    fn test_serde_as_string() {
        let spec = TypeSpec::parse("a{sv}").unwrap();
        assert_eq!(serde_json::to_string(&spec).unwrap(), "\"a{sv}\"");
        let back: TypeSpec = serde_json::from_str("\"a{sv}\"").unwrap();
        assert_eq!(back, spec);
        assert!(serde_json::from_str::<TypeSpec>("\"a{\"").is_err());
    }
}
