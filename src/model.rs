//! Data model shared by the connector, cache, dispatcher and REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::dbus::signature::TypeSpec;

/// Kind of message bus a descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
    /// Any bus reachable through an explicit D-Bus address.
    Custom,
}

impl BusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BusKind::System => "system",
            BusKind::Session => "session",
            BusKind::Custom => "custom",
        }
    }
}

/// A configured bus. Immutable once the server has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusDescriptor {
    /// Identifier used as the `{busType}` path segment.
    pub id: String,

    pub kind: BusKind,

    #[serde(default)]
    pub description: String,

    /// D-Bus address, required for custom buses (e.g. `unix:path=/run/foo`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Replace transport error detail with generic text in API responses.
    #[serde(default)]
    pub sanitize_errors: bool,
}

impl BusDescriptor {
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            kind: BusKind::System,
            description: "System D-Bus".to_string(),
            address: None,
            sanitize_errors: true,
        }
    }

    pub fn session() -> Self {
        Self {
            id: "session".to_string(),
            kind: BusKind::Session,
            description: "Session D-Bus".to_string(),
            address: None,
            sanitize_errors: false,
        }
    }

    pub fn info(&self) -> BusInfo {
        BusInfo {
            bus_type: self.id.clone(),
            kind: self.kind,
            description: self.description.clone(),
        }
    }
}

/// Public view of a configured bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BusInfo {
    /// Bus identifier (`system`, `session` or a custom id)
    #[serde(rename = "type")]
    pub bus_type: String,
    pub kind: BusKind,
    pub description: String,
}

/// A service (bus name) and what introspection revealed about it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub name: String,
    /// Unique connection name currently owning the service, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub object_path: String,
    pub interfaces: Vec<String>,
    /// Child object paths below `object_path`
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ArgDirection {
    In,
    Out,
}

/// A method or signal argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ArgumentDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// D-Bus signature of the argument
    #[serde(rename = "type")]
    #[schema(value_type = String)]
    pub type_spec: TypeSpec,
    pub direction: ArgDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MethodDescriptor {
    pub name: String,
    pub in_args: Vec<ArgumentDescriptor>,
    pub out_args: Vec<ArgumentDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl MethodDescriptor {
    pub fn input_signature(&self) -> Vec<TypeSpec> {
        self.in_args.iter().map(|a| a.type_spec.clone()).collect()
    }

    pub fn output_signature(&self) -> Vec<TypeSpec> {
        self.out_args.iter().map(|a| a.type_spec.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    #[schema(value_type = String)]
    pub type_spec: TypeSpec,
    pub access: PropertyAccess,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Current value, filled in when listing properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub value: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SignalDescriptor {
    pub name: String,
    pub args: Vec<ArgumentDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    pub properties: Vec<PropertyDescriptor>,
    pub signals: Vec<SignalDescriptor>,
}

impl InterfaceDescriptor {
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ParsedIntrospection {
    pub interfaces: Vec<InterfaceDescriptor>,
    /// Absolute object paths of child nodes
    pub nodes: Vec<String>,
}

impl ParsedIntrospection {
    pub fn interface(&self, name: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

/// Introspection data for one object of one service.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IntrospectionResult {
    pub service: String,
    pub object_path: String,
    /// Raw introspection XML as returned by the service
    pub xml: String,
    /// Absent when the XML could not be parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_data: Option<ParsedIntrospection>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a remote method call.
///
/// A remote error is a normal outcome: `success` is false and `error`
/// describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MethodCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Vec<Object>>)]
    pub return_values: Option<Vec<Json>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// D-Bus error name, when the failure came from the bus or the peer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MethodCallResult {
    pub fn succeeded(return_values: Vec<Json>) -> Self {
        Self {
            success: true,
            return_values: Some(return_values),
            error: None,
            error_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(error_name: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            return_values: None,
            error: Some(error.into()),
            error_name,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PropertyValue {
    pub name: String,
    /// D-Bus signature of the value
    #[serde(rename = "type")]
    pub type_signature: String,
    #[schema(value_type = Object)]
    pub value: Json,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SignalSubscription {
    pub id: u64,
    pub bus_type: String,
    pub service: String,
    pub object_path: String,
    pub interface: String,
    pub signal: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A signal received for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SignalEvent {
    pub interface: String,
    pub signal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_path: Option<String>,
    #[schema(value_type = Vec<Object>)]
    pub args: Vec<Json>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bus_info_serializes_type() {
        let info = BusDescriptor::system().info();
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(value["kind"], "system");
        assert_eq!(value["description"], "System D-Bus");
    }

    #[test]
    fn test_property_access() {
        assert!(PropertyAccess::Read.readable());
        assert!(!PropertyAccess::Read.writable());
        assert!(PropertyAccess::Write.writable());
        assert!(!PropertyAccess::Write.readable());
        assert!(PropertyAccess::ReadWrite.readable() && PropertyAccess::ReadWrite.writable());
        assert_eq!(
            serde_json::to_string(&PropertyAccess::ReadWrite).unwrap(),
            "\"readwrite\""
        );
    }

    #[test]
    fn test_call_result_shapes() {
        let ok = serde_json::to_value(MethodCallResult::succeeded(vec![])).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["return_values"], json!([]));
        assert!(ok.get("error").is_none());

        let failed = serde_json::to_value(MethodCallResult::failed(
            Some("org.freedesktop.DBus.Error.ServiceUnknown".into()),
            "no such name",
        ))
        .unwrap();
        assert_eq!(failed["success"], false);
        assert!(failed.get("return_values").is_none());
        assert_eq!(failed["error"], "no such name");
    }

    #[test]
    fn test_method_signatures() {
        let method = MethodDescriptor {
            name: "Frob".into(),
            in_args: vec![
                ArgumentDescriptor {
                    name: Some("a".into()),
                    type_spec: TypeSpec::String,
                    direction: ArgDirection::In,
                },
                ArgumentDescriptor {
                    name: None,
                    type_spec: TypeSpec::UInt32,
                    direction: ArgDirection::In,
                },
            ],
            out_args: vec![],
            annotations: BTreeMap::new(),
        };
        assert_eq!(method.input_signature(), vec![TypeSpec::String, TypeSpec::UInt32]);
        assert!(method.output_signature().is_empty());
    }
}
