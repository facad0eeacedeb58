//! Parsing of `org.freedesktop.DBus.Introspectable` XML into descriptors.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use super::signature::{SignatureError, TypeSpec};
use crate::model::{
    ArgDirection, ArgumentDescriptor, InterfaceDescriptor, MethodDescriptor, ParsedIntrospection,
    PropertyAccess, PropertyDescriptor, SignalDescriptor,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntrospectError {
    #[error("malformed introspection XML: {0}")]
    Xml(String),

    #[error("invalid signature '{signature}' in {interface}.{member}: {source}")]
    Signature {
        interface: String,
        member: String,
        signature: String,
        source: SignatureError,
    },

    #[error("invalid access '{access}' for property {interface}.{property}")]
    Access {
        interface: String,
        property: String,
        access: String,
    },

    #[error("invalid direction '{direction}' in {interface}.{method}")]
    Direction {
        interface: String,
        method: String,
        direction: String,
    },

    #[error("duplicate member {member} in interface {interface}")]
    Duplicate { interface: String, member: String },
}

impl From<IntrospectError> for crate::error::Error {
    fn from(err: IntrospectError) -> Self {
        crate::error::Error::InternalParseError(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct XmlNode {
    #[serde(rename = "interface", default)]
    interfaces: Vec<XmlInterface>,
    #[serde(rename = "node", default)]
    nodes: Vec<XmlChild>,
}

#[derive(Debug, Deserialize)]
struct XmlChild {
    #[serde(rename = "@name", default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlInterface {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "method", default)]
    methods: Vec<XmlMethod>,
    #[serde(rename = "property", default)]
    properties: Vec<XmlProperty>,
    #[serde(rename = "signal", default)]
    signals: Vec<XmlSignal>,
}

#[derive(Debug, Deserialize)]
struct XmlMethod {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "arg", default)]
    args: Vec<XmlArg>,
    #[serde(rename = "annotation", default)]
    annotations: Vec<XmlAnnotation>,
}

#[derive(Debug, Deserialize)]
struct XmlSignal {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "arg", default)]
    args: Vec<XmlArg>,
    #[serde(rename = "annotation", default)]
    annotations: Vec<XmlAnnotation>,
}

#[derive(Debug, Deserialize)]
struct XmlProperty {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    ty: String,
    #[serde(rename = "@access")]
    access: String,
    #[serde(rename = "annotation", default)]
    annotations: Vec<XmlAnnotation>,
}

#[derive(Debug, Deserialize)]
struct XmlArg {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@type")]
    ty: String,
    #[serde(rename = "@direction", default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlAnnotation {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value", default)]
    value: String,
}

/// Parse introspection XML for the object at `object_path`.
///
/// Child node names are resolved to absolute object paths.
pub fn parse(xml: &str, object_path: &str) -> Result<ParsedIntrospection, IntrospectError> {
    let node: XmlNode = quick_xml::de::from_str(xml).map_err(|e| IntrospectError::Xml(e.to_string()))?;

    let interfaces = node
        .interfaces
        .into_iter()
        .map(convert_interface)
        .collect::<Result<Vec<_>, _>>()?;

    let nodes = node
        .nodes
        .into_iter()
        .filter_map(|child| child.name)
        .filter(|name| !name.is_empty())
        .map(|name| child_path(object_path, &name))
        .collect();

    Ok(ParsedIntrospection { interfaces, nodes })
}

/// Join a child node name onto its parent object path.
pub fn child_path(parent: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn annotations(items: Vec<XmlAnnotation>) -> BTreeMap<String, String> {
    items.into_iter().map(|a| (a.name, a.value)).collect()
}

fn type_spec(interface: &str, member: &str, signature: &str) -> Result<TypeSpec, IntrospectError> {
    TypeSpec::parse(signature).map_err(|source| IntrospectError::Signature {
        interface: interface.to_string(),
        member: member.to_string(),
        signature: signature.to_string(),
        source,
    })
}

fn convert_interface(iface: XmlInterface) -> Result<InterfaceDescriptor, IntrospectError> {
    let name = iface.name;
    let mut seen = HashSet::new();
    let mut check_unique = |member: &str| {
        if seen.insert(member.to_string()) {
            Ok(())
        } else {
            Err(IntrospectError::Duplicate {
                interface: name.clone(),
                member: member.to_string(),
            })
        }
    };

    let mut methods = Vec::with_capacity(iface.methods.len());
    for method in iface.methods {
        check_unique(&method.name)?;
        let mut in_args = Vec::new();
        let mut out_args = Vec::new();
        for arg in method.args {
            let type_spec = type_spec(&name, &method.name, &arg.ty)?;
            let direction = match arg.direction.as_deref() {
                None | Some("in") => ArgDirection::In,
                Some("out") => ArgDirection::Out,
                Some(other) => {
                    return Err(IntrospectError::Direction {
                        interface: name.clone(),
                        method: method.name.clone(),
                        direction: other.to_string(),
                    })
                }
            };
            let descriptor = ArgumentDescriptor {
                name: arg.name,
                type_spec,
                direction,
            };
            match direction {
                ArgDirection::In => in_args.push(descriptor),
                ArgDirection::Out => out_args.push(descriptor),
            }
        }
        methods.push(MethodDescriptor {
            name: method.name,
            in_args,
            out_args,
            annotations: annotations(method.annotations),
        });
    }

    let mut properties = Vec::with_capacity(iface.properties.len());
    for prop in iface.properties {
        check_unique(&prop.name)?;
        let access = match prop.access.as_str() {
            "read" => PropertyAccess::Read,
            "write" => PropertyAccess::Write,
            "readwrite" => PropertyAccess::ReadWrite,
            other => {
                return Err(IntrospectError::Access {
                    interface: name.clone(),
                    property: prop.name.clone(),
                    access: other.to_string(),
                })
            }
        };
        properties.push(PropertyDescriptor {
            type_spec: type_spec(&name, &prop.name, &prop.ty)?,
            name: prop.name,
            access,
            annotations: annotations(prop.annotations),
            value: None,
        });
    }

    let mut signals = Vec::with_capacity(iface.signals.len());
    for signal in iface.signals {
        check_unique(&signal.name)?;
        let args = signal
            .args
            .into_iter()
            .map(|arg| {
                Ok(ArgumentDescriptor {
                    type_spec: type_spec(&name, &signal.name, &arg.ty)?,
                    name: arg.name,
                    direction: ArgDirection::Out,
                })
            })
            .collect::<Result<Vec<_>, IntrospectError>>()?;
        signals.push(SignalDescriptor {
            name: signal.name,
            args,
            annotations: annotations(signal.annotations),
        });
    }

    Ok(InterfaceDescriptor {
        name,
        methods,
        properties,
        signals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="org.example.Hello">
    <method name="SayHello">
      <arg name="name" type="s" direction="in"/>
      <annotation name="org.freedesktop.DBus.Method.NoReply" value="false"/>
      <arg name="greeting" type="s" direction="out"/>
    </method>
    <property name="Greeting" type="s" access="readwrite"/>
    <signal name="Greeted">
      <arg name="who" type="s"/>
    </signal>
    <property name="Count" type="u" access="read">
      <annotation name="org.freedesktop.DBus.Property.EmitsChangedSignal" value="true"/>
    </property>
  </interface>
  <node name="child"/>
  <node name="other"/>
</node>"#;

    #[test]
    fn test_parse_sample() {
        let parsed = parse(SAMPLE, "/").unwrap();
        assert_eq!(parsed.interfaces.len(), 2);
        assert_eq!(parsed.nodes, vec!["/child", "/other"]);

        let hello = parsed.interface("org.example.Hello").unwrap();
        let say = hello.method("SayHello").unwrap();
        assert_eq!(say.input_signature(), vec![TypeSpec::String]);
        assert_eq!(say.output_signature(), vec![TypeSpec::String]);
        assert_eq!(
            say.annotations.get("org.freedesktop.DBus.Method.NoReply").map(String::as_str),
            Some("false")
        );
    }

    #[test]
    fn test_interleaved_members_keep_order() {
        let parsed = parse(SAMPLE, "/").unwrap();
        let hello = parsed.interface("org.example.Hello").unwrap();
        let names: Vec<_> = hello.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Greeting", "Count"]);
        assert_eq!(hello.property("Count").unwrap().access, PropertyAccess::Read);
        assert_eq!(hello.signal("Greeted").unwrap().args[0].direction, ArgDirection::Out);
    }

    #[test]
    fn test_child_paths_relative_to_object() {
        let parsed = parse(r#"<node><node name="Devices"/></node>"#, "/org/freedesktop").unwrap();
        assert_eq!(parsed.nodes, vec!["/org/freedesktop/Devices"]);
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "/abs"), "/abs");
    }

    #[test]
    fn test_empty_node() {
        let parsed = parse("<node/>", "/").unwrap();
        assert!(parsed.interfaces.is_empty());
        assert!(parsed.nodes.is_empty());
    }

    #[test]
    fn test_malformed_xml() {
        assert!(matches!(parse("<node><interface", "/"), Err(IntrospectError::Xml(_))));
        assert!(matches!(parse("", "/"), Err(IntrospectError::Xml(_))));
    }

    #[test]
    fn test_bad_signature() {
        let xml = r#"<node><interface name="a.b"><property name="P" type="a{" access="read"/></interface></node>"#;
        assert!(matches!(parse(xml, "/"), Err(IntrospectError::Signature { .. })));
    }

    #[test]
    fn test_bad_access() {
        let xml = r#"<node><interface name="a.b"><property name="P" type="s" access="sometimes"/></interface></node>"#;
        assert!(matches!(parse(xml, "/"), Err(IntrospectError::Access { .. })));
    }

    #[test]
    fn test_duplicate_member() {
        let xml = r#"<node><interface name="a.b"><method name="M"/><method name="M"/></interface></node>"#;
        assert!(matches!(parse(xml, "/"), Err(IntrospectError::Duplicate { .. })));
    }

    #[test]
    fn test_error_maps_to_parse_error() {
        let err: crate::error::Error = IntrospectError::Xml("x".into()).into();
        assert!(matches!(err, crate::error::Error::InternalParseError(_)));
    }
}
