//! zbus-backed [`BusConnector`].

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use zbus::fdo::DBusProxy;
use zbus::names::BusName;
use zbus::zvariant::{OwnedValue, Structure, StructureBuilder, Value};
use zbus::{connection::Builder, Connection, DBusError, MatchRule, Message, MessageStream};

use super::marshal;
use super::{
    BusConnector, MethodCall, OwnerChange, PropertyRef, SignalMatch, TypeSpec,
    INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE,
};
use crate::config::DbusConfig;
use crate::error::{classify_dbus_error, Error, Result};
use crate::model::{BusDescriptor, BusKind, MethodCallResult, PropertyValue, SignalEvent};

/// Queue depth for signal and owner-change forwarding.
const STREAM_QUEUE: usize = 64;

/// One configured bus and its lazily opened connection.
struct BusLink {
    descriptor: BusDescriptor,
    connection: RwLock<Option<Connection>>,
}

/// Connector for real message buses.
///
/// Connections are opened on first use and reopened after an I/O failure.
/// zbus multiplexes concurrent calls on one connection by serial number.
/// Call limits and timeouts come from wrapping it in a
/// [`BoundedConnector`](super::BoundedConnector).
pub struct ZbusConnector {
    buses: Vec<BusDescriptor>,
    links: HashMap<String, BusLink>,
    connect_timeout: Duration,
}

impl ZbusConnector {
    pub fn new(buses: Vec<BusDescriptor>, config: &DbusConfig) -> Self {
        let links = buses
            .iter()
            .map(|descriptor| {
                (
                    descriptor.id.clone(),
                    BusLink {
                        descriptor: descriptor.clone(),
                        connection: RwLock::new(None),
                    },
                )
            })
            .collect();

        Self {
            buses,
            links,
            connect_timeout: config.connect_timeout(),
        }
    }

    fn link(&self, bus: &str) -> Result<&BusLink> {
        self.links
            .get(bus)
            .ok_or_else(|| Error::UnknownBus(bus.to_string()))
    }

    /// Get (or open) the connection for a bus.
    async fn connection(&self, bus: &str) -> Result<(&BusLink, Connection)> {
        let link = self.link(bus)?;

        if let Some(conn) = link.connection.read().await.as_ref() {
            return Ok((link, conn.clone()));
        }

        let mut slot = link.connection.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok((link, conn.clone()));
        }

        let conn = tokio::time::timeout(self.connect_timeout, open(&link.descriptor))
            .await
            .map_err(|_| Error::BusUnavailable(format!("timed out connecting to {} bus", bus)))?
            .map_err(|e| Error::BusUnavailable(format!("{} bus: {}", bus, e)))?;

        info!(
            "Connected to {} bus as {}",
            bus,
            conn.unique_name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<anonymous>".to_string())
        );
        *slot = Some(conn.clone());
        Ok((link, conn))
    }

    /// Drop a connection that failed at the I/O level so the next call reopens it.
    async fn forget(&self, link: &BusLink) {
        if link.connection.write().await.take().is_some() {
            warn!("Dropped connection to {} bus after I/O failure", link.descriptor.id);
        }
    }

    async fn check(&self, link: &BusLink, err: zbus::Error) -> Error {
        if matches!(err, zbus::Error::InputOutput(_)) {
            self.forget(link).await;
        }
        map_error(err)
    }
}

async fn open(descriptor: &BusDescriptor) -> zbus::Result<Connection> {
    if let Some(address) = descriptor.address.as_deref() {
        return Builder::address(address)?.build().await;
    }
    match descriptor.kind {
        BusKind::System => Connection::system().await,
        BusKind::Session => Connection::session().await,
        BusKind::Custom => Err(zbus::Error::Address(format!(
            "custom bus '{}' has no address",
            descriptor.id
        ))),
    }
}

/// D-Bus error name carried by a zbus error, if any.
fn error_name(err: &zbus::Error) -> Option<String> {
    match err {
        zbus::Error::MethodError(name, _, _) => Some(name.to_string()),
        zbus::Error::FDO(fdo) => Some(fdo.name().to_string()),
        _ => None,
    }
}

fn describe(err: &zbus::Error) -> String {
    match err {
        zbus::Error::MethodError(name, Some(message), _) => format!("{}: {}", name, message),
        zbus::Error::MethodError(name, None, _) => name.to_string(),
        other => other.to_string(),
    }
}

fn map_error(err: zbus::Error) -> Error {
    let classified = match &err {
        zbus::Error::MethodError(name, message, _) => {
            classify_dbus_error(name.as_str(), message.as_deref().unwrap_or(""))
        }
        zbus::Error::FDO(fdo) => {
            classify_dbus_error(fdo.name().as_str(), fdo.description().unwrap_or(""))
        }
        zbus::Error::InputOutput(_) => Some(Error::BusUnavailable(err.to_string())),
        _ => None,
    };
    classified.unwrap_or_else(|| Error::BusFailure(describe(&err)))
}

fn map_fdo(err: zbus::fdo::Error) -> zbus::Error {
    zbus::Error::from(err)
}

/// Header field code of the body signature.
const SIGNATURE_FIELD: u8 = 8;

fn align(pos: usize, to: usize) -> usize {
    pos.div_ceil(to) * to
}

/// Body signature exactly as written in the message header.
///
/// zvariant parses `(is)` and `is` into the same value, so only the raw
/// header field tells a single struct argument from two arguments. `None`
/// means the header could not be walked.
fn wire_signature(message: &Message) -> Option<String> {
    let bytes: &[u8] = message.data();
    let big_endian = match bytes.first()? {
        b'l' => false,
        b'B' => true,
        _ => return None,
    };
    let read_u32 = |at: usize| -> Option<usize> {
        let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
        let value = if big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        };
        Some(value as usize)
    };

    let end = 16 + read_u32(12)?;
    let mut pos = 16;
    loop {
        pos = align(pos, 8);
        if pos >= end {
            return Some(String::new());
        }
        let code = *bytes.get(pos)?;
        let type_len = *bytes.get(pos + 1)? as usize;
        let field_type = bytes.get(pos + 2..pos + 2 + type_len)?;
        pos += 2 + type_len + 1;

        match field_type {
            b"g" => {
                let len = *bytes.get(pos)? as usize;
                if code == SIGNATURE_FIELD {
                    let text = bytes.get(pos + 1..pos + 1 + len)?;
                    return std::str::from_utf8(text).ok().map(str::to_string);
                }
                pos += len + 2;
            }
            b"s" | b"o" => {
                pos = align(pos, 4);
                pos += 4 + read_u32(pos)? + 1;
            }
            b"u" => pos = align(pos, 4) + 4,
            _ => return None,
        }
    }
}

/// Message body as a list of JSON values, one per top-level argument.
fn body_values(message: &Message) -> zbus::Result<Vec<Json>> {
    let body = message.body();
    let signature = wire_signature(message)
        .unwrap_or_else(|| body.signature().to_string_no_parens());
    if signature.is_empty() {
        return Ok(Vec::new());
    }

    let arguments = format!("({})", signature);
    let (fields, _): (Structure<'_>, usize) = body
        .data()
        .deserialize_for_dynamic_signature(arguments.as_str())?;
    Ok(fields.fields().iter().map(marshal::to_json).collect())
}

fn call_body(values: Vec<Value<'static>>) -> Result<Structure<'static>> {
    values
        .into_iter()
        .fold(StructureBuilder::new(), |builder, value| builder.append_field(value))
        .build()
        .map_err(|e| Error::InvalidParameter(e.to_string()))
}

#[async_trait]
impl BusConnector for ZbusConnector {
    fn list_buses(&self) -> Vec<BusDescriptor> {
        self.buses.clone()
    }

    async fn list_services(&self, bus: &str) -> Result<Vec<String>> {
        let (link, conn) = self.connection(bus).await?;
        let proxy = DBusProxy::new(&conn).await.map_err(map_error)?;

        let names = match proxy.list_names().await {
            Ok(names) => names,
            Err(e) => return Err(self.check(link, map_fdo(e)).await),
        };

        let mut names: Vec<String> = names.into_iter().map(|n| n.to_string()).collect();
        names.sort();
        debug!("{} bus lists {} names", bus, names.len());
        Ok(names)
    }

    async fn get_service_owner(&self, bus: &str, service: &str) -> Result<Option<String>> {
        let (link, conn) = self.connection(bus).await?;
        let name = BusName::try_from(service)
            .map_err(|e| Error::InvalidParameter(format!("bus name '{}': {}", service, e)))?;
        let proxy = DBusProxy::new(&conn).await.map_err(map_error)?;

        match proxy.get_name_owner(name).await {
            Ok(owner) => Ok(Some(owner.to_string())),
            Err(zbus::fdo::Error::NameHasNoOwner(_)) => Ok(None),
            Err(e) => Err(self.check(link, map_fdo(e)).await),
        }
    }

    async fn introspect(&self, bus: &str, service: &str, path: &str) -> Result<String> {
        let (link, conn) = self.connection(bus).await?;
        let call = conn.call_method(
            Some(service),
            path,
            Some(INTROSPECTABLE_INTERFACE),
            "Introspect",
            &(),
        );

        let reply = match call.await {
            Ok(reply) => reply,
            Err(e) => return Err(self.check(link, e).await),
        };
        reply.body().deserialize::<String>().map_err(map_error)
    }

    async fn call_method(&self, bus: &str, call: &MethodCall) -> Result<MethodCallResult> {
        let (link, conn) = self.connection(bus).await?;
        let values = marshal::to_values(&call.args, call.signature.as_deref())?;

        let service = Some(call.service.as_str());
        let interface = Some(call.interface.as_str());
        let path = call.path.as_str();
        let method = call.method.as_str();
        let outcome = if values.is_empty() {
            conn.call_method(service, path, interface, method, &()).await
        } else {
            let body = call_body(values)?;
            conn.call_method(service, path, interface, method, &body).await
        };

        let result = match outcome {
            Ok(reply) => match body_values(&reply) {
                Ok(values) => MethodCallResult::succeeded(values),
                Err(e) => MethodCallResult::failed(None, format!("malformed reply: {}", e)),
            },
            Err(err) => {
                if matches!(err, zbus::Error::InputOutput(_)) {
                    self.forget(link).await;
                }
                debug!(
                    "{}.{} on {} failed: {}",
                    call.interface, call.method, call.service, err
                );
                MethodCallResult::failed(error_name(&err), describe(&err))
            }
        };
        Ok(result)
    }

    async fn get_property(&self, bus: &str, property: &PropertyRef) -> Result<PropertyValue> {
        let (link, conn) = self.connection(bus).await?;
        let args = (property.interface.as_str(), property.property.as_str());
        let call = conn.call_method(
            Some(property.service.as_str()),
            property.path.as_str(),
            Some(PROPERTIES_INTERFACE),
            "Get",
            &args,
        );

        let reply = match call.await {
            Ok(reply) => reply,
            Err(e) => return Err(self.check(link, e).await),
        };
        let value: OwnedValue = reply.body().deserialize().map_err(map_error)?;

        Ok(PropertyValue {
            name: property.property.clone(),
            type_signature: value.value_signature().to_string(),
            value: marshal::to_json(&value),
            timestamp: Utc::now(),
        })
    }

    async fn set_property(
        &self,
        bus: &str,
        property: &PropertyRef,
        value: &Json,
        type_spec: Option<&TypeSpec>,
    ) -> Result<()> {
        let (link, conn) = self.connection(bus).await?;
        let spec = match type_spec {
            Some(spec) => spec.clone(),
            None => marshal::infer_type(value)?,
        };
        let value = marshal::to_value(value, &spec)?;

        // The third argument has signature `v`; a Value serializes as a variant.
        let args = (property.interface.as_str(), property.property.as_str(), value);
        let call = conn.call_method(
            Some(property.service.as_str()),
            property.path.as_str(),
            Some(PROPERTIES_INTERFACE),
            "Set",
            &args,
        );

        match call.await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.check(link, e).await),
        }
    }

    async fn owner_changes(&self, bus: &str) -> Result<mpsc::Receiver<OwnerChange>> {
        let (_, conn) = self.connection(bus).await?;
        let proxy = DBusProxy::new(&conn).await.map_err(map_error)?;
        let mut stream = proxy
            .receive_name_owner_changed()
            .await
            .map_err(map_error)?;

        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        let bus = bus.to_string();
        tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let old_owner: &Option<_> = args.old_owner();
                let new_owner: &Option<_> = args.new_owner();
                let change = OwnerChange {
                    bus: bus.clone(),
                    name: args.name().to_string(),
                    old_owner: old_owner.as_ref().map(|o| o.to_string()),
                    new_owner: new_owner.as_ref().map(|o| o.to_string()),
                };
                if tx.send(change).await.is_err() {
                    break;
                }
            }
            debug!("NameOwnerChanged stream for {} bus ended", bus);
        });

        Ok(rx)
    }

    async fn subscribe_signal(
        &self,
        bus: &str,
        rule: &SignalMatch,
    ) -> Result<mpsc::Receiver<SignalEvent>> {
        // Signals carry the unique sender name, so match on the current owner.
        let sender = self
            .get_service_owner(bus, &rule.service)
            .await?
            .unwrap_or_else(|| rule.service.clone());
        let (_, conn) = self.connection(bus).await?;

        let match_rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(sender.as_str())
            .map_err(map_error)?
            .path(rule.path.as_str())
            .map_err(map_error)?
            .interface(rule.interface.as_str())
            .map_err(map_error)?
            .member(rule.signal.as_str())
            .map_err(map_error)?
            .build();

        let mut stream = MessageStream::for_match_rule(match_rule, &conn, Some(STREAM_QUEUE))
            .await
            .map_err(map_error)?;

        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        let label = format!("{}.{}", rule.interface, rule.signal);
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let message = match item {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Signal stream for {} failed: {}", label, e);
                        continue;
                    }
                };
                let header = message.header();
                let event = SignalEvent {
                    interface: header.interface().map(|i| i.to_string()).unwrap_or_default(),
                    signal: header.member().map(|m| m.to_string()).unwrap_or_default(),
                    sender: header.sender().map(|s| s.to_string()),
                    object_path: header.path().map(|p| p.to_string()),
                    args: body_values(&message).unwrap_or_default(),
                    timestamp: Utc::now(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Signal stream for {} ended", label);
        });

        Ok(rx)
    }
}
