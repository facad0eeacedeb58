//! Syntax checks for D-Bus names and object paths.
//!
//! Requests are validated before anything is sent to a bus, so malformed
//! path parameters fail with `InvalidParameter` instead of a bus error.
//! The rules themselves are the ones zbus enforces on outgoing messages.

use std::fmt::Display;

use zbus::names::{BusName, InterfaceName, MemberName};
use zbus::zvariant::ObjectPath;

use crate::error::{Error, Result};

fn reject(what: &str, value: &str, reason: impl Display) -> Error {
    Error::InvalidParameter(format!("invalid {} '{}': {}", what, value, reason))
}

/// Well-known (`org.example.Service`) or unique (`:1.42`) bus name.
pub fn bus_name(name: &str) -> Result<()> {
    BusName::try_from(name).map_err(|e| reject("bus name", name, e))?;
    Ok(())
}

pub fn interface_name(name: &str) -> Result<()> {
    InterfaceName::try_from(name).map_err(|e| reject("interface name", name, e))?;
    Ok(())
}

/// Method, property or signal name.
pub fn member_name(name: &str) -> Result<()> {
    MemberName::try_from(name).map_err(|e| reject("member name", name, e))?;
    Ok(())
}

pub fn object_path(path: &str) -> Result<()> {
    ObjectPath::try_from(path).map_err(|e| reject("object path", path, e))?;
    Ok(())
}
