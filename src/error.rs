//! Error taxonomy shared by the connector, cache, dispatcher and API.
//!
//! Each variant maps to one HTTP status (see [`Error::status_code`]). Failed
//! remote method calls are *not* errors: they are reported as a
//! [`MethodCallResult`](crate::model::MethodCallResult) with `success = false`.

use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown bus: {0}")]
    UnknownBus(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(u64),

    #[error("Property is not writable: {0}")]
    PropertyNotWritable(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Bus call failed: {0}")]
    BusFailure(String),

    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse introspection data: {0}")]
    InternalParseError(String),
}

impl Error {
    /// HTTP status for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            Error::UnknownBus(_)
            | Error::ServiceNotFound(_)
            | Error::InterfaceNotFound(_)
            | Error::PropertyNotFound(_)
            | Error::SubscriptionNotFound(_) => StatusCode::NOT_FOUND,
            Error::PropertyNotWritable(_) | Error::AccessDenied(_) => StatusCode::FORBIDDEN,
            Error::BusFailure(_) => StatusCode::BAD_GATEWAY,
            Error::BusUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::InternalParseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Strip transport detail from the error text.
    ///
    /// Used for buses flagged `sanitize_errors`: names supplied by the caller
    /// are kept, anything that came back from the bus daemon or a peer is
    /// replaced by a generic message.
    pub fn sanitized(self) -> Self {
        match self {
            Error::AccessDenied(_) => Error::AccessDenied("operation not permitted".into()),
            Error::BusFailure(_) => Error::BusFailure("remote call failed".into()),
            Error::BusUnavailable(_) => Error::BusUnavailable("bus connection unavailable".into()),
            Error::InternalParseError(_) => {
                Error::InternalParseError("introspection data could not be parsed".into())
            }
            other => other,
        }
    }
}

/// Map a D-Bus error name (and message) onto the taxonomy.
///
/// Returns `None` for names that have no dedicated kind; callers decide how
/// to report those (method calls turn them into `success = false`).
pub fn classify_dbus_error(name: &str, message: &str) -> Option<Error> {
    let detail = if message.is_empty() {
        name.to_string()
    } else {
        format!("{}: {}", name, message)
    };

    let kind = match name {
        "org.freedesktop.DBus.Error.ServiceUnknown"
        | "org.freedesktop.DBus.Error.NameHasNoOwner"
        | "org.freedesktop.DBus.Error.UnknownObject" => Error::ServiceNotFound(detail),
        "org.freedesktop.DBus.Error.UnknownInterface" => Error::InterfaceNotFound(detail),
        "org.freedesktop.DBus.Error.UnknownProperty" => Error::PropertyNotFound(detail),
        "org.freedesktop.DBus.Error.PropertyReadOnly" => Error::PropertyNotWritable(detail),
        "org.freedesktop.DBus.Error.AccessDenied"
        | "org.freedesktop.DBus.Error.AuthFailed"
        | "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired" => {
            Error::AccessDenied(detail)
        }
        "org.freedesktop.DBus.Error.InvalidArgs"
        | "org.freedesktop.DBus.Error.InvalidSignature" => Error::InvalidParameter(detail),
        "org.freedesktop.DBus.Error.Disconnected" => Error::BusUnavailable(detail),
        _ => return None,
    };
    Some(kind)
}
