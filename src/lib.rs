//! dbus-controller library exports for the binary, integration tests and
//! fuzzing.
//!
//! The crate is layered bottom-up: [`dbus`] talks to message buses,
//! [`cache`] keeps parsed introspection, [`watcher`] evicts it on owner
//! changes, [`signals`] buffers subscriptions, [`dispatch`] composes them
//! into API operations and [`api`] serves those over HTTP.

pub mod api;
pub mod cache;
pub mod config;
pub mod dbus;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod signals;
pub mod validate;
pub mod watcher;

// Re-export commonly used types for convenience
pub use config::Config;
pub use dispatch::{Dispatcher, ObjectAddress};
pub use error::{Error, Result};
