//! Shared state for API handlers.

use std::sync::Arc;

use crate::dispatch::Dispatcher;

/// Shared state for API handlers.
///
/// Handlers keep nothing per request beyond this; everything goes through
/// the dispatcher.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

impl ApiState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}
