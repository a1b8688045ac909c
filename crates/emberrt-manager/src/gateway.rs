//! [`IpcRouter`] – named, bounded response channels.
//!
//! Callers register a response channel by name with a capacity and a
//! declared maximum payload size before issuing requests that name it in
//! `reply_to`.  The gateway serializes each [`Response`] and delivers it on
//! the caller's channel; an unknown channel, an oversized payload, or a
//! full/closed queue is reported as [`BinError::Channel`], never silently
//! dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use emberrt_types::{BinError, Response};
use tokio::sync::mpsc;
use tracing::warn;

struct Route {
    tx: mpsc::Sender<Vec<u8>>,
    max_msg_bytes: usize,
}

/// Registry of named response channels, shared between the manager task
/// and its callers.
#[derive(Default)]
pub struct IpcRouter {
    routes: Mutex<HashMap<String, Route>>,
}

impl IpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the response channel `name`.
    ///
    /// Returns the receiver half; payloads are JSON-encoded [`Response`]
    /// values no larger than `max_msg_bytes`.
    pub fn register(
        &self,
        name: &str,
        capacity: usize,
        max_msg_bytes: usize,
    ) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity);
        self.routes
            .lock()
            .expect("router mutex poisoned")
            .insert(name.to_string(), Route { tx, max_msg_bytes });
        rx
    }

    /// Remove the channel `name`; subsequent sends to it are reported as
    /// unknown.
    pub fn unregister(&self, name: &str) {
        self.routes
            .lock()
            .expect("router mutex poisoned")
            .remove(name);
    }

    /// Serialize `response` and deliver it on the channel `name`.
    pub fn send(&self, name: &str, response: &Response) -> Result<(), BinError> {
        let payload = serde_json::to_vec(response)
            .map_err(|e| BinError::Channel(format!("response serialization failed: {e}")))?;

        let routes = self.routes.lock().expect("router mutex poisoned");
        let route = routes
            .get(name)
            .ok_or_else(|| BinError::Channel(format!("no response channel '{name}'")))?;

        if payload.len() > route.max_msg_bytes {
            warn!(
                channel = name,
                size = payload.len(),
                max = route.max_msg_bytes,
                "response exceeds channel message size"
            );
            return Err(BinError::Channel(format!(
                "response of {} B exceeds '{name}' message size {}",
                payload.len(),
                route.max_msg_bytes
            )));
        }

        route.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BinError::Channel(format!("response channel '{name}' full"))
            }
            mpsc::error::TrySendError::Closed(_) => {
                BinError::Channel(format!("response channel '{name}' closed"))
            }
        })
    }
}
