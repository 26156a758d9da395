//! Multiplexer events
//!
//! Events are published on a `tokio::sync::broadcast` channel. Handlers
//! registered with [`EventHub::on_event`] run on their own task; a panicking
//! handler is reported as [`MuxEvent::InternalError`] and keeps receiving.

use crate::bridge::ConnectionType;
use bytes::Bytes;
use redis_mux_core::{error::ConnectionFailureKind, types::EndPoint};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const EVENT_CAPACITY: usize = 1024;

/// Something that happened inside the multiplexer
#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent {
    /// A physical connection failed
    ConnectionFailed {
        /// Endpoint of the connection
        endpoint: EndPoint,
        /// Which connection
        connection: ConnectionType,
        /// Failure category
        kind: ConnectionFailureKind,
        /// Detail
        message: String,
    },
    /// A physical connection was (re-)established
    ConnectionRestored {
        /// Endpoint of the connection
        endpoint: EndPoint,
        /// Which connection
        connection: ConnectionType,
    },
    /// A reconfiguration run applied a new topology
    ConfigurationChanged {
        /// Endpoint blamed for the change, if any
        endpoint: Option<EndPoint>,
    },
    /// Another client announced a master change on the configuration channel
    ConfigurationChangedBroadcast {
        /// Endpoint the broadcast arrived on
        endpoint: EndPoint,
    },
    /// A pub/sub message on a subscribed channel
    Message {
        /// Endpoint the message arrived on
        endpoint: EndPoint,
        /// Channel
        channel: String,
        /// Payload
        payload: Bytes,
    },
    /// An internal failure, such as a panicking event handler
    InternalError {
        /// Where the failure happened
        origin: String,
        /// Detail
        message: String,
    },
}

/// Fan-out point for [`MuxEvent`]s
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<MuxEvent>,
}

impl EventHub {
    /// Create a hub
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; having no subscribers is fine
    pub fn publish(&self, event: MuxEvent) {
        let _ = self.tx.send(event);
    }

    /// A receiver of all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MuxEvent> {
        self.tx.subscribe()
    }

    /// Run `handler` for every future event on a dedicated task
    ///
    /// The task ends when the hub is dropped or the returned handle aborted.
    pub fn on_event<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(MuxEvent) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event handler lagged, {} events skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let internal = matches!(event, MuxEvent::InternalError { .. });
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    error!("Event handler panicked: {}", message);
                    // never feed a handler its own failure report in a loop
                    if !internal {
                        let _ = tx.send(MuxEvent::InternalError {
                            origin: "event handler".to_string(),
                            message,
                        });
                    }
                }
            }
        })
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
