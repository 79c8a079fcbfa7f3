//! Transport abstraction for the synchronizer.
//!
//! A [`Channel`] only needs to deliver [`Envelope`]s; retries, ordering
//! guarantees, and encodings are the transport's business. The bundled
//! [`MemoryChannel`] is an in-process broker used as the reference transport
//! and by the tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::message::Envelope;
use crate::error::{Result, TabulaError};
use crate::store::Id;

/// Boxed future returned by [`Channel`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A transport able to deliver envelopes between replicas.
pub trait Channel: Send + Sync {
    /// Deliver an envelope to its addressee, or to every other registered
    /// replica when the addressee is `None`.
    fn send<'a>(&'a self, envelope: Envelope) -> BoxFuture<'a, Result<()>>;
}

/// In-process broker connecting any number of replicas over unbounded
/// channels.
///
/// Each replica registers once and receives its inbound envelopes on the
/// returned receiver. Cloning the broker shares the same peer table.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    peers: Arc<Mutex<HashMap<Id, mpsc::UnboundedSender<Envelope>>>>,
}

impl MemoryChannel {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replica and return its inbound receiver.
    ///
    /// Registering the same id again replaces the previous receiver.
    pub fn register(&self, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().unwrap().insert(id.to_string(), tx);
        rx
    }

    /// Remove a replica; envelopes addressed to it will fail to send.
    pub fn unregister(&self, id: &str) {
        self.peers.lock().unwrap().remove(id);
    }
}

impl Channel for MemoryChannel {
    fn send<'a>(&'a self, envelope: Envelope) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let peers = self.peers.lock().unwrap();
            match &envelope.to {
                Some(to) => {
                    let tx = peers.get(to).ok_or(TabulaError::ChannelClosed)?;
                    tx.send(envelope.clone())
                        .map_err(|_| TabulaError::ChannelClosed)?;
                }
                None => {
                    // Peers that went away mid-broadcast are skipped.
                    for (id, tx) in peers.iter() {
                        if *id != envelope.from {
                            let _ = tx.send(envelope.clone());
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
