//! Transport-agnostic replica synchronizer.
//!
//! A [`Synchronizer`] owns a [`MergeableStore`] and reconciles it with peers
//! over any [`Channel`]. Reconciliation is a hash-guided descent: compare
//! root hashes, then table hashes, then row hashes, and only ship full cell
//! stamps for the rows that actually diverge, so the payload is proportional
//! to the divergence rather than to store size.
//!
//! Incoming requests are answered inline on the inbound loop. A pull
//! triggered from that loop must run on its own task, because the pull
//! awaits responses that arrive on the very same loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::channel::Channel;
use super::message::{Envelope, Message, Response};
use crate::error::{Result, TabulaError};
use crate::mergeable::{merge_tables_stamps, MergeableContent, MergeableStore};
use crate::store::Id;

/// What the synchronizer is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No cycle in flight.
    Idle,
    /// Requesting and applying remote changes.
    Pulling,
    /// Announcing local state to peers.
    Pushing,
}

/// Tunables for a synchronizer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long to wait for each response before giving up on the cycle.
    pub request_timeout: Duration,
    /// Pull automatically when a peer announces differing root hashes.
    pub auto_pull: bool,
    /// Broadcast the delta of every finished local transaction.
    pub auto_push: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            auto_pull: true,
            auto_push: true,
        }
    }
}

struct Inner {
    id: Id,
    store: Mutex<MergeableStore>,
    channel: Arc<dyn Channel>,
    config: SyncConfig,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    // Serializes pull/push cycles; requests within one cycle stay ordered.
    cycle: AsyncMutex<()>,
    status: Mutex<SyncStatus>,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<MergeableContent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sent_requests: AtomicU64,
    received_envelopes: AtomicU64,
}

/// Reconciles one [`MergeableStore`] with its peers.
///
/// Cheap to clone; clones share the store and all sync state.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    /// Wrap a store for synchronization over the given channel.
    ///
    /// When auto-push is enabled, a change listener is installed on the
    /// store so every finished transaction's delta gets broadcast once
    /// [`start`](Self::start) is called.
    pub fn new(mut store: MergeableStore, channel: Arc<dyn Channel>, config: SyncConfig) -> Self {
        let id = store.id().to_string();
        let push_rx = if config.auto_push {
            let (tx, rx) = mpsc::unbounded_channel();
            store.add_change_listener(Box::new(move |changes| {
                let _ = tx.send(changes.clone());
            }));
            Some(rx)
        } else {
            None
        };
        Self {
            inner: Arc::new(Inner {
                id,
                store: Mutex::new(store),
                channel,
                config,
                pending: Mutex::new(HashMap::new()),
                cycle: AsyncMutex::new(()),
                status: Mutex::new(SyncStatus::Idle),
                push_rx: Mutex::new(push_rx),
                tasks: Mutex::new(Vec::new()),
                sent_requests: AtomicU64::new(0),
                received_envelopes: AtomicU64::new(0),
            }),
        }
    }

    /// The wrapped replica's id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current cycle status.
    pub fn status(&self) -> SyncStatus {
        *self.inner.status.lock().unwrap()
    }

    /// Number of requests this synchronizer has sent.
    pub fn sent_requests(&self) -> u64 {
        self.inner.sent_requests.load(Ordering::Relaxed)
    }

    /// Number of envelopes this synchronizer has received.
    pub fn received_envelopes(&self) -> u64 {
        self.inner.received_envelopes.load(Ordering::Relaxed)
    }

    /// Run `f` against the wrapped store.
    ///
    /// Local writes made here are stamped by the store's clock and, with
    /// auto-push enabled, broadcast when the transaction finishes.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut MergeableStore) -> R) -> R {
        f(&mut self.store_lock())
    }

    fn store_lock(&self) -> MutexGuard<'_, MergeableStore> {
        self.inner.store.lock().unwrap()
    }

    /// Start the inbound loop (and the auto-push loop, if configured) on the
    /// current tokio runtime.
    pub fn start(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        let mut tasks = self.inner.tasks.lock().unwrap();

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                this.handle_envelope(envelope).await;
            }
            log::debug!("[Synchronizer] inbound channel closed");
        }));

        if let Some(mut push_rx) = self.inner.push_rx.lock().unwrap().take() {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(changes) = push_rx.recv().await {
                    let envelope =
                        Envelope::broadcast(&this.inner.id, Message::ContentDiff(changes));
                    if let Err(e) = this.inner.channel.send(envelope).await {
                        log::debug!("[Synchronizer] auto-push failed: {}", e);
                    }
                }
            }));
        }
    }

    /// Stop all background tasks. The store remains usable locally.
    pub fn stop(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // =========================================================================
    // Outbound cycles
    // =========================================================================

    /// Pull everything this replica is missing from one peer.
    ///
    /// Runs the full hash descent and applies the accumulated change set in
    /// a single store transaction. A timed-out or failed cycle leaves the
    /// store untouched; a later retry starts over.
    pub async fn pull_from(&self, peer: &str) -> Result<()> {
        let _cycle = self.inner.cycle.lock().await;
        self.set_status(SyncStatus::Pulling);
        let result = self.pull_cycle(peer).await;
        self.set_status(SyncStatus::Idle);
        result
    }

    /// Announce local root hashes to every peer; peers with auto-pull
    /// enabled respond by pulling from us.
    pub async fn push(&self) -> Result<()> {
        let _cycle = self.inner.cycle.lock().await;
        self.set_status(SyncStatus::Pushing);
        let (tables, values) = self.store_lock().get_content_hashes();
        let envelope = Envelope::broadcast(&self.inner.id, Message::ContentHashes { tables, values });
        let result = self.inner.channel.send(envelope).await;
        self.set_status(SyncStatus::Idle);
        result
    }

    /// Broadcast the full local content as a stamped delta.
    ///
    /// Peers apply it directly with last-writer-wins; useful for seeding a
    /// cold-started peer without waiting for it to pull.
    pub async fn push_changes(&self) -> Result<()> {
        let _cycle = self.inner.cycle.lock().await;
        self.set_status(SyncStatus::Pushing);
        let content = self.store_lock().get_mergeable_content();
        let envelope = Envelope::broadcast(&self.inner.id, Message::ContentDiff(content));
        let result = self.inner.channel.send(envelope).await;
        self.set_status(SyncStatus::Idle);
        result
    }

    async fn pull_cycle(&self, peer: &str) -> Result<()> {
        let (local_tables_hash, local_values_hash) = self.store_lock().get_content_hashes();

        let response = self.request(peer, Message::GetContentHashes).await?;
        let Response::ContentHashes { tables, values } = response else {
            return Err(TabulaError::UnexpectedResponse("content hashes".to_string()));
        };

        let mut changes = MergeableContent::default();

        if tables != local_tables_hash {
            let table_hashes = self.store_lock().get_table_hashes();
            let response = self
                .request(peer, Message::GetTableDiff { table_hashes })
                .await?;
            let Response::TableDiff {
                tables: new_tables,
                differing_table_hashes,
            } = response
            else {
                return Err(TabulaError::UnexpectedResponse("table diff".to_string()));
            };
            merge_tables_stamps(&mut changes.tables, new_tables);

            if !differing_table_hashes.is_empty() {
                let row_hashes = self.store_lock().get_row_hashes(&differing_table_hashes);
                let response = self.request(peer, Message::GetRowDiff { row_hashes }).await?;
                let Response::RowDiff {
                    tables: new_rows,
                    differing_row_hashes,
                } = response
                else {
                    return Err(TabulaError::UnexpectedResponse("row diff".to_string()));
                };
                merge_tables_stamps(&mut changes.tables, new_rows);

                if !differing_row_hashes.is_empty() {
                    let cell_hashes = self.store_lock().get_cell_hashes(&differing_row_hashes);
                    let response = self
                        .request(peer, Message::GetCellDiff { cell_hashes })
                        .await?;
                    let Response::CellDiff { tables: cells } = response else {
                        return Err(TabulaError::UnexpectedResponse("cell diff".to_string()));
                    };
                    merge_tables_stamps(&mut changes.tables, cells);
                }
            }
        }

        if values != local_values_hash {
            let value_hashes = self.store_lock().get_value_hashes();
            let response = self
                .request(peer, Message::GetValueDiff { value_hashes })
                .await?;
            let Response::ValueDiff { values: new_values } = response else {
                return Err(TabulaError::UnexpectedResponse("value diff".to_string()));
            };
            changes.values = new_values;
        }

        if !changes.is_empty() {
            log::debug!(
                "[Synchronizer] pulled changes from '{}': {} tables, {} values",
                peer,
                changes.tables.value.len(),
                changes.values.value.len()
            );
            self.store_lock().apply_changes(changes);
        }
        Ok(())
    }

    async fn request(&self, to: &str, message: Message) -> Result<Response> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);
        self.inner.sent_requests.fetch_add(1, Ordering::Relaxed);

        let envelope = Envelope::request(&self.inner.id, to, request_id.clone(), message);
        if let Err(e) = self.inner.channel.send(envelope).await {
            self.inner.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.inner.pending.lock().unwrap().remove(&request_id);
                Err(TabulaError::ChannelClosed)
            }
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&request_id);
                Err(TabulaError::RequestTimeout {
                    to: to.to_string(),
                    request_id,
                })
            }
        }
    }

    fn set_status(&self, status: SyncStatus) {
        *self.inner.status.lock().unwrap() = status;
    }

    // =========================================================================
    // Inbound handling
    // =========================================================================

    async fn handle_envelope(&self, envelope: Envelope) {
        self.inner
            .received_envelopes
            .fetch_add(1, Ordering::Relaxed);
        let from = envelope.from;
        match envelope.message {
            Message::Response(response) => {
                if let Some(request_id) = envelope.request_id {
                    let sender = self.inner.pending.lock().unwrap().remove(&request_id);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        // Late reply to a request that already timed out.
                        None => log::debug!(
                            "[Synchronizer] unmatched response '{}' from '{}'",
                            request_id,
                            from
                        ),
                    }
                }
            }
            Message::GetContentHashes => {
                let (tables, values) = self.store_lock().get_content_hashes();
                self.respond(
                    &from,
                    envelope.request_id,
                    Response::ContentHashes { tables, values },
                )
                .await;
            }
            Message::ContentHashes { tables, values } => {
                if self.inner.config.auto_pull
                    && self.store_lock().get_content_hashes() != (tables, values)
                {
                    // The pull awaits responses delivered by this loop, so it
                    // has to run on its own task.
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.pull_from(&from).await {
                            log::debug!("[Synchronizer] auto-pull from '{}' failed: {}", from, e);
                        }
                    });
                }
            }
            Message::ContentDiff(content) => {
                self.store_lock().apply_changes(content);
            }
            Message::GetTableDiff { table_hashes } => {
                let (tables, differing_table_hashes) =
                    self.store_lock().get_table_diff(&table_hashes);
                self.respond(
                    &from,
                    envelope.request_id,
                    Response::TableDiff {
                        tables,
                        differing_table_hashes,
                    },
                )
                .await;
            }
            Message::GetRowDiff { row_hashes } => {
                let (tables, differing_row_hashes) = self.store_lock().get_row_diff(&row_hashes);
                self.respond(
                    &from,
                    envelope.request_id,
                    Response::RowDiff {
                        tables,
                        differing_row_hashes,
                    },
                )
                .await;
            }
            Message::GetCellDiff { cell_hashes } => {
                let tables = self.store_lock().get_cell_diff(&cell_hashes);
                self.respond(&from, envelope.request_id, Response::CellDiff { tables })
                    .await;
            }
            Message::GetValueDiff { value_hashes } => {
                let values = self.store_lock().get_value_diff(&value_hashes);
                self.respond(&from, envelope.request_id, Response::ValueDiff { values })
                    .await;
            }
        }
    }

    async fn respond(&self, to: &str, request_id: Option<String>, response: Response) {
        let Some(request_id) = request_id else {
            log::debug!("[Synchronizer] request without correlation id from '{}'", to);
            return;
        };
        let envelope = Envelope::response(&self.inner.id, to, request_id, response);
        if let Err(e) = self.inner.channel.send(envelope).await {
            log::debug!("[Synchronizer] failed to respond to '{}': {}", to, e);
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("sent_requests", &self.sent_requests())
            .finish()
    }
}
