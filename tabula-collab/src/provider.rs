//! Client-side sync provider.
//!
//! One tokio task per document session. It owns the transport and runs the
//! handshake; the application keeps editing the shared [`Document`]
//! synchronously and never waits on the network.
//!
//! ```text
//!        app thread                         provider task
//!  ┌──────────────────────┐          ┌────────────────────────────┐
//!  │ doc.set_cell(..)     │ on_update│  select! {                 │
//!  │   └─ UpdateEvent ────┼─────────►│    outbound  → "update"    │
//!  └──────────────────────┘  (mpsc)  │    frame     → SyncProtocol│
//!                                    │    shutdown  → leave, close│
//!          status  ◄─────────────────┤  }                         │
//!        (watch)                     └────────────────────────────┘
//! ```
//!
//! The document mutex is only taken for short synchronous sections and
//! never held across an `.await`. Listeners registered on the document run
//! while the provider holds that mutex, so they must not lock it again.

use crate::protocol::{Envelope, SyncError, SyncProtocol, SyncStatus};
use crate::transport::{Connection, FrameSink, Transport, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tabula_core::{Document, Origin, ReplicaId, Subscription, UpdateKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A document shared between the application and its provider.
pub type SharedDoc = Arc<Mutex<Document>>;

pub fn shared(doc: Document) -> SharedDoc {
    Arc::new(Mutex::new(doc))
}

/// Locks a shared document. A panic in another holder does not make the
/// document unusable.
pub fn lock(doc: &SharedDoc) -> MutexGuard<'_, Document> {
    doc.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Reconnect after the transport drops.
    pub reconnect: bool,
    /// First retry delay; doubles per failed attempt.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(5),
        }
    }
}

enum Outbound {
    Document(Vec<u8>),
    Awareness(Vec<u8>),
}

enum Exit {
    Closed,
    Shutdown,
}

/// Handle to a running provider task. Dropping it stops the task.
pub struct SyncProvider {
    doc: SharedDoc,
    status: watch::Receiver<SyncStatus>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncProvider {
    /// Starts syncing `doc` over `transport`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(doc: SharedDoc, transport: Arc<dyn Transport>, config: ProviderConfig) -> Self {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let subscription = lock(&doc).on_update(move |event| {
            if event.origin.is_remote() {
                return;
            }
            let msg = match event.kind {
                UpdateKind::Document => Outbound::Document(event.update.clone()),
                UpdateKind::Awareness => Outbound::Awareness(event.update.clone()),
            };
            // Closed only once the actor is gone.
            let _ = out_tx.send(msg);
        });

        let actor = Actor {
            doc: doc.clone(),
            transport,
            config,
            status: status_tx,
            shutdown: shutdown_rx,
            outbound: out_rx,
            _subscription: subscription,
        };
        let task = tokio::spawn(actor.run());

        Self {
            doc,
            status: status_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn is_offline(&self) -> bool {
        self.status().is_offline()
    }

    /// A receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Resolves once the provider reaches `target`.
    pub async fn wait_for(&self, target: SyncStatus) {
        let mut rx = self.status.clone();
        let _ = rx.wait_for(|status| *status == target).await;
    }

    /// Sends `presence-leave`, closes the connection and waits for the
    /// task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("provider task failed: {}", e);
            }
        }
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct Actor {
    doc: SharedDoc,
    transport: Arc<dyn Transport>,
    config: ProviderConfig,
    status: watch::Sender<SyncStatus>,
    shutdown: watch::Receiver<bool>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    _subscription: Subscription,
}

impl Actor {
    async fn run(mut self) {
        let mut delay = self.config.reconnect_delay;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_status(SyncStatus::Connecting);
            let connected = tokio::select! {
                res = self.transport.connect() => res,
                _ = self.shutdown.changed() => break,
            };

            let exit = match connected {
                Ok(conn) => {
                    delay = self.config.reconnect_delay;
                    self.drive(conn).await
                }
                Err(e) => {
                    log::warn!("connect failed: {}", e);
                    Exit::Closed
                }
            };

            self.set_status(SyncStatus::Disconnected);
            let dropped = lock(&self.doc).clear_remote_presence();
            if !dropped.is_empty() {
                log::debug!("dropped presence of {} peer(s)", dropped.len());
            }
            if matches!(exit, Exit::Shutdown) || !self.config.reconnect {
                break;
            }
            log::debug!("reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }
        self.set_status(SyncStatus::Disconnected);
        log::debug!("provider stopped");
    }

    async fn drive(&mut self, conn: Connection) -> Exit {
        let Connection {
            mut sink,
            mut stream,
        } = conn;
        self.set_status(SyncStatus::Handshaking);
        let mut protocol = SyncProtocol::initiator();

        let opening = {
            let doc = lock(&self.doc);
            // Anything queued so far reaches the peer through sync-step-3.
            while self.outbound.try_recv().is_ok() {}
            let mut opening = vec![protocol.start(&doc)];
            if let Some(update) = doc.encode_local_awareness() {
                opening.push(Envelope::Awareness { update });
            }
            opening
        };
        if send_all(&mut sink, opening).await.is_err() {
            return Exit::Closed;
        }

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(text)) => text,
                        Some(Err(e)) => {
                            log::warn!("transport error: {}", e);
                            return Exit::Closed;
                        }
                        None => {
                            log::info!("connection closed by peer");
                            return Exit::Closed;
                        }
                    };
                    let replies = self.receive(&mut protocol, &text);
                    if send_all(&mut sink, replies).await.is_err() {
                        return Exit::Closed;
                    }
                }
                Some(out) = self.outbound.recv() => {
                    let envelope = match out {
                        Outbound::Document(update) => Envelope::Update { update },
                        Outbound::Awareness(update) => Envelope::Awareness { update },
                    };
                    if send_all(&mut sink, vec![envelope]).await.is_err() {
                        return Exit::Closed;
                    }
                }
                _ = self.shutdown.changed() => {
                    let user_id = lock(&self.doc).user_id().to_string();
                    let leave = Envelope::PresenceLeave { user_ids: vec![user_id] };
                    let _ = send_all(&mut sink, vec![leave]).await;
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
            }
        }
    }

    fn receive(&mut self, protocol: &mut SyncProtocol, text: &str) -> Vec<Envelope> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping frame: {}", e);
                return Vec::new();
            }
        };
        let kind = envelope.kind();
        let result = {
            let mut doc = lock(&self.doc);
            protocol.handle(&mut doc, envelope, Origin::Remote(ReplicaId::NIL))
        };
        let replies = match result {
            Ok(outcome) => outcome.replies,
            Err(SyncError::Protocol(e)) => {
                log::warn!("dropping {}: {}", kind, e);
                Vec::new()
            }
            Err(SyncError::Merge(e)) => {
                log::error!("{}; requesting a full snapshot", e);
                vec![protocol.request_snapshot()]
            }
        };
        self.set_status(if protocol.is_synced() {
            SyncStatus::Synced
        } else {
            SyncStatus::Handshaking
        });
        replies
    }

    fn set_status(&self, next: SyncStatus) {
        self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            log::info!("sync status {} -> {}", status, next);
            *status = next;
            true
        });
    }
}

async fn send_all(sink: &mut FrameSink, envelopes: Vec<Envelope>) -> Result<(), TransportError> {
    for envelope in envelopes {
        match envelope.encode() {
            Ok(text) => sink.send(text).await?,
            Err(e) => log::error!("failed to encode {}: {}", envelope.kind(), e),
        }
    }
    Ok(())
}
