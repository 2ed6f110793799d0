//! Providers against an in-memory relay: reconnects and status changes
//! without sockets.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tabula_collab::{
    lock, shared, Connection, Envelope, MemoryListener, MemoryTransport, ProviderConfig,
    SharedDoc, SyncProtocol, SyncProvider, SyncServer, SyncStatus,
};
use tabula_core::{CellPatch, Document, Origin, ReplicaId, Scalar};
use tokio::time::{timeout, Duration};

fn serve_memory(server: SyncServer, mut listener: MemoryListener, room: &'static str) {
    tokio::spawn(async move {
        while let Some(conn) = listener.accept().await {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.serve(room, conn).await;
            });
        }
    });
}

fn quick() -> ProviderConfig {
    ProviderConfig {
        reconnect: true,
        reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(40),
    }
}

#[tokio::test]
async fn test_offline_edits_sync_once_reachable() {
    let server = SyncServer::with_defaults();
    let (transport, listener) = MemoryTransport::new();
    serve_memory(server.clone(), listener, "sheet");

    transport.set_reachable(false);
    let doc = shared(Document::new());
    let provider = SyncProvider::spawn(doc.clone(), Arc::new(transport.clone()), quick());

    // Offline: local edits are accepted and the status says so.
    lock(&doc).set_cell(0, 0, CellPatch::value("typed offline"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(provider.is_offline());
    assert!(lock(&doc).get_cell(0, 0).is_some());

    transport.set_reachable(true);
    timeout(Duration::from_secs(2), provider.wait_for(SyncStatus::Synced))
        .await
        .unwrap();

    let state = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(state) = server.room_state("sheet").await {
                let mut mirror = Document::new();
                mirror.apply_update(&state).unwrap();
                if mirror.get_cell(0, 0).is_some() {
                    return mirror;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(state.all_cells(), lock(&doc).all_cells());
    provider.shutdown().await;
}

#[tokio::test]
async fn test_status_sequence() {
    let server = SyncServer::with_defaults();
    let (transport, listener) = MemoryTransport::new();
    serve_memory(server, listener, "status");

    let doc = shared(Document::new());
    let provider = SyncProvider::spawn(doc, Arc::new(transport), quick());
    let mut status = provider.subscribe_status();
    let mut seen = vec![*status.borrow_and_update()];
    timeout(Duration::from_secs(2), async {
        while *seen.last().unwrap() != SyncStatus::Synced {
            status.changed().await.unwrap();
            seen.push(*status.borrow_and_update());
        }
    })
    .await
    .unwrap();
    assert_eq!(seen.last(), Some(&SyncStatus::Synced));
    provider.shutdown().await;
}

#[tokio::test]
async fn test_many_replicas_converge() {
    let server = SyncServer::with_defaults();
    let (transport, listener) = MemoryTransport::new();
    serve_memory(server, listener, "crowd");

    let docs: Vec<SharedDoc> = (0..4).map(|_| shared(Document::new())).collect();
    let mut providers = Vec::new();
    for doc in &docs {
        let provider = SyncProvider::spawn(doc.clone(), Arc::new(transport.clone()), quick());
        timeout(Duration::from_secs(2), provider.wait_for(SyncStatus::Synced))
            .await
            .unwrap();
        providers.push(provider);
    }

    for (i, doc) in docs.iter().enumerate() {
        for row in 0..5u32 {
            lock(doc).set_cell(row, i as u32, CellPatch::value(format!("{i}:{row}")));
        }
        // Everyone also fights over one cell.
        lock(doc).set_cell(99, 0, CellPatch::value(i as i64));
    }

    let converged = timeout(Duration::from_secs(2), async {
        loop {
            let views: Vec<_> = docs.iter().map(|d| lock(d).all_cells()).collect();
            if views.iter().all(|v| v.len() == 21 && *v == views[0]) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "replicas did not converge");

    for provider in providers {
        provider.shutdown().await;
    }
}

/// A hand-driven relay end: reads what the provider sends and answers
/// from its own document.
struct ScriptedPeer {
    conn: Connection,
    doc: Document,
    protocol: SyncProtocol,
}

impl ScriptedPeer {
    async fn accept(listener: &mut MemoryListener, doc: Document) -> Self {
        let conn = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        Self {
            conn,
            doc,
            protocol: SyncProtocol::responder(),
        }
    }

    /// Next envelope from the provider, skipping awareness chatter.
    async fn recv(&mut self) -> Envelope {
        loop {
            let text = timeout(Duration::from_secs(2), self.conn.stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let envelope = Envelope::decode(&text).unwrap();
            if !matches!(envelope, Envelope::Awareness { .. }) {
                return envelope;
            }
        }
    }

    async fn send(&mut self, envelope: Envelope) {
        self.conn.sink.send(envelope.encode().unwrap()).await.unwrap();
    }

    /// Answers one envelope the way the relay would.
    async fn answer(&mut self, envelope: Envelope) {
        let outcome = self
            .protocol
            .handle(&mut self.doc, envelope, Origin::Remote(ReplicaId::NIL))
            .unwrap();
        for reply in outcome.replies {
            self.send(reply).await;
        }
    }
}

fn seeded(value: &str) -> Document {
    let mut doc = Document::new();
    doc.set_cell(0, 0, CellPatch::value(value));
    doc
}

async fn wait_for_cell(doc: &SharedDoc, row: u32, col: u32) -> Scalar {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(record) = lock(doc).get_cell(row, col) {
                return record.value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_unmergeable_update_triggers_snapshot_request() {
    let (transport, mut listener) = MemoryTransport::new();
    let doc = shared(Document::new());
    let provider = SyncProvider::spawn(doc.clone(), Arc::new(transport), quick());

    let mut peer = ScriptedPeer::accept(&mut listener, seeded("from relay")).await;
    let step1 = peer.recv().await;
    peer.answer(step1).await;
    let step3 = peer.recv().await;
    assert!(matches!(step3, Envelope::SyncStep3 { .. }));
    peer.answer(step3).await;
    timeout(Duration::from_secs(2), provider.wait_for(SyncStatus::Synced))
        .await
        .unwrap();

    peer.send(Envelope::Update {
        update: vec![0x01, 0xff, 0xff, 0xff],
    })
    .await;
    let request = peer.recv().await;
    assert_eq!(
        request,
        Envelope::SyncStep1 {
            state_vector: Vec::new()
        }
    );
    assert!(provider.is_offline());

    peer.doc.set_cell(1, 1, CellPatch::value("after recovery"));
    peer.answer(request).await;
    assert_eq!(wait_for_cell(&doc, 1, 1).await, Scalar::from("after recovery"));
    timeout(Duration::from_secs(2), provider.wait_for(SyncStatus::Synced))
        .await
        .unwrap();
    assert_eq!(lock(&doc).all_cells(), peer.doc.all_cells());
    provider.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_step2_is_retried_not_stuck() {
    let (transport, mut listener) = MemoryTransport::new();
    let doc = shared(Document::new());
    let provider = SyncProvider::spawn(doc.clone(), Arc::new(transport), quick());

    let mut peer = ScriptedPeer::accept(&mut listener, seeded("from relay")).await;
    assert!(matches!(peer.recv().await, Envelope::SyncStep1 { .. }));
    peer.send(Envelope::SyncStep2 {
        update: vec![0x01, 0xff],
        state_vector: peer.doc.encode_state_vector(),
    })
    .await;

    let retry = peer.recv().await;
    assert_eq!(
        retry,
        Envelope::SyncStep1 {
            state_vector: Vec::new()
        }
    );
    peer.answer(retry).await;
    timeout(Duration::from_secs(2), provider.wait_for(SyncStatus::Synced))
        .await
        .unwrap();
    assert_eq!(wait_for_cell(&doc, 0, 0).await, Scalar::from("from relay"));
    provider.shutdown().await;
}
