//! The downstream half of replication.
//!
//! Each peer connection delivers length-prefixed update frames. A frame is
//! confirmed only after the downstream applier has fully executed it;
//! frames that are not yet causally deliverable wait in a per-sender
//! min-heap keyed by the sender's own clock entry, and every delivery
//! re-probes the heads of all heaps until no further message is
//! deliverable.

use crate::clock::ClockHandle;
use crate::msg::{Confirmation, UpdateMessage, STATUS_OK};
use crate::wire;
use driftmail_common::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// A deliverable update handed to the applier; `done` is signalled when
/// every effect of the message has been executed.
pub struct ApplyRequest {
    pub msg: UpdateMessage,
    pub done: oneshot::Sender<()>,
}

/// An update held back until its causal dependencies are delivered.
struct PendingMsg {
    seq: u32,
    msg: UpdateMessage,
    conf: oneshot::Sender<u32>,
}

impl PartialEq for PendingMsg {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingMsg {}

impl PartialOrd for PendingMsg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingMsg {
    // Reversed so the BinaryHeap pops the lowest sender sequence first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.seq.cmp(&self.seq)
    }
}

/// Accepts update frames from peers and feeds them, in causal order, to
/// the downstream applier.
pub struct Receiver {
    clock: Arc<ClockHandle>,
    apply_tx: mpsc::Sender<ApplyRequest>,
    pending: Mutex<HashMap<String, BinaryHeap<PendingMsg>>>,
}

impl Receiver {
    pub fn new(clock: Arc<ClockHandle>, apply_tx: mpsc::Sender<ApplyRequest>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            apply_tx,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Accept peer connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| Error::Transport(format!("accept on sync port failed: {}", e)))?;
            info!(peer_addr = %addr, "peer connected to sync port");

            let receiver = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = receiver.handle_connection(stream).await {
                    warn!(peer_addr = %addr, error = %e, "peer sync connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        while let Some(frame) = wire::read_frame(&mut stream).await? {
            let status = match UpdateMessage::decode(&frame) {
                Ok(msg) => self.ingest(msg).await?,
                Err(e) => {
                    warn!(error = %e, "refusing undecodable update frame");
                    1
                }
            };
            wire::write_frame(&mut stream, &Confirmation { status }.encode()?).await?;
        }
        Ok(())
    }

    /// Hand one update through causal ordering to the applier. Resolves
    /// with the confirmation status once the message (and anything it
    /// unblocked) has been fully applied, however long it had to wait.
    pub async fn ingest(&self, msg: UpdateMessage) -> Result<u32> {
        let (conf_tx, conf_rx) = oneshot::channel();
        self.submit(msg, conf_tx).await?;
        conf_rx
            .await
            .map_err(|_| Error::Internal("pending confirmation was dropped".to_string()))
    }

    async fn submit(&self, msg: UpdateMessage, conf: oneshot::Sender<u32>) -> Result<()> {
        // Serializes deliverability checks: pending heaps drain fully
        // before the next incoming frame is considered.
        let mut pending = self.pending.lock().await;

        // A sequence number at or below the local clock was already
        // applied; the confirmation got lost on the way back. Re-confirm
        // without re-applying.
        if msg.sender_seq() <= self.clock.snapshot().get(&msg.replica) {
            debug!(
                replica = %msg.replica,
                seq = msg.sender_seq(),
                "re-confirming already applied update"
            );
            let _ = conf.send(STATUS_OK);
            return Ok(());
        }

        if self.clock.delivers(&msg.replica, &msg.vclock) {
            self.deliver(msg).await?;
            let _ = conf.send(STATUS_OK);
            self.drain(&mut pending).await?;
        } else {
            debug!(
                replica = %msg.replica,
                seq = msg.sender_seq(),
                "deferring causally premature update"
            );
            pending
                .entry(msg.replica.clone())
                .or_default()
                .push(PendingMsg {
                    seq: msg.sender_seq(),
                    msg,
                    conf,
                });
        }
        Ok(())
    }

    /// Re-probe all heap heads in a fixed round; stop once a full round
    /// delivers nothing.
    async fn drain(&self, pending: &mut HashMap<String, BinaryHeap<PendingMsg>>) -> Result<()> {
        loop {
            let mut delivered = false;
            for heap in pending.values_mut() {
                while let Some(head) = heap.peek() {
                    if !self.clock.delivers(&head.msg.replica, &head.msg.vclock) {
                        break;
                    }
                    let entry = heap.pop().expect("peeked entry vanished");
                    self.deliver(entry.msg).await?;
                    let _ = entry.conf.send(STATUS_OK);
                    delivered = true;
                }
            }
            if !delivered {
                break;
            }
        }
        pending.retain(|_, heap| !heap.is_empty());
        Ok(())
    }

    async fn deliver(&self, msg: UpdateMessage) -> Result<()> {
        let replica = msg.replica.clone();
        let seq = msg.sender_seq();
        let op = msg.operation.name();
        let vclock = msg.vclock.clone();

        let (done_tx, done_rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyRequest { msg, done: done_tx })
            .await
            .map_err(|_| Error::Internal("applier channel closed".to_string()))?;
        done_rx
            .await
            .map_err(|_| Error::Internal("applier dropped an in-flight update".to_string()))?;

        self.clock.observe(&vclock)?;
        debug!(replica = %replica, seq, op, "applied remote update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Element, Operation};
    use crate::sender::Sender;
    use driftmail_common::config::{PeerConfig, SyncConfig};
    use driftmail_crdt::VectorClock;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn update(replica: &str, entries: &[(&str, u32)], mailbox: &str) -> UpdateMessage {
        let mut vclock = VectorClock::new();
        for (name, counter) in entries {
            for _ in 0..*counter {
                vclock.increment(name);
            }
        }
        UpdateMessage {
            replica: replica.to_string(),
            vclock,
            operation: Operation::Create {
                user: "alice".to_string(),
                mailbox: mailbox.to_string(),
                add_mailbox: Element::new("t-1", mailbox),
            },
        }
    }

    /// Applier stub: records mailbox names in apply order and completes
    /// each request immediately.
    fn stub_applier() -> (mpsc::Sender<ApplyRequest>, mpsc::UnboundedReceiver<String>) {
        let (apply_tx, mut apply_rx) = mpsc::channel::<ApplyRequest>(16);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(req) = apply_rx.recv().await {
                if let Operation::Create { mailbox, .. } = &req.msg.operation {
                    let _ = seen_tx.send(mailbox.clone());
                }
                let _ = req.done.send(());
            }
        });
        (apply_tx, seen_rx)
    }

    #[tokio::test]
    async fn test_premature_update_waits_for_its_dependency() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ClockHandle::open(dir.path().join("clock.json")).unwrap());
        let (apply_tx, mut seen) = stub_applier();
        let receiver = Receiver::new(clock, apply_tx);

        // m2 depends on m1; it arrives first and must wait.
        let m1 = update("r1", &[("r1", 1)], "from-r1");
        let m2 = update("r2", &[("r1", 1), ("r2", 1)], "from-r2");

        let deferred = tokio::spawn({
            let receiver = Arc::clone(&receiver);
            async move { receiver.ingest(m2).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!deferred.is_finished());

        assert_eq!(receiver.ingest(m1).await.unwrap(), STATUS_OK);
        assert_eq!(
            timeout(Duration::from_secs(1), deferred)
                .await
                .unwrap()
                .unwrap()
                .unwrap(),
            STATUS_OK
        );

        assert_eq!(seen.recv().await.unwrap(), "from-r1");
        assert_eq!(seen.recv().await.unwrap(), "from-r2");
    }

    #[tokio::test]
    async fn test_redelivered_update_confirms_without_reapplying() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ClockHandle::open(dir.path().join("clock.json")).unwrap());
        let (apply_tx, mut seen) = stub_applier();
        let receiver = Receiver::new(clock, apply_tx);

        let m1 = update("r1", &[("r1", 1)], "from-r1");
        assert_eq!(receiver.ingest(m1.clone()).await.unwrap(), STATUS_OK);
        assert_eq!(receiver.ingest(m1).await.unwrap(), STATUS_OK);

        assert_eq!(seen.recv().await.unwrap(), "from-r1");
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sender_to_receiver_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let recv_dir = TempDir::new().unwrap();
        let clock = Arc::new(ClockHandle::open(recv_dir.path().join("clock.json")).unwrap());
        let (apply_tx, mut seen) = stub_applier();
        let receiver = Receiver::new(clock, apply_tx);
        tokio::spawn(receiver.run(listener));

        let mut peers = BTreeMap::new();
        peers.insert("worker-2".to_string(), PeerConfig { address });

        let send_dir = TempDir::new().unwrap();
        let sender = Sender::open(
            "worker-1",
            send_dir.path(),
            peers,
            SyncConfig::default(),
        )
        .unwrap();
        sender.spawn_peer_tasks();

        sender
            .send(Operation::Create {
                user: "alice".to_string(),
                mailbox: "Drafts".to_string(),
                add_mailbox: Element::new("t-1", "Drafts"),
            })
            .await
            .unwrap();

        let applied = timeout(Duration::from_secs(5), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(applied, "Drafts");
    }
}
