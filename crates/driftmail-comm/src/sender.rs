//! The upstream half of replication.
//!
//! Every locally successful IMAP mutation becomes one update message: the
//! sender stamps it with the replica's incremented clock, appends it to a
//! durable outbound log, and ships it to every peer over its own task.
//! Entries are retransmitted with exponential backoff until the peer
//! confirms them; a per-peer cursor persisted next to the log records how
//! far each peer has confirmed, so delivery stays in sender-order and an
//! entry is never re-sent after its confirmation was recorded.

use crate::clock::ClockHandle;
use crate::msg::{Confirmation, Operation, UpdateMessage, STATUS_OK};
use crate::wire;
use driftmail_common::config::{PeerConfig, SyncConfig};
use driftmail_common::{Error, Result};
use rand::Rng;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Durable, append-structured log of stamped outbound updates.
struct OutboundLog {
    path: PathBuf,
    entries: Vec<UpdateMessage>,
}

impl OutboundLog {
    fn open(path: PathBuf) -> Result<Self> {
        let mut entries = Vec::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Storage(format!("failed to read outbound log: {}", e)))?;
            for line in raw.lines().filter(|l| !l.is_empty()) {
                entries.push(UpdateMessage::decode(line.as_bytes())?);
            }
        }
        Ok(Self { path, entries })
    }

    fn append(&mut self, msg: &UpdateMessage) -> Result<()> {
        let mut line = msg.encode()?;
        line.push(b'\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Storage(format!("failed to open outbound log: {}", e)))?;
        file.write_all(&line)
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::Storage(format!("failed to append to outbound log: {}", e)))?;

        self.entries.push(msg.clone());
        Ok(())
    }
}

/// Stamps, logs and transmits locally originated updates.
pub struct Sender {
    replica: String,
    state_dir: PathBuf,
    clock: Arc<ClockHandle>,
    log: Mutex<OutboundLog>,
    cursors: std::sync::Mutex<BTreeMap<String, usize>>,
    peers: BTreeMap<String, PeerConfig>,
    config: SyncConfig,
    appended: Notify,
    acked: Notify,
}

impl Sender {
    /// Open the sender's durable state under `state_dir` (outbound log,
    /// vector clock, per-peer cursors), recovering whatever survived a
    /// restart.
    pub fn open(
        replica: impl Into<String>,
        state_dir: impl Into<PathBuf>,
        peers: BTreeMap<String, PeerConfig>,
        config: SyncConfig,
    ) -> Result<Arc<Self>> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| Error::Storage(format!("failed to create sync state dir: {}", e)))?;

        let clock = Arc::new(ClockHandle::open(state_dir.join("clock.json"))?);
        let log = OutboundLog::open(state_dir.join("outbound.log"))?;

        let mut cursors = BTreeMap::new();
        for peer in peers.keys() {
            let cursor = load_cursor(&cursor_path(&state_dir, peer))?;
            cursors.insert(peer.clone(), cursor);
        }

        Ok(Arc::new(Self {
            replica: replica.into(),
            state_dir,
            clock,
            log: Mutex::new(log),
            cursors: std::sync::Mutex::new(cursors),
            peers,
            config,
            appended: Notify::new(),
            acked: Notify::new(),
        }))
    }

    /// The clock this sender stamps with; shared with the receiver so
    /// deliveries and emissions advance the same persistent clock.
    pub fn clock(&self) -> Arc<ClockHandle> {
        Arc::clone(&self.clock)
    }

    /// Stamp `operation`, append it durably and wake the peer tasks.
    ///
    /// Blocks only when the undelivered backlog has crossed the
    /// configured threshold; peer unavailability below that threshold
    /// never stalls local IMAP progress.
    pub async fn send(&self, operation: Operation) -> Result<()> {
        loop {
            let notified = self.acked.notified();
            if self.pending().await < self.config.outbound_backlog_max {
                break;
            }
            notified.await;
        }

        // The log lock spans clock tick and append: log order is clock
        // order, and peers replay entries in exactly that order.
        let mut log = self.log.lock().await;
        let vclock = self.clock.tick(&self.replica)?;
        let msg = UpdateMessage {
            replica: self.replica.clone(),
            vclock,
            operation,
        };
        log.append(&msg)?;
        drop(log);

        self.appended.notify_waiters();
        Ok(())
    }

    /// Spawn one transmit task per configured peer.
    pub fn spawn_peer_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.peers
            .iter()
            .map(|(name, peer)| {
                let sender = Arc::clone(self);
                let name = name.clone();
                let address = peer.address.clone();
                tokio::spawn(async move { sender.run_peer(name, address).await })
            })
            .collect()
    }

    async fn run_peer(&self, peer: String, address: String) {
        let mut attempt: u32 = 0;
        loop {
            match self.drain_to_peer(&peer, &address).await {
                Ok(()) => attempt = 0,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff(attempt);
                    warn!(
                        peer = %peer,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "peer sync failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One connection lifetime: dial once there is work, then replay
    /// entries from the peer's cursor, advancing it per confirmation.
    async fn drain_to_peer(&self, peer: &str, address: &str) -> Result<()> {
        self.wait_for_entry(peer).await;

        let io_timeout = Duration::from_secs(self.config.io_timeout_secs);
        let mut stream = timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            TcpStream::connect(address),
        )
        .await
        .map_err(|_| Error::Transport(format!("dial timeout connecting to {}", address)))?
        .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", address, e)))?;

        info!(peer = %peer, address = %address, "connected to peer");

        loop {
            let next = {
                let log = self.log.lock().await;
                log.entries.get(self.cursor(peer)).cloned()
            };
            let Some(msg) = next else {
                self.wait_for_entry(peer).await;
                continue;
            };

            let payload = msg.encode()?;
            timeout(io_timeout, wire::write_frame(&mut stream, &payload))
                .await
                .map_err(|_| Error::Transport(format!("send timeout to {}", peer)))??;

            let reply = timeout(io_timeout, wire::read_frame(&mut stream))
                .await
                .map_err(|_| Error::Transport(format!("receive timeout from {}", peer)))??
                .ok_or_else(|| {
                    Error::Transport(format!("peer {} closed the sync channel", peer))
                })?;

            let conf = Confirmation::decode(&reply)?;
            if conf.status != STATUS_OK {
                return Err(Error::Transport(format!(
                    "peer {} rejected update with status {}",
                    peer, conf.status
                )));
            }

            self.advance_cursor(peer)?;
            self.acked.notify_waiters();
            debug!(
                peer = %peer,
                seq = msg.sender_seq(),
                op = msg.operation.name(),
                "update confirmed by peer"
            );
        }
    }

    async fn wait_for_entry(&self, peer: &str) {
        loop {
            let notified = self.appended.notified();
            {
                let log = self.log.lock().await;
                if self.cursor(peer) < log.entries.len() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Entries not yet confirmed by the slowest peer.
    async fn pending(&self) -> usize {
        if self.peers.is_empty() {
            return 0;
        }
        let len = self.log.lock().await.entries.len();
        let cursors = self.cursors.lock().expect("cursor lock poisoned");
        let slowest = self
            .peers
            .keys()
            .map(|p| cursors.get(p).copied().unwrap_or(0))
            .min()
            .unwrap_or(len);
        len.saturating_sub(slowest)
    }

    fn cursor(&self, peer: &str) -> usize {
        self.cursors
            .lock()
            .expect("cursor lock poisoned")
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    fn advance_cursor(&self, peer: &str) -> Result<()> {
        let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
        let next = cursors.get(peer).copied().unwrap_or(0) + 1;
        store_cursor(&cursor_path(&self.state_dir, peer), next)?;
        cursors.insert(peer.to_string(), next);
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self.config.retry_base_ms.saturating_mul(1u64 << shift);
        let capped = exp.min(self.config.retry_cap_ms);
        let jitter = if self.config.retry_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.config.retry_jitter_ms)
        };
        Duration::from_millis(capped + jitter)
    }
}

fn cursor_path(state_dir: &std::path::Path, peer: &str) -> PathBuf {
    state_dir.join(format!("ack-{}.cursor", peer))
}

fn load_cursor(path: &std::path::Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Storage(format!("failed to read ack cursor: {}", e)))?;
    raw.trim()
        .parse()
        .map_err(|e| Error::Storage(format!("failed to parse ack cursor: {}", e)))
}

fn store_cursor(path: &std::path::Path, value: usize) -> Result<()> {
    let tmp_path = path.with_extension("cursor.tmp");
    let mut tmp = std::fs::File::create(&tmp_path)
        .map_err(|e| Error::Storage(format!("failed to create cursor tempfile: {}", e)))?;
    tmp.write_all(value.to_string().as_bytes())
        .and_then(|_| tmp.sync_all())
        .map_err(|e| Error::Storage(format!("failed to write cursor tempfile: {}", e)))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Storage(format!("failed to swap cursor file: {}", e)))
}
