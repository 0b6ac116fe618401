//! Worker-side session serving.
//!
//! The distributor opens one connection per client session, announces the
//! authenticated user with a `SESSION <user>` line, then relays IMAP
//! command lines. Mutating commands run the upstream handlers under the
//! node's write lock and hand the composed update to the sender after the
//! lock is released; `DONE` (or a disconnect) ends the session.

use crate::command::{literal_size, Request};
use crate::mailbox;
use crate::node::Node;
use driftmail_comm::{Operation, Sender};
use driftmail_common::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Serves proxied IMAP sessions against the local node state.
pub struct Worker {
    node: Arc<Node>,
    sender: Arc<Sender>,
}

impl Worker {
    pub fn new(node: Arc<Node>, sender: Arc<Sender>) -> Arc<Self> {
        Arc::new(Self { node, sender })
    }

    /// Accept session connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| Error::Transport(format!("accept on session port failed: {}", e)))?;
            debug!(peer_addr = %addr, "session connection accepted");

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = worker.handle_session(stream).await {
                    warn!(peer_addr = %addr, error = %e, "session failed");
                }
            });
        }
    }

    async fn handle_session(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        read_line(&mut reader, &mut line).await?;
        let user = line
            .trim()
            .strip_prefix("SESSION ")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Protocol("session handshake missing user".to_string()))?
            .to_string();

        {
            let mut state = self.node.state.write().await;
            state.ensure_user(&user)?;
        }
        info!(user = %user, "worker session started");

        // The worker continues the session in the authenticated state;
        // the selection lives here for the lifetime of the connection.
        let mut selected: Option<String> = None;

        loop {
            line.clear();
            if read_line(&mut reader, &mut line).await? == 0 || line.trim() == "DONE" {
                break;
            }

            let req = match Request::parse(&line) {
                Ok(req) => req,
                Err(_) => {
                    send_line(&mut writer, "* BAD Received invalid IMAP command").await?;
                    continue;
                }
            };

            let reply = match req.command.as_str() {
                "SELECT" | "EXAMINE" => {
                    let outcome = self.select(&user, &req).await;
                    if outcome.is_ok() {
                        selected = req.args.first().cloned();
                    }
                    outcome
                }
                "CREATE" => self.create(&user, &req).await,
                "DELETE" => self.delete(&user, &req).await,
                "EXPUNGE" => self.expunge(&user, &req, selected.as_deref()).await,
                "STORE" => self.store(&user, &req, selected.as_deref()).await,
                "APPEND" => self.append(&user, &req, &mut reader, &mut writer).await,
                "CLOSE" | "UNSELECT" => {
                    selected = None;
                    Ok(format!("{} OK {} completed", req.tag, req.command))
                }
                "NOOP" => Ok(format!("{} OK NOOP completed", req.tag)),
                _ => Ok(format!("{} BAD Received invalid IMAP command", req.tag)),
            };

            match reply {
                Ok(text) => send_line(&mut writer, &text).await?,
                Err(e) => send_line(&mut writer, &format!("{} NO {}", req.tag, e)).await?,
            }
        }

        info!(user = %user, "worker session ended");
        Ok(())
    }

    async fn select(&self, user: &str, req: &Request) -> Result<String> {
        let mailbox = first_arg(req)?;
        let state = self.node.state.read().await;

        let hosted = state
            .structure_set(user)
            .is_some_and(|s| s.lookup(&mailbox));
        if !hosted {
            return Err(Error::Protocol(format!("no such mailbox {}", mailbox)));
        }

        let exists = state
            .contents
            .get(user)
            .and_then(|c| c.get(&mailbox))
            .map(|sequence| sequence.len())
            .unwrap_or(0);
        Ok(format!(
            "* {} EXISTS\r\n* OK [UIDVALIDITY 1] UIDs valid\r\n{} OK [READ-WRITE] {} completed",
            exists, req.tag, req.command
        ))
    }

    async fn create(&self, user: &str, req: &Request) -> Result<String> {
        let mailbox = first_arg(req)?;
        let op = {
            let mut state = self.node.state.write().await;
            mailbox::create_mailbox(&mut state, user, &mailbox)?
        };
        self.emit(op).await;
        Ok(format!("{} OK CREATE completed", req.tag))
    }

    async fn delete(&self, user: &str, req: &Request) -> Result<String> {
        let mailbox = first_arg(req)?;
        let op = {
            let mut state = self.node.state.write().await;
            mailbox::delete_mailbox(&mut state, user, &mailbox)?
        };
        self.emit(op).await;
        Ok(format!("{} OK DELETE completed", req.tag))
    }

    async fn expunge(&self, user: &str, req: &Request, selected: Option<&str>) -> Result<String> {
        let seq = parse_seq(&first_arg(req)?)?;
        let mailbox = require_selected(selected)?;
        let op = {
            let mut state = self.node.state.write().await;
            mailbox::expunge_mail(&mut state, user, mailbox, seq)?
        };
        self.emit(op).await;
        Ok(format!("* {} EXPUNGE\r\n{} OK EXPUNGE completed", seq, req.tag))
    }

    async fn store(&self, user: &str, req: &Request, selected: Option<&str>) -> Result<String> {
        let seq = parse_seq(&first_arg(req)?)?;
        let mailbox = require_selected(selected)?;
        let flags = parse_flags(req);

        let op = {
            let mut state = self.node.state.write().await;
            mailbox::store_mail(&mut state, user, mailbox, seq, &flags)?
        };
        if let Some(op) = op {
            self.emit(op).await;
        }
        Ok(format!(
            "* {} FETCH (FLAGS ({}))\r\n{} OK STORE completed",
            seq,
            flags.join(" "),
            req.tag
        ))
    }

    async fn append(
        &self,
        user: &str,
        req: &Request,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<String> {
        let mailbox = first_arg(req)?;
        let size = literal_size(req)
            .ok_or_else(|| Error::Protocol("APPEND requires a literal size".to_string()))?;

        send_line(writer, "+ Ready for literal data").await?;

        let mut contents = vec![0u8; size];
        reader
            .read_exact(&mut contents)
            .await
            .map_err(|e| Error::Transport(format!("failed to read APPEND literal: {}", e)))?;
        let mut tail = String::new();
        read_line(reader, &mut tail).await?;

        let op = {
            let mut state = self.node.state.write().await;
            mailbox::append_mail(&mut state, user, &mailbox, &contents)?
        };
        self.emit(op).await;
        Ok(format!("{} OK APPEND completed", req.tag))
    }

    /// Ship an already-applied local mutation. A failure here means the
    /// update reached local state but can never reach the peers; that is
    /// divergence, and divergence is fatal.
    async fn emit(&self, op: Operation) {
        if let Err(e) = self.sender.send(op).await {
            error!(error = %e, "failed to log outbound update after local apply; terminating");
            std::process::exit(1);
        }
    }
}

fn require_selected(selected: Option<&str>) -> Result<&str> {
    selected.ok_or_else(|| Error::Protocol("no mailbox selected".to_string()))
}

fn first_arg(req: &Request) -> Result<String> {
    req.args
        .first()
        .cloned()
        .ok_or_else(|| Error::Protocol(format!("{} requires an argument", req.command)))
}

fn parse_seq(token: &str) -> Result<u32> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid sequence number {}", token)))
}

/// Flag tokens of a STORE line, parentheses stripped.
fn parse_flags(req: &Request) -> Vec<String> {
    let Some(flags_at) = req
        .args
        .iter()
        .position(|a| a.eq_ignore_ascii_case("FLAGS"))
    else {
        return Vec::new();
    };
    req.args[flags_at + 1..]
        .iter()
        .map(|a| a.trim_matches(['(', ')']).to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>, line: &mut String) -> Result<usize> {
    reader
        .read_line(line)
        .await
        .map_err(|e| Error::Transport(format!("failed to read session line: {}", e)))
}

async fn send_line(writer: &mut OwnedWriteHalf, text: &str) -> Result<()> {
    writer
        .write_all(format!("{}\r\n", text).as_bytes())
        .await
        .map_err(|e| Error::Transport(format!("failed to write session line: {}", e)))
}
