//! The distributor tier.
//!
//! Accepts client connections (TLS termination happens in front of this
//! process and is not handled here), greets with `* OK IMAP4rev1 …`,
//! answers the handful of commands owned by this tier and proxies
//! everything an authenticated session sends to the user's sticky worker.
//! Unknown or out-of-state commands get a tagged BAD and the session
//! carries on.

use crate::auth::PlainAuthenticator;
use crate::command::{literal_size, Request};
use crate::session::{Session, SessionState};
use driftmail_common::config::WorkerConfig;
use driftmail_common::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Where a command is handled, given the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answered here, in any state
    Capability,
    /// Answered here, in any state
    Noop,
    /// Answered here; TLS is terminated in front of this process
    StartTls,
    /// Authentication attempt
    Login,
    /// Session teardown
    Logout,
    /// Forwarded to the user's sticky worker
    Proxy,
    /// Rejected with a tagged BAD
    Bad,
}

/// The distributor-side transition table: CAPABILITY and NOOP are legal
/// everywhere, LOGIN/STARTTLS/LOGOUT are owned by this tier, and anything
/// else is proxied once authenticated and BAD before that.
pub fn route(state: SessionState, command: &str) -> Route {
    match command {
        "CAPABILITY" => Route::Capability,
        "NOOP" => Route::Noop,
        "STARTTLS" => Route::StartTls,
        "LOGIN" | "AUTHENTICATE" => Route::Login,
        "LOGOUT" => Route::Logout,
        _ if matches!(
            state,
            SessionState::Authenticated | SessionState::Mailbox
        ) =>
        {
            Route::Proxy
        }
        _ => Route::Bad,
    }
}

/// Routes authenticated sessions to workers.
pub struct Distributor {
    greeting: String,
    timeout_minutes: i64,
    auth: Arc<dyn PlainAuthenticator>,
    workers: BTreeMap<String, WorkerConfig>,
}

impl Distributor {
    pub fn new(
        greeting: impl Into<String>,
        timeout_minutes: i64,
        auth: Arc<dyn PlainAuthenticator>,
        workers: BTreeMap<String, WorkerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            greeting: greeting.into(),
            timeout_minutes,
            auth,
            workers,
        })
    }

    /// Accept client connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("listening for incoming IMAP requests");
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| Error::Transport(format!("accept on IMAP port failed: {}", e)))?;
            debug!(peer_addr = %addr, "client connected");

            let distributor = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = distributor.handle_connection(stream).await {
                    warn!(peer_addr = %addr, error = %e, "client connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        send_line(
            &mut writer,
            &format!("* OK IMAP4rev1 {}", self.greeting),
        )
        .await?;

        let mut session = Session::new();
        let mut link: Option<WorkerLink> = None;
        let idle_limit = Duration::from_secs((self.timeout_minutes.max(1) as u64) * 60);

        let mut line = String::new();
        while session.state != SessionState::Logout {
            line.clear();
            let read = tokio::time::timeout(idle_limit, reader.read_line(&mut line)).await;
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(error = %e, "receive error from client");
                    break;
                }
                Err(_) => {
                    let _ = send_line(&mut writer, "* BYE Autologout; idle too long").await;
                    break;
                }
            };
            if n == 0 {
                debug!(session = %session.id, "client disconnected");
                break;
            }

            let req = match Request::parse(&line) {
                Ok(req) => req,
                Err(_) => {
                    send_line(&mut writer, "* BAD Received invalid IMAP command").await?;
                    continue;
                }
            };

            match route(session.state, &req.command) {
                Route::Capability => {
                    send_line(
                        &mut writer,
                        &format!(
                            "* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\n{} OK CAPABILITY completed",
                            req.tag
                        ),
                    )
                    .await?;
                }
                Route::Noop => {
                    send_line(&mut writer, &format!("{} OK NOOP completed", req.tag)).await?;
                }
                Route::StartTls => {
                    send_line(&mut writer, &format!("{} BAD TLS is already active", req.tag))
                        .await?;
                }
                Route::Login => {
                    self.handle_login(&mut session, &mut link, &req, &mut writer)
                        .await?;
                }
                Route::Logout => {
                    if let Some(link) = &mut link {
                        link.done().await;
                    }
                    send_line(
                        &mut writer,
                        &format!(
                            "* BYE Terminating connection\r\n{} OK LOGOUT completed",
                            req.tag
                        ),
                    )
                    .await?;
                    session.logout();
                }
                Route::Proxy => match &mut link {
                    Some(link) => {
                        self.proxy(&mut session, link, &req, &line, &mut reader, &mut writer)
                            .await?;
                    }
                    None => {
                        send_line(
                            &mut writer,
                            &format!("{} BAD Received invalid IMAP command", req.tag),
                        )
                        .await?;
                    }
                },
                Route::Bad => {
                    send_line(
                        &mut writer,
                        &format!("{} BAD Received invalid IMAP command", req.tag),
                    )
                    .await?;
                }
            }
        }

        // A dropped connection still signals session-done to the worker.
        if session.state != SessionState::Logout {
            if let Some(link) = &mut link {
                link.done().await;
            }
        }
        Ok(())
    }

    async fn handle_login(
        &self,
        session: &mut Session,
        link: &mut Option<WorkerLink>,
        req: &Request,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        if session.state != SessionState::NotAuthenticated {
            return send_line(
                writer,
                &format!("{} BAD Command received in invalid state", req.tag),
            )
            .await;
        }
        let (Some(user), Some(password)) = (req.args.first(), req.args.get(1)) else {
            return send_line(
                writer,
                &format!("{} BAD Received invalid IMAP command", req.tag),
            )
            .await;
        };

        if self.auth.authenticate(user, password).is_err() {
            return send_line(
                writer,
                &format!("{} NO Name and / or password wrong", req.tag),
            )
            .await;
        }

        let (worker, address) = self.assign_worker(user)?;
        match WorkerLink::connect(&worker, &address, user).await {
            Ok(worker_link) => {
                info!(user = %user, worker = %worker, "session authenticated");
                *link = Some(worker_link);
                session.authenticate(user.clone(), worker);
                send_line(writer, &format!("{} OK LOGIN completed", req.tag)).await
            }
            Err(e) => {
                warn!(user = %user, worker = %worker, error = %e, "worker unavailable");
                send_line(writer, &format!("{} NO Worker node unavailable", req.tag)).await
            }
        }
    }

    /// Forward one authenticated command, relay the worker's reply, and
    /// mirror SELECT/CLOSE outcomes into the session record. A worker
    /// continuation request switches into literal relay for APPEND.
    async fn proxy(
        &self,
        session: &mut Session,
        link: &mut WorkerLink,
        req: &Request,
        raw_line: &str,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        link.send_line(raw_line.trim_end_matches(['\r', '\n'])).await?;
        let (lines, continuation) = link.read_reply(&req.tag).await?;
        for reply in &lines {
            send_line(writer, reply).await?;
        }

        if continuation {
            let size = literal_size(req).ok_or_else(|| {
                Error::Protocol("worker requested a literal without a size".to_string())
            })?;
            session.append_in_progress = true;

            let mut contents = vec![0u8; size];
            reader
                .read_exact(&mut contents)
                .await
                .map_err(|e| Error::Transport(format!("failed to read APPEND literal: {}", e)))?;
            let mut tail = String::new();
            reader
                .read_line(&mut tail)
                .await
                .map_err(|e| Error::Transport(format!("failed to read literal tail: {}", e)))?;

            link.send_raw(&contents).await?;
            link.send_raw(b"\r\n").await?;
            session.append_in_progress = false;

            let (lines, _) = link.read_reply(&req.tag).await?;
            for reply in &lines {
                send_line(writer, reply).await?;
            }
            session.update_activity();
            return Ok(());
        }

        let completed_ok = lines
            .last()
            .is_some_and(|l| l.starts_with(&format!("{} OK", req.tag)));
        if completed_ok {
            match req.command.as_str() {
                "SELECT" | "EXAMINE" => {
                    if let Some(mailbox) = req.args.first() {
                        session.select(mailbox.clone());
                    }
                }
                "CLOSE" | "UNSELECT" => session.close_mailbox(),
                _ => session.update_activity(),
            }
        }
        Ok(())
    }

    /// Sticky worker assignment: a user always hashes to the same worker.
    fn assign_worker(&self, user: &str) -> Result<(String, String)> {
        if self.workers.is_empty() {
            return Err(Error::Config("no workers configured".to_string()));
        }
        let mut hasher = DefaultHasher::new();
        user.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.workers.len();
        let (name, worker) = self
            .workers
            .iter()
            .nth(index)
            .expect("index bounded by worker count");
        Ok((name.clone(), worker.address.clone()))
    }
}

/// One distributor→worker session connection.
struct WorkerLink {
    worker: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl WorkerLink {
    async fn connect(worker: &str, address: &str, user: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::Transport(format!("failed to reach worker {}: {}", worker, e)))?;
        let (read_half, writer) = stream.into_split();
        let mut link = Self {
            worker: worker.to_string(),
            reader: BufReader::new(read_half),
            writer,
        };
        link.send_line(&format!("SESSION {}", user)).await?;
        Ok(link)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| {
                Error::Transport(format!("failed to forward to worker {}: {}", self.worker, e))
            })
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await.map_err(|e| {
            Error::Transport(format!("failed to forward to worker {}: {}", self.worker, e))
        })
    }

    /// Collect reply lines until the tagged completion, or until the
    /// worker asks for a continuation.
    async fn read_reply(&mut self, tag: &str) -> Result<(Vec<String>, bool)> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.map_err(|e| {
                Error::Transport(format!("failed to read from worker {}: {}", self.worker, e))
            })?;
            if n == 0 {
                return Err(Error::Transport(format!(
                    "worker {} closed the session channel",
                    self.worker
                )));
            }

            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if line.starts_with("+ ") {
                lines.push(line);
                return Ok((lines, true));
            }
            let tagged = line.starts_with(&format!("{} ", tag));
            lines.push(line);
            if tagged {
                return Ok((lines, false));
            }
        }
    }

    /// Session-done signal.
    async fn done(&mut self) {
        let _ = self.send_line("DONE").await;
    }
}

async fn send_line(writer: &mut OwnedWriteHalf, text: &str) -> Result<()> {
    writer
        .write_all(format!("{}\r\n", text).as_bytes())
        .await
        .map_err(|e| Error::Transport(format!("failed to write to client: {}", e)))
}
