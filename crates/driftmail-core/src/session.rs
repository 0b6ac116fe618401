//! IMAP session management
//!
//! Tracks the state of one client connection at the distributor tier:
//! authentication, the sticky worker assignment, the selected mailbox and
//! an in-progress APPEND literal.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// IMAP session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not authenticated
    NotAuthenticated,
    /// Authenticated but no mailbox selected
    Authenticated,
    /// Mailbox selected
    Mailbox,
    /// Session is closing (terminal)
    Logout,
}

/// IMAP session
#[derive(Debug)]
pub struct Session {
    /// Session ID
    pub id: String,
    /// Current state
    pub state: SessionState,
    /// Authenticated user name
    pub user: Option<String>,
    /// Worker sticky-bound to the user
    pub worker: Option<String>,
    /// Currently selected mailbox
    pub selected_mailbox: Option<String>,
    /// An APPEND literal is being relayed
    pub append_in_progress: bool,
    /// Session start time
    pub started_at: DateTime<Utc>,
    /// Last activity time
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Create a new session in the unauthenticated state
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::NotAuthenticated,
            user: None,
            worker: None,
            selected_mailbox: None,
            append_in_progress: false,
            started_at: now,
            last_activity: now,
        }
    }

    /// Check if the session is authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Mailbox
        )
    }

    /// Check if a mailbox is selected
    pub fn is_selected(&self) -> bool {
        matches!(self.state, SessionState::Mailbox)
    }

    /// LOGIN / AUTHENTICATE: record the user and its sticky worker
    pub fn authenticate(&mut self, user: impl Into<String>, worker: impl Into<String>) {
        self.user = Some(user.into());
        self.worker = Some(worker.into());
        self.state = SessionState::Authenticated;
        self.update_activity();
    }

    /// SELECT: record the selected mailbox
    pub fn select(&mut self, mailbox: impl Into<String>) {
        self.selected_mailbox = Some(mailbox.into());
        self.state = SessionState::Mailbox;
        self.update_activity();
    }

    /// CLOSE / UNSELECT: back to the authenticated state
    pub fn close_mailbox(&mut self) {
        self.selected_mailbox = None;
        self.state = SessionState::Authenticated;
        self.update_activity();
    }

    /// LOGOUT: terminal state
    pub fn logout(&mut self) {
        self.state = SessionState::Logout;
    }

    /// Update the last activity timestamp
    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Check if the session has been idle longer than `timeout_minutes`
    pub fn is_timed_out(&self, timeout_minutes: i64) -> bool {
        let elapsed = Utc::now() - self.last_activity;
        elapsed.num_minutes() > timeout_minutes
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_new() {
        let session = Session::new();
        assert_eq!(session.state, SessionState::NotAuthenticated);
        assert!(!session.is_authenticated());
        assert!(!session.is_selected());
        assert!(!session.append_in_progress);
    }

    #[test]
    fn test_session_authenticate() {
        let mut session = Session::new();
        session.authenticate("alice", "worker-1");
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(session.is_authenticated());
        assert_eq!(session.worker.as_deref(), Some("worker-1"));
        assert!(!session.is_selected());
    }

    #[test]
    fn test_session_select_and_close() {
        let mut session = Session::new();
        session.authenticate("alice", "worker-1");

        session.select("INBOX");
        assert_eq!(session.state, SessionState::Mailbox);
        assert_eq!(session.selected_mailbox.as_deref(), Some("INBOX"));

        session.close_mailbox();
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(session.selected_mailbox.is_none());
    }

    #[test]
    fn test_session_logout_is_terminal() {
        let mut session = Session::new();
        session.authenticate("alice", "worker-1");
        session.logout();
        assert_eq!(session.state, SessionState::Logout);
    }
}
