use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::Session;

/// Store failures callers must tell apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    EmptyId,
    NotFound(String),
    /// A relative reference asked for more sessions than exist.
    OutOfRange { offset: usize, available: usize },
    InvalidReference(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::EmptyId => write!(f, "session ID cannot be empty"),
            StoreError::NotFound(id) => write!(f, "session not found: {id}"),
            StoreError::OutOfRange { offset, available } => write!(
                f,
                "session offset -{offset} out of range: only {available} session(s) available"
            ),
            StoreError::InvalidReference(r) => write!(f, "invalid session reference: {r}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Listing row for a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Persists sessions by id.
///
/// Implementations must serialize writes to the same id. Errors that callers
/// need to distinguish are [`StoreError`]s inside the `anyhow::Error`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, id: &str) -> Result<Session>;

    async fn get_sessions(&self) -> Result<Vec<Session>>;

    /// Summaries sorted newest first.
    async fn get_session_summaries(&self) -> Result<Vec<SessionSummary>>;

    /// Inserts or replaces the session with the same id.
    async fn update_session(&self, session: &Session) -> Result<()>;

    async fn delete_session(&self, id: &str) -> Result<()>;

    async fn update_session_title(&self, id: &str, title: &str) -> Result<()> {
        let mut session = self.get_session(id).await?;
        session.title = title.to_string();
        self.update_session(&session).await
    }

    async fn update_session_tokens(&self, id: &str, input: u64, output: u64) -> Result<()> {
        let mut session = self.get_session(id).await?;
        session.input_tokens = input;
        session.output_tokens = output;
        self.update_session(&session).await
    }
}

/// Writes `session` unless it is brand new and still empty.
///
/// Returns whether a write happened. Sets `session.persisted` on success.
pub async fn persist_if_needed(store: &dyn SessionStore, session: &mut Session) -> Result<bool> {
    if !session.persisted && !session.has_content() {
        return Ok(false);
    }
    store.update_session(session).await?;
    session.persisted = true;
    Ok(true)
}

/// Resolves `reference` to a stored session id.
///
/// `-N` picks the Nth most recent session and `last` is `-1`; anything else
/// must be the id of a stored session.
pub async fn resolve_session_id(store: &dyn SessionStore, reference: &str) -> Result<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(StoreError::EmptyId.into());
    }

    let offset = if reference == "last" {
        Some(1)
    } else if let Some(rest) = reference.strip_prefix('-') {
        match rest.parse::<usize>() {
            Ok(0) | Err(_) => {
                return Err(StoreError::InvalidReference(reference.to_string()).into());
            }
            Ok(n) => Some(n),
        }
    } else {
        None
    };

    match offset {
        Some(n) => {
            let summaries = store.get_session_summaries().await?;
            summaries
                .get(n - 1)
                .map(|s| s.id.clone())
                .ok_or_else(|| {
                    StoreError::OutOfRange {
                        offset: n,
                        available: summaries.len(),
                    }
                    .into()
                })
        }
        None => {
            store.get_session(reference).await?;
            Ok(reference.to_string())
        }
    }
}

pub(super) fn sort_newest_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Process-local store, used by tests and the server's scratch mode.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<Vec<Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session(&self, id: &str) -> Result<Session> {
        if id.is_empty() {
            return Err(StoreError::EmptyId.into());
        }
        let sessions = self.sessions.read().await;
        let mut session = sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.persisted = true;
        Ok(session)
    }

    async fn get_sessions(&self) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .iter()
            .cloned()
            .map(|mut s| {
                s.persisted = true;
                s
            })
            .collect())
    }

    async fn get_session_summaries(&self) -> Result<Vec<SessionSummary>> {
        let sessions = self.sessions.read().await;
        // Reverse insertion order first so equal timestamps list the newer insert first.
        let mut summaries: Vec<SessionSummary> = sessions.iter().rev().map(Session::summary).collect();
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        if session.id.is_empty() {
            return Err(StoreError::EmptyId.into());
        }
        let mut sessions = self.sessions.write().await;
        let mut stored = session.clone();
        stored.persisted = true;
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = stored,
            None => sessions.push(stored),
        }
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(StoreError::EmptyId.into());
        }
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() == before {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        Ok(())
    }
}
