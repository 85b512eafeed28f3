//! One JSON document per session under a directory.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::store::{SessionStore, SessionSummary, StoreError, sort_newest_first};
use super::Session;

pub struct JsonFileSessionStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonFileSessionStore {
    /// Opens (and creates if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create sessions dir {}", dir.display()))?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() {
            return Err(StoreError::EmptyId.into());
        }
        if id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(StoreError::InvalidReference(id.to_string()).into());
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn read_file(path: &Path) -> Result<Session> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
        let mut session: Session = serde_json::from_str(&raw)
            .with_context(|| format!("parse session {}", path.display()))?;
        session.persisted = true;
        Ok(session)
    }

    fn session_files(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("read sessions dir {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn get_session(&self, id: &str) -> Result<Session> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        Self::read_file(&path)
    }

    async fn get_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for path in self.session_files()? {
            match Self::read_file(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable session: {e:#}"),
            }
        }
        Ok(sessions)
    }

    async fn get_session_summaries(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = self
            .get_sessions()
            .await?
            .iter()
            .map(Session::summary)
            .collect();
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.id)?;
        let lock = self.lock_for(&session.id).await;
        let _guard = lock.lock().await;

        let json = serde_json::to_vec_pretty(session).context("serialize session")?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("create temp file in {}", self.dir.display()))?;
        tmp.write_all(&json).context("write session")?;
        tmp.persist(&path)
            .with_context(|| format!("persist session {}", path.display()))?;
        tracing::debug!(session_id = %session.id, "session saved");
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        fs::remove_file(&path).with_context(|| format!("delete session {}", path.display()))?;
        Ok(())
    }
}
