//! Durable storage for desired subscription state.
//!
//! The whole [`SubscriptionState`] document is read once at startup and
//! rewritten after every mutation.

use crate::registry::SubscriptionState;
use async_trait::async_trait;
use common::error::{Error, Result};
use redis::AsyncCommands;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Default Redis key holding the document.
pub const DEFAULT_STATE_KEY: &str = "feed:subscriptions";

#[async_trait]
pub trait PersistenceStore: Send + Sync + 'static {
    /// Load the stored document; empty state if nothing was stored yet.
    async fn load(&self) -> Result<SubscriptionState>;

    /// Replace the stored document.
    async fn save(&self, state: &SubscriptionState) -> Result<()>;
}

#[async_trait]
impl<S: PersistenceStore + ?Sized> PersistenceStore for Arc<S> {
    async fn load(&self) -> Result<SubscriptionState> {
        (**self).load().await
    }

    async fn save(&self, state: &SubscriptionState) -> Result<()> {
        (**self).save(state).await
    }
}

fn parse_document(json: &str, source: &str) -> Result<SubscriptionState> {
    serde_json::from_str(json)
        .map_err(|e| Error::Store(format!("stored state in {} is not valid JSON: {}", source, e)))
}

// =============================================================================
// Redis
// =============================================================================

/// JSON document under a single Redis key.
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
    key: String,
}

impl RedisStore {
    pub fn new(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Store(format!("invalid Redis URL: {}", e)))?;
        Ok(Self {
            client: Arc::new(client),
            key: key.into(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Store(format!("Redis connection failed: {}", e)))
    }
}

#[async_trait]
impl PersistenceStore for RedisStore {
    async fn load(&self) -> Result<SubscriptionState> {
        let mut conn = self.get_connection().await?;
        let json: Option<String> = conn
            .get(&self.key)
            .await
            .map_err(|e| Error::Store(format!("GET {} failed: {}", self.key, e)))?;

        match json {
            Some(j) => {
                let state = parse_document(&j, &self.key)?;
                info!(
                    "Loaded {} subscribers from Redis key '{}'",
                    state.subscriptions.len(),
                    self.key
                );
                Ok(state)
            }
            None => Ok(SubscriptionState::default()),
        }
    }

    async fn save(&self, state: &SubscriptionState) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(state)?;
        conn.set::<_, _, ()>(&self.key, &json)
            .await
            .map_err(|e| Error::Store(format!("SET {} failed: {}", self.key, e)))?;
        debug!("Stored subscription state in Redis key '{}'", self.key);
        Ok(())
    }
}

// =============================================================================
// File
// =============================================================================

/// JSON file, replaced atomically through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn load(&self) -> Result<SubscriptionState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => {
                let state = parse_document(&json, &self.path.display().to_string())?;
                info!(
                    "Loaded {} subscribers from {}",
                    state.subscriptions.len(),
                    self.path.display()
                );
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", self.path.display());
                Ok(SubscriptionState::default())
            }
            Err(e) => Err(Error::Store(format!(
                "reading {} failed: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, state: &SubscriptionState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, &json)
            .await
            .map_err(|e| Error::Store(format!("writing {} failed: {}", temp.display(), e)))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| Error::Store(format!("replacing {} failed: {}", self.path.display(), e)))?;
        debug!("Stored subscription state in {}", self.path.display());
        Ok(())
    }
}

// =============================================================================
// Memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    state: SubscriptionState,
    fail_saves: bool,
    saves: usize,
}

/// In-process store for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SubscriptionState) -> Self {
        let store = Self::default();
        store.update(|inner| inner.state = state);
        store
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn fail_saves(&self, fail: bool) {
        self.update(|inner| inner.fail_saves = fail);
    }

    /// Last saved document.
    pub fn snapshot(&self) -> SubscriptionState {
        self.inner
            .lock()
            .map(|inner| inner.state.clone())
            .unwrap_or_default()
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        self.inner.lock().map(|inner| inner.saves).unwrap_or(0)
    }

    fn update(&self, f: impl FnOnce(&mut MemoryInner)) {
        if let Ok(mut inner) = self.inner.lock() {
            f(&mut inner);
        }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load(&self) -> Result<SubscriptionState> {
        Ok(self.snapshot())
    }

    async fn save(&self, state: &SubscriptionState) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Store("memory store poisoned".into()))?;
        if inner.fail_saves {
            return Err(Error::Store("memory store refusing writes".into()));
        }
        inner.state = state.clone();
        inner.saves += 1;
        Ok(())
    }
}
