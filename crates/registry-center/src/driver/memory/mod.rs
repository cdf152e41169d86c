//! In-memory coordination ensemble.
//!
//! A complete in-process stand-in for a coordination service: hierarchical
//! nodes, the four create modes, digest ACLs, subtree watches and
//! ephemeral nodes tied to session lifetime. Sessions connect only to
//! endpoints the ensemble currently serves.

mod tree;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use registry_core::{
    CoordinationDriver, DigestCredential, DriverSession, SessionId, SessionState, Stat, StoreError,
    traits::{CreateOptions, SessionOptions, WatchStream},
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use self::tree::{Caller, Tree};

struct Ensemble {
    tree: Mutex<Tree>,
    endpoints: RwLock<HashSet<String>>,
}

impl Ensemble {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reachable<'a>(&self, servers: &'a [String]) -> Option<&'a str> {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
        servers
            .iter()
            .find(|s| endpoints.contains(s.as_str()))
            .map(String::as_str)
    }
}

/// In-process coordination ensemble.
///
/// Cloning shares the same tree.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<Ensemble>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Create an empty ensemble serving no endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Ensemble {
                tree: Mutex::new(Tree::default()),
                endpoints: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Create an ensemble already serving `addr`.
    #[must_use]
    pub fn serving(addr: impl Into<String>) -> Self {
        let ensemble = Self::new();
        ensemble.serve(addr);
        ensemble
    }

    /// Accept connections on `addr`.
    pub fn serve(&self, addr: impl Into<String>) {
        self.inner
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.into());
    }

    /// Stop accepting new connections on `addr`. Live sessions stay up.
    pub fn unserve(&self, addr: &str) {
        self.inner
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr);
    }

    /// Driver that opens sessions against this ensemble.
    #[must_use]
    pub fn driver(&self) -> MemoryDriver {
        MemoryDriver {
            ensemble: Arc::clone(&self.inner),
        }
    }

    /// Whether a node exists, bypassing ACLs.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.inner.tree().contains(path)
    }

    /// Node payload, bypassing ACLs.
    #[must_use]
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.tree().data(path)
    }

    /// Number of connected sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.tree().session_count()
    }
}

/// Driver for a [`MemoryEnsemble`].
#[derive(Clone)]
pub struct MemoryDriver {
    ensemble: Arc<Ensemble>,
}

#[async_trait]
impl CoordinationDriver for MemoryDriver {
    async fn connect(&self, options: SessionOptions) -> Result<Arc<dyn DriverSession>, StoreError> {
        if options.servers.is_empty() {
            return Err(StoreError::BadArguments("server list is empty".to_string()));
        }
        let identity = options
            .auth
            .as_ref()
            .map(DigestCredential::from_auth_info)
            .transpose()?
            .map(|c| c.identity());

        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Arc::new(MemorySession {
            id: Uuid::new_v4(),
            ensemble: Arc::clone(&self.ensemble),
            options,
            identity,
            state,
        });
        tracing::debug!(
            session_id = %session.id,
            servers = ?session.options.servers,
            session_timeout = ?session.options.session_timeout,
            connection_timeout = ?session.options.connection_timeout,
            "Starting in-memory session"
        );

        tokio::spawn(Arc::clone(&session).establish());
        Ok(session as Arc<dyn DriverSession>)
    }
}

/// A session against a [`MemoryEnsemble`].
pub struct MemorySession {
    id: SessionId,
    ensemble: Arc<Ensemble>,
    options: SessionOptions,
    identity: Option<String>,
    state: watch::Sender<SessionState>,
}

impl MemorySession {
    /// Retry connecting with the configured backoff until an endpoint is
    /// reachable or the session is closed.
    async fn establish(self: Arc<Self>) {
        let mut state_rx = self.state.subscribe();
        let mut attempt = 0u32;
        loop {
            match self.try_connect() {
                Some(true) => return,
                None => {
                    tracing::debug!(session_id = %self.id, "Session closed before connecting");
                    return;
                }
                Some(false) => {}
            }

            let backoff = self
                .options
                .retry
                .sleep_for(attempt)
                .unwrap_or_else(|| self.options.retry.max_sleep());
            attempt = attempt.saturating_add(1);
            tracing::debug!(
                session_id = %self.id,
                attempt,
                ?backoff,
                "No reachable server, retrying"
            );

            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = state_rx.wait_for(|s| *s == SessionState::Closed) => return,
            }
        }
    }

    /// `Some(true)` once connected, `Some(false)` if nothing is reachable,
    /// `None` if the session was closed meanwhile.
    fn try_connect(&self) -> Option<bool> {
        let Some(server) = self.ensemble.reachable(&self.options.servers) else {
            return Some(false);
        };
        let mut tree = self.ensemble.tree();
        if *self.state.borrow() == SessionState::Closed {
            return None;
        }
        tree.open_session(self.id);
        self.state.send_replace(SessionState::Connected);
        tracing::debug!(session_id = %self.id, server, "Session connected");
        Some(true)
    }

    fn caller(&self) -> Result<Caller, StoreError> {
        match *self.state.borrow() {
            SessionState::Connected => Ok(Caller {
                id: self.id,
                identity: self.identity.clone(),
            }),
            SessionState::Connecting => Err(StoreError::ConnectionLoss),
            SessionState::Closed => Err(StoreError::SessionClosed),
        }
    }

    fn with_tree<T>(
        &self,
        f: impl FnOnce(&mut Tree, &Caller) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        // Close flips the state under the tree lock, so check it while held.
        let mut tree = self.ensemble.tree();
        let caller = self.caller()?;
        f(&mut tree, &caller)
    }
}

#[async_trait]
impl DriverSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn block_until_connected(&self, timeout: Duration) -> Result<bool, StoreError> {
        let mut state_rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|s| *s != SessionState::Connecting)
                .await
                .map(|s| *s)
        })
        .await;

        match waited {
            Err(_) => Ok(false),
            Ok(Ok(SessionState::Connected)) => Ok(true),
            Ok(_) => Err(StoreError::SessionClosed),
        }
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        options: &CreateOptions,
    ) -> Result<String, StoreError> {
        self.with_tree(|tree, caller| tree.create(caller, path, data, options))
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), StoreError> {
        self.with_tree(|tree, caller| tree.get_data(caller, path))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<Stat, StoreError> {
        self.with_tree(|tree, caller| tree.set_data(caller, path, data))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError> {
        self.with_tree(|tree, caller| tree.delete(caller, path, recursive))
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError> {
        self.with_tree(|tree, _| tree.exists(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.with_tree(|tree, caller| tree.get_children(caller, path))
    }

    async fn watch(&self, path: &str) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_tree(|tree, caller| tree.add_watcher(caller.id, path, tx))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut tree = self.ensemble.tree();
        if self.state.send_replace(SessionState::Closed) == SessionState::Closed {
            return Ok(());
        }
        tree.close_session(self.id);
        tracing::debug!(session_id = %self.id, "Session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use registry_core::{Acl, CreateMode, ExponentialBackoff, WatchEventKind};

    use super::*;

    fn options(servers: &[&str]) -> SessionOptions {
        SessionOptions {
            servers: servers.iter().map(ToString::to_string).collect(),
            retry: ExponentialBackoff::new(Duration::from_millis(5), 3, Duration::from_millis(10)),
            session_timeout: None,
            connection_timeout: None,
            auth: None,
        }
    }

    #[tokio::test]
    async fn test_connects_to_served_endpoint() {
        let ensemble = MemoryEnsemble::serving("zk1:2181");
        let session = ensemble
            .driver()
            .connect(options(&["zk0:2181", "zk1:2181"]))
            .await
            .unwrap();
        assert!(session.block_until_connected(Duration::from_secs(1)).await.unwrap());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(ensemble.session_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_times_out() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.driver().connect(options(&["nowhere:2181"])).await.unwrap();
        assert!(!session.block_until_connected(Duration::from_millis(20)).await.unwrap());
        assert!(matches!(session.get_data("/").await, Err(StoreError::ConnectionLoss)));
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_connects_once_endpoint_comes_up() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.driver().connect(options(&["late:2181"])).await.unwrap();
        assert!(!session.block_until_connected(Duration::from_millis(5)).await.unwrap());
        ensemble.serve("late:2181");
        assert!(session.block_until_connected(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals_and_ends_watch() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let driver = ensemble.driver();
        let owner = driver.connect(options(&["zk:2181"])).await.unwrap();
        let observer = driver.connect(options(&["zk:2181"])).await.unwrap();
        assert!(owner.block_until_connected(Duration::from_secs(1)).await.unwrap());
        assert!(observer.block_until_connected(Duration::from_secs(1)).await.unwrap());

        let mut own_watch = owner.watch("/").await.unwrap();
        let mut watch = observer.watch("/svc").await.unwrap();
        let opts =
            CreateOptions::new(CreateMode::Ephemeral, vec![Acl::AnyoneAll]).creating_parents();
        owner.create("/svc/a", b"up", &opts).await.unwrap();

        assert_eq!(watch.next().await.unwrap().path, "/svc");
        assert_eq!(watch.next().await.unwrap().path, "/svc/a");

        owner.close().await.unwrap();
        let deleted = watch.next().await.unwrap();
        assert_eq!(deleted.kind, WatchEventKind::NodeDeleted);
        assert_eq!(deleted.path, "/svc/a");
        assert!(!ensemble.contains("/svc/a"));
        assert!(ensemble.contains("/svc"));

        // The closed session's own watch drains then ends.
        while own_watch.next().await.is_some() {}
        assert!(matches!(owner.exists("/svc").await, Err(StoreError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_digest_identity_enforced() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let driver = ensemble.driver();
        let mut authed = options(&["zk:2181"]);
        authed.auth = Some(DigestCredential::parse("app:secret").unwrap().auth_info());
        let owner = driver.connect(authed).await.unwrap();
        let stranger = driver.connect(options(&["zk:2181"])).await.unwrap();
        assert!(owner.block_until_connected(Duration::from_secs(1)).await.unwrap());
        assert!(stranger.block_until_connected(Duration::from_secs(1)).await.unwrap());

        let opts = CreateOptions::new(CreateMode::Persistent, vec![Acl::CreatorAll]);
        owner.create("/locked", b"v", &opts).await.unwrap();
        assert_eq!(owner.get_data("/locked").await.unwrap().0, b"v");
        assert!(matches!(stranger.get_data("/locked").await, Err(StoreError::NoAuth(_))));
        assert!(matches!(stranger.set_data("/locked", b"x").await, Err(StoreError::NoAuth(_))));
    }
}
