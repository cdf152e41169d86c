//! ZooKeeper driver.
//!
//! Sessions are opened with `zookeeper-client`. Operations the wire protocol
//! has no single request for (creating parents, recursive delete) are
//! composed client side. Subtree watches use a persistent recursive watch.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use registry_core::{
    Acl, CoordinationDriver, CreateMode, DriverSession, SessionId, SessionState, Stat, StoreError,
    WatchEvent, WatchEventKind, path,
    traits::{CreateOptions, SessionOptions, WatchStream},
};
use tokio::sync::watch;
use uuid::Uuid;
use zookeeper_client as zk;

/// Driver that connects to a ZooKeeper ensemble over the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZooKeeperDriver;

impl ZooKeeperDriver {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CoordinationDriver for ZooKeeperDriver {
    async fn connect(
        &self,
        options: SessionOptions,
    ) -> Result<Arc<dyn DriverSession>, StoreError> {
        if options.servers.is_empty() {
            return Err(StoreError::BadArguments("server list is empty".to_string()));
        }
        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Arc::new(ZooKeeperSession {
            id: Uuid::new_v4(),
            cluster: options.servers.join(","),
            options,
            client: Mutex::new(None),
            state,
        });
        tracing::debug!(
            session_id = %session.id,
            cluster = %session.cluster,
            session_timeout = ?session.options.session_timeout,
            connection_timeout = ?session.options.connection_timeout,
            "Starting ZooKeeper session"
        );

        tokio::spawn(Arc::clone(&session).establish());
        Ok(session as Arc<dyn DriverSession>)
    }
}

/// A session against a ZooKeeper ensemble.
pub struct ZooKeeperSession {
    id: SessionId,
    cluster: String,
    options: SessionOptions,
    client: Mutex<Option<zk::Client>>,
    state: watch::Sender<SessionState>,
}

impl ZooKeeperSession {
    fn slot(&self) -> MutexGuard<'_, Option<zk::Client>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retry connecting with the configured backoff until the ensemble
    /// accepts the session or the session is closed.
    async fn establish(self: Arc<Self>) {
        let mut state_rx = self.state.subscribe();
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                result = self.try_connect() => result,
                _ = state_rx.wait_for(|s| *s == SessionState::Closed) => return,
            };
            match result {
                Ok(client) => {
                    self.publish(client);
                    return;
                }
                Err(e) => {
                    tracing::debug!(session_id = %self.id, attempt, "Connect failed: {e}");
                }
            }

            let backoff = self
                .options
                .retry
                .sleep_for(attempt)
                .unwrap_or_else(|| self.options.retry.max_sleep());
            attempt = attempt.saturating_add(1);
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = state_rx.wait_for(|s| *s == SessionState::Closed) => return,
            }
        }
    }

    async fn try_connect(&self) -> Result<zk::Client, zk::Error> {
        let mut connector = zk::Client::connector();
        if let Some(timeout) = self.options.session_timeout {
            connector.session_timeout(timeout);
        }
        if let Some(timeout) = self.options.connection_timeout {
            connector.connection_timeout(timeout);
        }
        let client = connector.connect(&self.cluster).await?;
        if let Some(auth) = &self.options.auth {
            client.auth(auth.scheme.clone(), auth.credential.clone()).await?;
        }
        Ok(client)
    }

    /// Hand the connected client to operations, unless the session was
    /// closed meanwhile, in which case it is dropped.
    fn publish(&self, client: zk::Client) {
        let mut slot = self.slot();
        if *self.state.borrow() == SessionState::Closed {
            return;
        }
        *slot = Some(client);
        self.state.send_replace(SessionState::Connected);
        tracing::debug!(session_id = %self.id, cluster = %self.cluster, "Session connected");
    }

    fn client(&self) -> Result<zk::Client, StoreError> {
        let slot = self.slot();
        match (*self.state.borrow(), slot.as_ref()) {
            (SessionState::Connected, Some(client)) => Ok(client.clone()),
            (SessionState::Closed, _) => Err(StoreError::SessionClosed),
            _ => Err(StoreError::ConnectionLoss),
        }
    }
}

#[async_trait]
impl DriverSession for ZooKeeperSession {
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
        let client = self.client()?;
        if options.create_parents {
            create_parents(&client, path, &options.acl).await?;
        }
        let create = create_mode(options.mode).with_acls(acls(&options.acl));
        let (_, sequence) = client
            .create(path, data, &create)
            .await
            .map_err(|e| store_error(e, path))?;
        if options.mode.is_sequential() {
            Ok(format!("{path}{sequence}"))
        } else {
            Ok(path.to_string())
        }
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), StoreError> {
        let (data, stat) = self
            .client()?
            .get_data(path)
            .await
            .map_err(|e| store_error(e, path))?;
        Ok((data, convert_stat(&stat)))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<Stat, StoreError> {
        let stat = self
            .client()?
            .set_data(path, data, None)
            .await
            .map_err(|e| store_error(e, path))?;
        Ok(convert_stat(&stat))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError> {
        let client = self.client()?;
        if recursive {
            delete_tree(&client, path).await
        } else {
            client.delete(path, None).await.map_err(|e| store_error(e, path))
        }
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError> {
        let stat = self
            .client()?
            .check_stat(path)
            .await
            .map_err(|e| store_error(e, path))?;
        Ok(stat.as_ref().map(convert_stat))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.client()?
            .list_children(path)
            .await
            .map_err(|e| store_error(e, path))
    }

    async fn watch(&self, path: &str) -> Result<WatchStream, StoreError> {
        let watcher = self
            .client()?
            .watch(path, zk::AddWatchMode::PersistentRecursive)
            .await
            .map_err(|e| store_error(e, path))?;

        let stream = futures::stream::unfold(watcher, |mut watcher| async move {
            loop {
                let event = watcher.changed().await;
                match translate(event.event_type, event.session_state, event.path) {
                    Translated::Event(event) => return Some((event, watcher)),
                    Translated::Ignored => {}
                    Translated::Ended => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let client = {
            let mut slot = self.slot();
            if self.state.send_replace(SessionState::Closed) == SessionState::Closed {
                return Ok(());
            }
            slot.take()
        };
        // The session ends once the last clone of the client is dropped.
        drop(client);
        tracing::debug!(session_id = %self.id, "Session closed");
        Ok(())
    }
}

/// Create every missing ancestor of `path` as a persistent node.
async fn create_parents(client: &zk::Client, path: &str, acl: &[Acl]) -> Result<(), StoreError> {
    let options = zk::CreateMode::Persistent.with_acls(acls(acl));
    for ancestor in ancestors(path) {
        match client.create(&ancestor, &[], &options).await {
            Ok(_) | Err(zk::Error::NodeExists) => {}
            Err(e) => return Err(store_error(e, &ancestor)),
        }
    }
    Ok(())
}

/// Delete `path` and everything below it, deepest nodes first.
async fn delete_tree(client: &zk::Client, path: &str) -> Result<(), StoreError> {
    let mut order = vec![path.to_string()];
    let mut next = 0;
    while next < order.len() {
        let parent = order[next].clone();
        next += 1;
        let children = match client.list_children(&parent).await {
            Ok(children) => children,
            Err(zk::Error::NoNode) => continue,
            Err(e) => return Err(store_error(e, &parent)),
        };
        order.extend(children.iter().map(|c| path::join(&parent, c)));
    }

    for each in order.iter().rev() {
        match client.delete(each, None).await {
            Ok(()) => {}
            // Removed concurrently.
            Err(zk::Error::NoNode) if each != path => {}
            Err(e) => return Err(store_error(e, each)),
        }
    }
    Ok(())
}

/// Proper ancestors of `path`, outermost first, excluding the root.
fn ancestors(path: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut cursor = path;
    while let Some(parent) = path::parent(cursor) {
        if parent == path::ROOT {
            break;
        }
        chain.push(parent.to_string());
        cursor = parent;
    }
    chain.reverse();
    chain
}

const fn create_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::PersistentSequential => zk::CreateMode::PersistentSequential,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

fn acls(acl: &[Acl]) -> zk::Acls<'static> {
    if acl.contains(&Acl::CreatorAll) {
        zk::Acls::creator_all()
    } else {
        zk::Acls::anyone_all()
    }
}

fn convert_stat(stat: &zk::Stat) -> Stat {
    Stat {
        czxid: stat.czxid,
        mzxid: stat.mzxid,
        version: stat.version,
        cversion: stat.cversion,
        ephemeral_owner: ephemeral_owner(stat.ephemeral_owner),
        data_length: usize::try_from(stat.data_length).unwrap_or_default(),
        num_children: usize::try_from(stat.num_children).unwrap_or_default(),
    }
}

/// Server session ids are 64 bit; they are carried in the low half of a uuid.
#[allow(clippy::cast_sign_loss)]
const fn ephemeral_owner(owner: i64) -> Option<SessionId> {
    if owner == 0 {
        None
    } else {
        Some(Uuid::from_u64_pair(0, owner as u64))
    }
}

fn store_error(err: zk::Error, path: &str) -> StoreError {
    match err {
        zk::Error::NoNode => StoreError::NoNode(path.to_string()),
        zk::Error::NodeExists => StoreError::NodeExists(path.to_string()),
        zk::Error::NotEmpty => StoreError::NotEmpty(path.to_string()),
        zk::Error::NoAuth => StoreError::NoAuth(path.to_string()),
        zk::Error::NoChildrenForEphemerals => {
            StoreError::NoChildrenForEphemerals(path.to_string())
        }
        zk::Error::InvalidAcl => StoreError::InvalidAcl(path.to_string()),
        zk::Error::ConnectionLoss => StoreError::ConnectionLoss,
        zk::Error::SessionExpired | zk::Error::ClientClosed => StoreError::SessionClosed,
        zk::Error::BadArguments(reason) => StoreError::BadArguments(reason.to_string()),
        other => StoreError::Remote(other.to_string()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Translated {
    Event(WatchEvent),
    Ignored,
    Ended,
}

fn translate(kind: zk::EventType, state: zk::SessionState, path: String) -> Translated {
    let kind = match kind {
        zk::EventType::NodeCreated => WatchEventKind::NodeCreated,
        zk::EventType::NodeDataChanged => WatchEventKind::NodeDataChanged,
        zk::EventType::NodeDeleted => WatchEventKind::NodeDeleted,
        zk::EventType::Session
            if matches!(
                state,
                zk::SessionState::Expired | zk::SessionState::Closed | zk::SessionState::AuthFailed
            ) =>
        {
            return Translated::Ended;
        }
        _ => return Translated::Ignored,
    };
    Translated::Event(WatchEvent { kind, path })
}
