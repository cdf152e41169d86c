//! Watch-driven local mirror of a subtree.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{StreamExt, stream::BoxStream};
use registry_core::{
    ChildData, DriverSession, Namespace, StoreError, WatchEvent, WatchEventKind,
    path,
    traits::WatchStream,
};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;

/// Live listener capacity before slow receivers start lagging.
const EVENT_CAPACITY: usize = 1024;

/// Change observed by a [`TreeCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeCacheEvent {
    NodeAdded(ChildData),
    NodeUpdated(ChildData),
    NodeRemoved(ChildData),
    /// The snapshot handed out by [`TreeCache::events`] is complete.
    Initialized,
}

struct CacheState {
    nodes: RwLock<BTreeMap<String, ChildData>>,
    sender: broadcast::Sender<TreeCacheEvent>,
}

impl CacheState {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            sender,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ChildData>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ChildData>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or refresh a node. Events are sent under the write lock so
    /// listeners see them in apply order.
    fn upsert(&self, data: ChildData) {
        let mut nodes = self.write();
        let event = match nodes.get(&data.path) {
            Some(existing)
                if existing.stat.czxid == data.stat.czxid
                    && existing.stat.mzxid == data.stat.mzxid =>
            {
                return;
            }
            Some(_) => TreeCacheEvent::NodeUpdated(data.clone()),
            None => TreeCacheEvent::NodeAdded(data.clone()),
        };
        nodes.insert(data.path.clone(), data);
        let _ = self.sender.send(event);
    }

    fn remove_subtree(&self, root: &str) {
        let mut nodes = self.write();
        let mut doomed: Vec<String> = nodes
            .keys()
            .filter(|p| path::is_within(root, p))
            .cloned()
            .collect();
        doomed.reverse();
        for each in doomed {
            if let Some(data) = nodes.remove(&each) {
                let _ = self.sender.send(TreeCacheEvent::NodeRemoved(data));
            }
        }
    }
}

/// Applies store state to the cache.
struct Mirror {
    session: Arc<dyn DriverSession>,
    namespace: Namespace,
}

impl Mirror {
    async fn fetch(&self, store_path: &str) -> Result<Option<ChildData>, StoreError> {
        match self.session.get_data(store_path).await {
            Ok((data, stat)) => Ok(Some(ChildData {
                path: self.namespace.unfix(store_path),
                data,
                stat,
            })),
            Err(StoreError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Walk the subtree and load every node.
    async fn load(&self, state: &CacheState, store_root: &str) -> Result<(), StoreError> {
        let mut pending = vec![store_root.to_string()];
        while let Some(store_path) = pending.pop() {
            let Some(data) = self.fetch(&store_path).await? else {
                continue;
            };
            state.upsert(data);
            let children = match self.session.get_children(&store_path).await {
                Ok(children) => children,
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            pending.extend(children.iter().map(|c| path::join(&store_path, c)));
        }
        Ok(())
    }

    async fn apply(&self, state: &CacheState, event: WatchEvent) -> Result<(), StoreError> {
        match event.kind {
            WatchEventKind::NodeCreated | WatchEventKind::NodeDataChanged => {
                // Gone already; the delete event follows.
                if let Some(data) = self.fetch(&event.path).await? {
                    state.upsert(data);
                }
            }
            WatchEventKind::NodeDeleted => {
                state.remove_subtree(&self.namespace.unfix(&event.path));
            }
        }
        Ok(())
    }

    async fn run(
        self,
        state: Arc<CacheState>,
        mut watch: WatchStream,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                event = watch.next() => {
                    let Some(event) = event else {
                        tracing::debug!("Watch stream ended");
                        break;
                    };
                    let path = event.path.clone();
                    if let Err(e) = self.apply(&state, event).await {
                        tracing::debug!(path = %path, "Failed to apply cache event: {e}");
                    }
                }
            }
        }
    }
}

/// Local, asynchronously updated mirror of a subtree.
///
/// Reads never touch the remote store. Updates arrive in the store's order
/// for this subtree but may lag behind writes made through the registry.
/// Dropping the last handle stops the background task.
pub struct TreeCache {
    root: String,
    state: Arc<CacheState>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TreeCache {
    /// Start a cache for `root` and its descendants.
    ///
    /// Subscribes to changes first, then loads the initial snapshot, then
    /// keeps applying changes in the background until closed.
    ///
    /// # Errors
    /// Returns error if the path is invalid or the store cannot be read.
    pub async fn start(
        session: Arc<dyn DriverSession>,
        namespace: Namespace,
        root: &str,
    ) -> Result<Self, StoreError> {
        let store_root = namespace.fix(root)?;
        let watch = session.watch(&store_root).await?;

        let state = Arc::new(CacheState::new());
        let mirror = Mirror { session, namespace };
        mirror.load(&state, &store_root).await?;
        tracing::debug!(root, nodes = state.read().len(), "Tree cache initialized");

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(mirror.run(Arc::clone(&state), watch, stop_rx));

        Ok(Self {
            root: root.to_string(),
            state,
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// The cached subtree root, in caller coordinates.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Cached data for `path`.
    #[must_use]
    pub fn current_data(&self, path: &str) -> Option<ChildData> {
        self.state.read().get(path).cloned()
    }

    /// Direct children of `parent` by name, or `None` if `parent` is not cached.
    #[must_use]
    pub fn current_children(&self, parent: &str) -> Option<BTreeMap<String, ChildData>> {
        let nodes = self.state.read();
        if !nodes.contains_key(parent) {
            return None;
        }
        Some(
            nodes
                .iter()
                .filter(|(p, _)| path::parent(p) == Some(parent))
                .map(|(p, data)| (path::node_name(p).to_string(), data.clone()))
                .collect(),
        )
    }

    /// Copy of every cached node keyed by path.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ChildData> {
        self.state.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Receiver for live changes only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TreeCacheEvent> {
        self.state.sender.subscribe()
    }

    /// Stream that yields the current snapshot as `NodeAdded`, then
    /// `Initialized`, then live changes.
    #[must_use]
    pub fn events(&self) -> BoxStream<'static, TreeCacheEvent> {
        let (snapshot, rx) = {
            let nodes = self.state.read();
            let snapshot: Vec<ChildData> = nodes.values().cloned().collect();
            (snapshot, self.state.sender.subscribe())
        };

        let initial = futures::stream::iter(
            snapshot
                .into_iter()
                .map(TreeCacheEvent::NodeAdded)
                .chain(std::iter::once(TreeCacheEvent::Initialized)),
        );
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        initial.chain(live).boxed()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the background task and wait for it to finish.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let stop = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(root = %self.root, "Tree cache task failed: {e}");
            }
            tracing::debug!(root = %self.root, "Tree cache closed");
        }
    }
}
