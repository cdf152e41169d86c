//! Registry center: session lifecycle and tree operations.

use std::{
    sync::{Arc, PoisonError, RwLock, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use registry_core::{
    AclProvider, CoordinationDriver, CoordinationError, CreateMode, CreatorAclProvider,
    DigestCredential, DriverSession, Namespace, OpenAclProvider, RegistryConfig, SessionState,
    StoreError,
    traits::{CreateOptions, SessionOptions},
};

use crate::{CacheRegistry, Registry, TreeCache};

/// Everything the operations need from a started session.
#[derive(Clone)]
struct Active {
    session: Arc<dyn DriverSession>,
    namespace: Namespace,
    acl: Arc<dyn AclProvider>,
}

enum Lifecycle {
    Idle,
    Starting,
    Started(Active),
    /// Failed to start or destroyed. Terminal.
    Closed,
}

/// Registry center backed by a coordination-service driver.
///
/// Call [`init`](Self::init) once before use and [`destroy`](Self::destroy)
/// once after. A center whose `init` failed cannot be reused.
pub struct RegistryCenter<D: CoordinationDriver> {
    config: RegistryConfig,
    driver: D,
    lifecycle: RwLock<Lifecycle>,
    caches: CacheRegistry,
}

impl<D: CoordinationDriver> RegistryCenter<D> {
    /// Create a registry center. No connection is made until `init`.
    #[must_use]
    pub fn new(config: RegistryConfig, driver: D) -> Self {
        Self {
            config,
            driver,
            lifecycle: RwLock::new(Lifecycle::Idle),
            caches: CacheRegistry::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// State of the underlying session, if one was started.
    #[must_use]
    pub fn session_state(&self) -> Option<SessionState> {
        self.active().ok().map(|a| a.session.state())
    }

    fn lifecycle(&self) -> RwLockWriteGuard<'_, Lifecycle> {
        self.lifecycle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> Result<Active, StoreError> {
        match &*self.lifecycle.read().unwrap_or_else(PoisonError::into_inner) {
            Lifecycle::Started(active) => Ok(active.clone()),
            Lifecycle::Idle | Lifecycle::Starting => Err(StoreError::NotConnected),
            Lifecycle::Closed => Err(StoreError::SessionClosed),
        }
    }

    /// Start the session and wait until it connects.
    ///
    /// Waits at most `max_sleep_ms * max_retries`.
    ///
    /// # Errors
    /// Returns `ConnectionTimeout` if the session does not connect in time,
    /// or `Connect` for any other failure, including a second `init`.
    pub async fn init(&self) -> Result<(), CoordinationError> {
        tracing::debug!(servers = %self.config.servers, "Registry center init");
        {
            let mut lifecycle = self.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Idle) {
                return Err(CoordinationError::Connect(StoreError::BadArguments(
                    "registry center can only be initialized once".to_string(),
                )));
            }
            *lifecycle = Lifecycle::Starting;
        }

        let active = match self.connect().await {
            Ok(active) => active,
            Err(e) => {
                *self.lifecycle() = Lifecycle::Closed;
                return Err(e);
            }
        };
        let session_id = active.session.id();
        if let Some(orphan) = self.publish(active) {
            // Destroyed while connecting.
            close_quietly(orphan.session.as_ref()).await;
            return Err(CoordinationError::Connect(StoreError::SessionClosed));
        }
        tracing::info!(servers = %self.config.servers, %session_id, "Registry center connected");
        Ok(())
    }

    /// Make the session visible to operations, unless `destroy` ran
    /// meanwhile, in which case it is handed back.
    fn publish(&self, active: Active) -> Option<Active> {
        let mut lifecycle = self.lifecycle();
        if matches!(*lifecycle, Lifecycle::Starting) {
            *lifecycle = Lifecycle::Started(active);
            None
        } else {
            Some(active)
        }
    }

    async fn connect(&self) -> Result<Active, CoordinationError> {
        self.config.validate().map_err(CoordinationError::Connect)?;
        let namespace =
            Namespace::new(&self.config.namespace).map_err(CoordinationError::Connect)?;

        let (auth, acl) = match self.config.digest() {
            Some(digest) => {
                let credential =
                    DigestCredential::parse(digest).map_err(CoordinationError::Connect)?;
                let acl: Arc<dyn AclProvider> = Arc::new(CreatorAclProvider);
                (Some(credential.auth_info()), acl)
            }
            None => {
                let acl: Arc<dyn AclProvider> = Arc::new(OpenAclProvider);
                (None, acl)
            }
        };

        let options = SessionOptions {
            servers: self.config.server_list(),
            retry: self.config.retry_policy(),
            session_timeout: self.config.session_timeout(),
            connection_timeout: self.config.connection_timeout(),
            auth,
        };
        let session = self
            .driver
            .connect(options)
            .await
            .map_err(CoordinationError::Connect)?;

        let waited = self.config.connect_wait();
        match session.block_until_connected(waited).await {
            Ok(true) => Ok(Active {
                session,
                namespace,
                acl,
            }),
            Ok(false) => {
                tracing::warn!(
                    servers = %self.config.servers,
                    ?waited,
                    "Timed out connecting to coordination service"
                );
                close_quietly(session.as_ref()).await;
                Err(CoordinationError::ConnectionTimeout { waited })
            }
            Err(e) => {
                close_quietly(session.as_ref()).await;
                Err(CoordinationError::Connect(e))
            }
        }
    }

    /// Stop every watch cache, then close the session.
    ///
    /// Never fails; close errors are logged and dropped. Safe to call more
    /// than once.
    pub async fn destroy(&self) {
        // Closed first, so no cache can be registered behind the barrier.
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Closed);
        self.caches
            .close_all(Duration::from_millis(self.config.cache_close_grace_ms))
            .await;

        if let Lifecycle::Started(active) = previous {
            close_quietly(active.session.as_ref()).await;
            tracing::info!(session_id = %active.session.id(), "Registry center destroyed");
        }
    }

    async fn exists_in(active: &Active, path: &str) -> Result<bool, StoreError> {
        Ok(active.session.exists(path).await?.is_some())
    }

    async fn create_in(
        active: &Active,
        path: &str,
        value: &str,
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        let options = CreateOptions::new(mode, active.acl.acl_for_path(path)).creating_parents();
        active.session.create(path, value.as_bytes(), &options).await
    }

    async fn update_in(active: &Active, path: &str, value: &str) -> Result<(), StoreError> {
        if Self::exists_in(active, path).await? {
            active.session.set_data(path, value.as_bytes()).await?;
        }
        Ok(())
    }

    async fn try_get(&self, key: &str) -> Result<String, StoreError> {
        let active = self.active()?;
        let (data, _) = active.session.get_data(&active.namespace.fix(key)?).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    async fn try_is_existed(&self, key: &str) -> Result<bool, StoreError> {
        let active = self.active()?;
        Self::exists_in(&active, &active.namespace.fix(key)?).await
    }

    async fn try_persist(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let active = self.active()?;
        let path = active.namespace.fix(key)?;
        if Self::exists_in(&active, &path).await? {
            Self::update_in(&active, &path, value).await
        } else {
            Self::create_in(&active, &path, value, CreateMode::Persistent).await?;
            Ok(())
        }
    }

    async fn try_update(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let active = self.active()?;
        Self::update_in(&active, &active.namespace.fix(key)?, value).await
    }

    async fn try_remove(&self, key: &str) -> Result<(), StoreError> {
        let active = self.active()?;
        active.session.delete(&active.namespace.fix(key)?, true).await
    }

    async fn try_ephemeral(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let active = self.active()?;
        let path = active.namespace.fix(key)?;
        if Self::exists_in(&active, &path).await? {
            active.session.delete(&path, true).await?;
        }
        Self::create_in(&active, &path, value, CreateMode::Ephemeral).await?;
        Ok(())
    }

    async fn try_persist_sequential(&self, key: &str, value: &str) -> Result<String, StoreError> {
        let active = self.active()?;
        let path = active.namespace.fix(key)?;
        let created =
            Self::create_in(&active, &path, value, CreateMode::PersistentSequential).await?;
        Ok(active.namespace.unfix(&created))
    }

    async fn try_ephemeral_sequential(&self, key: &str) -> Result<(), StoreError> {
        let active = self.active()?;
        let path = active.namespace.fix(key)?;
        Self::create_in(&active, &path, "", CreateMode::EphemeralSequential).await?;
        Ok(())
    }

    async fn try_get_children_keys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let active = self.active()?;
        let mut children = active.session.get_children(&active.namespace.fix(key)?).await?;
        children.sort_by(|a, b| b.cmp(a));
        Ok(children)
    }

    async fn try_add_cache_data(&self, cache_path: &str) -> Result<Arc<TreeCache>, StoreError> {
        let active = self.active()?;
        let cache =
            Arc::new(TreeCache::start(active.session, active.namespace, cache_path).await?);
        if let Err(e) = self.caches.insert(cache_path, Arc::clone(&cache)) {
            // Destroyed while the cache was starting.
            cache.close().await;
            return Err(e);
        }
        Ok(cache)
    }
}

async fn close_quietly(session: &dyn DriverSession) {
    if let Err(e) = session.close().await {
        tracing::debug!(session_id = %session.id(), "Ignoring error while closing session: {e}");
    }
}

fn failed(operation: &'static str, key: &str) -> impl FnOnce(StoreError) -> CoordinationError {
    move |source| CoordinationError::operation(operation, key, source)
}

#[async_trait]
impl<D: CoordinationDriver> Registry for RegistryCenter<D> {
    async fn get(&self, key: &str) -> Result<String, CoordinationError> {
        self.try_get(key).await.map_err(failed("get", key))
    }

    async fn is_existed(&self, key: &str) -> Result<bool, CoordinationError> {
        self.try_is_existed(key).await.map_err(failed("is_existed", key))
    }

    async fn persist(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        self.try_persist(key, value).await.map_err(failed("persist", key))
    }

    async fn update(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        self.try_update(key, value).await.map_err(failed("update", key))
    }

    async fn remove(&self, key: &str) -> Result<(), CoordinationError> {
        self.try_remove(key).await.map_err(failed("remove", key))
    }

    async fn ephemeral(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        self.try_ephemeral(key, value).await.map_err(failed("ephemeral", key))
    }

    async fn persist_sequential(
        &self,
        key: &str,
        value: &str,
    ) -> Result<String, CoordinationError> {
        self.try_persist_sequential(key, value)
            .await
            .map_err(failed("persist_sequential", key))
    }

    async fn ephemeral_sequential(&self, key: &str) -> Result<(), CoordinationError> {
        self.try_ephemeral_sequential(key)
            .await
            .map_err(failed("ephemeral_sequential", key))
    }

    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        self.try_get_children_keys(key)
            .await
            .map_err(failed("get_children_keys", key))
    }

    async fn add_cache_data(
        &self,
        cache_path: &str,
    ) -> Result<Arc<TreeCache>, CoordinationError> {
        self.try_add_cache_data(cache_path)
            .await
            .map_err(failed("add_cache_data", cache_path))
    }

    fn get_cache(&self, cache_path: &str) -> Option<Arc<TreeCache>> {
        self.caches.get(cache_path)
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::sync::Mutex;

    use registry_core::{Acl, AuthInfo};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::driver::{MemoryDriver, MemoryEnsemble};

    /// Records the options of every session it opens.
    struct RecordingDriver {
        inner: MemoryDriver,
        seen: Arc<Mutex<Vec<SessionOptions>>>,
    }

    #[async_trait]
    impl CoordinationDriver for RecordingDriver {
        async fn connect(
            &self,
            options: SessionOptions,
        ) -> Result<Arc<dyn DriverSession>, StoreError> {
            self.seen.lock().unwrap().push(options.clone());
            self.inner.connect(options).await
        }
    }

    async fn recorded(config: RegistryConfig) -> SessionOptions {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let driver = RecordingDriver {
            inner: ensemble.driver(),
            seen: Arc::clone(&seen),
        };
        let center = RegistryCenter::new(config, driver);
        center.init().await.unwrap();
        center.destroy().await;
        let mut seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        seen.remove(0)
    }

    fn center(ensemble: &MemoryEnsemble) -> RegistryCenter<MemoryDriver> {
        let config = RegistryConfig::new("zk:2181", "unit").with_retry(5, 10, 3);
        RegistryCenter::new(config, ensemble.driver())
    }

    #[tokio::test]
    async fn test_operations_before_init_fail() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = center(&ensemble);
        let err = center.get("/a").await.unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::OperationFailed {
                operation: "get",
                source: StoreError::NotConnected,
                ..
            }
        ));
        assert!(center.session_state().is_none());
    }

    #[tokio::test]
    async fn test_init_only_once() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = center(&ensemble);
        assert_ok!(center.init().await);
        assert_eq!(center.session_state(), Some(SessionState::Connected));
        assert!(matches!(
            center.init().await,
            Err(CoordinationError::Connect(StoreError::BadArguments(_)))
        ));
        center.destroy().await;
        assert_err!(center.init().await);
        assert_eq!(ensemble.session_count(), 0);
    }

    #[tokio::test]
    async fn test_namespace_is_transparent() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = center(&ensemble);
        center.init().await.unwrap();
        center.persist("/config/a", "1").await.unwrap();
        assert_eq!(ensemble.data("/unit/config/a"), Some(b"1".to_vec()));
        assert!(!ensemble.contains("/config/a"));

        let seq = center.persist_sequential("/job-", "x").await.unwrap();
        assert_eq!(seq, "/job-0000000001");
        center.destroy().await;
    }

    #[tokio::test]
    async fn test_invalid_path_is_operation_failure() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = center(&ensemble);
        center.init().await.unwrap();
        let err = center.persist("relative", "v").await.unwrap_err();
        assert!(matches!(err.cause(), Some(StoreError::InvalidPath(_))));
        center.destroy().await;
    }

    #[tokio::test]
    async fn test_empty_servers_fail_init() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = RegistryCenter::new(RegistryConfig::new("", "ns"), ensemble.driver());
        assert!(matches!(
            center.init().await,
            Err(CoordinationError::Connect(StoreError::BadArguments(_)))
        ));
    }

    #[tokio::test]
    async fn test_destroy_without_init() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = center(&ensemble);
        center.destroy().await;
        center.destroy().await;
        assert!(matches!(
            center.is_existed("/a").await.unwrap_err().cause(),
            Some(StoreError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_init_forwards_session_options() {
        let config = RegistryConfig::new("zk:2181", "unit")
            .with_retry(5, 10, 3)
            .with_session_timeout_ms(60_000)
            .with_digest("app:secret");
        let options = recorded(config).await;
        assert_eq!(options.servers, vec!["zk:2181"]);
        assert_eq!(options.retry.max_retries(), 3);
        assert_eq!(options.session_timeout, Some(Duration::from_secs(60)));
        assert_eq!(options.connection_timeout, None);
        assert_eq!(
            options.auth,
            Some(AuthInfo {
                scheme: "digest".to_string(),
                credential: b"app:secret".to_vec(),
            })
        );

        let config = RegistryConfig::new("zk:2181", "unit")
            .with_retry(5, 10, 3)
            .with_connection_timeout_ms(15_000);
        let options = recorded(config).await;
        assert_eq!(options.session_timeout, None);
        assert_eq!(options.connection_timeout, Some(Duration::from_secs(15)));
        assert_eq!(options.auth, None);
    }

    #[tokio::test]
    async fn test_get_decodes_binary_payload_lossily() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = center(&ensemble);
        center.init().await.unwrap();

        let writer = ensemble
            .driver()
            .connect(SessionOptions {
                servers: vec!["zk:2181".to_string()],
                retry: center.config().retry_policy(),
                session_timeout: None,
                connection_timeout: None,
                auth: None,
            })
            .await
            .unwrap();
        assert!(writer.block_until_connected(Duration::from_secs(1)).await.unwrap());
        let options =
            CreateOptions::new(CreateMode::Persistent, vec![Acl::AnyoneAll]).creating_parents();
        writer.create("/unit/blob", &[b'o', b'k', 0xff], &options).await.unwrap();

        assert_eq!(center.get("/blob").await.unwrap(), "ok\u{fffd}");
        writer.close().await.unwrap();
        center.destroy().await;
    }

    #[tokio::test]
    async fn test_add_cache_after_destroy_registers_nothing() {
        let ensemble = MemoryEnsemble::serving("zk:2181");
        let center = center(&ensemble);
        center.init().await.unwrap();
        center.destroy().await;

        let Err(err) = center.add_cache_data("/svc").await else {
            panic!("cache registered after destroy");
        };
        assert!(matches!(err.cause(), Some(StoreError::SessionClosed)));
        assert!(center.get_cache("/svc").is_none());
    }
}
