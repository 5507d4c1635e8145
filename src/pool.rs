//! One upload session per owner, created and torn down explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::config::UploadConfig;
use crate::session::{Session, SessionHandle};
use crate::storage::StorageAdapter;
use crate::task::OwnerKey;

/// Keeps a session for each owner (inspection × checklist item) sharing one
/// storage backend and configuration.
pub struct SessionPool {
    config: UploadConfig,
    adapter: Arc<dyn StorageAdapter>,
    sessions: Mutex<HashMap<OwnerKey, SessionHandle>>,
}

impl SessionPool {
    /// Creates an empty pool; sessions are spawned on demand.
    #[must_use]
    pub fn new(config: UploadConfig, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            config,
            adapter,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the owner's session, spawning it on first use.
    ///
    /// A session that has shut down is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// pool's configuration is invalid.
    pub async fn get_or_create(&self, owner: &OwnerKey) -> crate::Result<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(owner)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }
        log::debug!("Creating upload session for {owner}");
        let handle = Session::spawn(self.config.clone(), Arc::clone(&self.adapter))?;
        sessions.insert(owner.clone(), handle.clone());
        Ok(handle)
    }

    /// Returns the owner's session if one exists.
    pub async fn get(&self, owner: &OwnerKey) -> Option<SessionHandle> {
        self.sessions.lock().await.get(owner).cloned()
    }

    /// Shuts down and forgets the owner's session.
    ///
    /// Returns false if the owner had no session.
    pub async fn teardown(&self, owner: &OwnerKey) -> bool {
        let handle = self.sessions.lock().await.remove(owner);
        match handle {
            Some(handle) => {
                log::debug!("Tearing down upload session for {owner}");
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shuts down every session, returning how many there were.
    pub async fn teardown_all(&self) -> usize {
        let handles: Vec<_> = self.sessions.lock().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        join_all(handles.iter().map(SessionHandle::shutdown)).await;
        count
    }

    /// Number of sessions currently held.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// True if no sessions are held.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressReporter;
    use crate::storage::{PutMeta, StorageError};
    use crate::task::{StoredObject, UploadFile};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    /// Adapter whose transfers never finish on their own.
    struct StalledStorage;

    #[async_trait]
    impl StorageAdapter for StalledStorage {
        async fn put(
            &self,
            _file: &UploadFile,
            _meta: &PutMeta,
            _progress: ProgressReporter,
            cancel: CancellationToken,
        ) -> Result<StoredObject, StorageError> {
            cancel.cancelled().await;
            Err(StorageError::Aborted)
        }

        async fn remove(&self, _path: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn pool() -> SessionPool {
        SessionPool::new(UploadConfig::default(), Arc::new(StalledStorage))
    }

    #[tokio::test]
    async fn sessions_are_per_owner() {
        let pool = pool();
        let a = OwnerKey::checklist_item("insp-1", "item-1");
        let b = OwnerKey::checklist_item("insp-1", "item-2");

        let sa = pool.get_or_create(&a).await.unwrap();
        let sb = pool.get_or_create(&b).await.unwrap();
        sa.enqueue(vec![UploadFile::new("a.jpg", "image/jpeg", vec![0u8; 4])], Some(a.clone()))
            .await
            .unwrap();

        assert_eq!(pool.len().await, 2);
        assert_eq!(sa.snapshot().tasks.len(), 1);
        assert!(sb.snapshot().tasks.is_empty());

        let again = pool.get_or_create(&a).await.unwrap();
        assert_eq!(again.snapshot().tasks.len(), 1);
    }

    #[tokio::test]
    async fn teardown_cancels_pending_tasks() {
        let pool = pool();
        let owner = OwnerKey::inspection("insp-9");
        let session = pool.get_or_create(&owner).await.unwrap();
        session
            .enqueue(vec![UploadFile::new("a.jpg", "image/jpeg", vec![0u8; 4])], None)
            .await
            .unwrap();

        assert!(pool.teardown(&owner).await);
        assert!(!pool.teardown(&owner).await);
        assert!(pool.get(&owner).await.is_none());

        let last = session.snapshot();
        assert!(last
            .tasks
            .iter()
            .all(|t| t.status == crate::task::TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn teardown_all_empties_pool() {
        let pool = pool();
        pool.get_or_create(&OwnerKey::inspection("a")).await.unwrap();
        pool.get_or_create(&OwnerKey::inspection("b")).await.unwrap();
        assert_eq!(pool.teardown_all().await, 2);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn closed_session_is_replaced() {
        let pool = pool();
        let owner = OwnerKey::inspection("insp-3");
        let first = pool.get_or_create(&owner).await.unwrap();
        first.shutdown().await;
        assert!(first.is_closed());
        let second = pool.get_or_create(&owner).await.unwrap();
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn invalid_config_spawns_nothing() {
        let pool = SessionPool::new(
            UploadConfig::new().with_max_concurrent_uploads(0),
            Arc::new(StalledStorage),
        );
        let owner = OwnerKey::inspection("insp-4");
        assert!(matches!(
            pool.get_or_create(&owner).await,
            Err(crate::Error::InvalidConfig(_))
        ));
        assert!(pool.is_empty().await);
    }
}
