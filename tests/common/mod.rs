#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use evidence_upload::{
    ProgressReporter, PutMeta, Session, SessionHandle, Snapshot, StorageAdapter, StorageError,
    StoredObject, UploadConfig, UploadFile,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// A transfer the test decides the fate of.
pub struct PendingPut {
    pub name: String,
    pub meta: PutMeta,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
    reply: oneshot::Sender<Result<StoredObject, StorageError>>,
}

impl PendingPut {
    pub fn succeed(self) {
        let stored = stored_object(&self.name);
        let _ = self.reply.send(Ok(stored));
    }

    pub fn fail(self, error: StorageError) {
        let _ = self.reply.send(Err(error));
    }
}

pub fn stored_object(name: &str) -> StoredObject {
    StoredObject {
        path: format!("evidence/{name}"),
        url: format!("https://cdn.test/evidence/{name}"),
        thumbnail_url: None,
    }
}

/// Adapter that hands every `put` to the test and waits for its verdict.
pub struct GatedStorage {
    puts: mpsc::UnboundedSender<PendingPut>,
    removals: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl StorageAdapter for GatedStorage {
    async fn put(
        &self,
        file: &UploadFile,
        meta: &PutMeta,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<StoredObject, StorageError> {
        let (reply, verdict) = oneshot::channel();
        let _ = self.puts.send(PendingPut {
            name: file.name.clone(),
            meta: meta.clone(),
            progress,
            cancel: cancel.clone(),
            reply,
        });
        tokio::select! {
            result = verdict => result.unwrap_or_else(|_| Err(StorageError::Network("put dropped by test".into()))),
            () = cancel.cancelled() => Err(StorageError::Aborted),
        }
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let _ = self.removals.send(path.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub session: SessionHandle,
    pub puts: mpsc::UnboundedReceiver<PendingPut>,
    pub removals: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    pub fn new(config: UploadConfig) -> Self {
        let (puts_tx, puts) = mpsc::unbounded_channel();
        let (removals_tx, removals) = mpsc::unbounded_channel();
        let storage = GatedStorage {
            puts: puts_tx,
            removals: removals_tx,
        };
        Self {
            session: Session::spawn(config, Arc::new(storage)).expect("valid config"),
            puts,
            removals,
        }
    }

    pub fn with_concurrency(n: usize) -> Self {
        Self::new(UploadConfig::new().with_max_concurrent_uploads(n))
    }

    /// Waits for the next transfer to reach the adapter.
    pub async fn next_put(&mut self) -> PendingPut {
        tokio::time::timeout(WAIT, self.puts.recv())
            .await
            .expect("timed out waiting for a put")
            .expect("storage dropped")
    }

    /// Waits for a snapshot matching `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Snapshot
    where
        F: FnMut(&Snapshot) -> bool,
    {
        tokio::time::timeout(WAIT, self.session.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("session closed")
    }

    /// Subscribes a callback that records every snapshot it receives.
    pub async fn record(&self) -> Arc<Mutex<Vec<Snapshot>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        self.session
            .subscribe(move |s| sink.lock().unwrap().push(s.clone()))
            .await
            .unwrap();
        seen
    }
}

pub fn file(name: &str) -> UploadFile {
    UploadFile::new(name, "image/jpeg", vec![0u8; 64])
}

pub fn files(names: &[&str]) -> Vec<UploadFile> {
    names.iter().map(|n| file(n)).collect()
}
