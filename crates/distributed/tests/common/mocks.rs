use async_trait::async_trait;
use bytes::Bytes;
use quarry_core::{ContentHash, MemoryClock};
use quarry_distributed::{CopiedFile, CopyOptions, FileCopier, FileCopyError};
use quarry_storage::{MemorySharedStore, SharedStore, StorageError, StorageResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub enum Step {
    /// Succeed, writing these bytes to the destination.
    Serve(Bytes),
    Fail(FileCopyError),
}

/// File copier over `<location>/<hash>` handles with per-location scripts.
///
/// The n-th call for a location plays the n-th step of its script; calls past
/// the end repeat the last step. Unscripted locations fail with a source path
/// error.
#[derive(Default)]
pub struct ScriptedFileCopier {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFileCopier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, location: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(location.to_string(), steps);
    }

    /// Locations in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_step(&self, location: &str) -> Step {
        let mut calls = self.calls.lock().unwrap();
        let index = calls.iter().filter(|c| *c == location).count();
        calls.push(location.to_string());

        let scripts = self.scripts.lock().unwrap();
        match scripts.get(location) {
            Some(steps) if !steps.is_empty() => steps[index.min(steps.len() - 1)].clone(),
            _ => Step::Fail(FileCopyError::SourcePath(format!("{location}: no such machine"))),
        }
    }
}

#[async_trait]
impl FileCopier<String> for ScriptedFileCopier {
    async fn copy_to(
        &self,
        source: &String,
        destination: &Path,
        options: CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<CopiedFile, FileCopyError> {
        if cancel.is_cancelled() {
            return Err(FileCopyError::Cancelled);
        }
        let location = source.rsplit_once('/').map_or(source.as_str(), |(l, _)| l);
        match self.next_step(location) {
            Step::Serve(data) => {
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent).await.unwrap();
                }
                tokio::fs::write(destination, &data)
                    .await
                    .map_err(|e| FileCopyError::DestinationPath(e.to_string()))?;
                Ok(CopiedFile {
                    bytes_copied: data.len() as u64,
                    hash: options.hash_type.map(|t| ContentHash::compute(t, &data)),
                })
            }
            Step::Fail(error) => Err(error),
        }
    }
}

/// Shared store wrapper counting remote calls, with an outage switch.
pub struct CountingSharedStore {
    inner: MemorySharedStore,
    pub fail: AtomicBool,
    pub exists_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub set_calls: AtomicUsize,
    pub increment_calls: AtomicUsize,
}

impl CountingSharedStore {
    pub fn new(clock: Arc<MemoryClock>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySharedStore::new(clock),
            fail: AtomicBool::new(false),
            exists_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            set_calls: AtomicUsize::new(0),
            increment_calls: AtomicUsize::new(0),
        })
    }

    fn check(&self) -> StorageResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("shared store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for CountingSharedStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: Bytes,
        expiry: Duration,
    ) -> StorageResult<bool> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.set_if_absent_with_expiry(key, value, expiry).await
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        expiry: Duration,
    ) -> StorageResult<i64> {
        self.increment_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.increment_with_expiry(key, delta, expiry).await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}
