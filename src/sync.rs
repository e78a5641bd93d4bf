//! Synchronization primitives.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

/// One async mutex per resource name.
///
/// Holding a lane's guard means no other execution against that resource is running. A lane
/// is dropped from the map once nobody holds or waits for it.
#[derive(Debug, Default)]
pub struct Lanes {
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lane for `name` is free and takes it.
    pub async fn enter(self: &Arc<Self>, name: &str) -> LaneGuard {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(lanes.entry(name.to_owned()).or_default())
        };
        let guard = lane.lock_owned().await;
        LaneGuard {
            guard: Some(guard),
            lanes: Arc::clone(self),
            name: name.to_owned(),
        }
    }
}

/// Exclusive hold on one resource lane.
#[derive(Debug)]
pub struct LaneGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lanes: Arc<Lanes>,
    name: String,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        // Release the mutex first so its count only reflects the map and any waiters.
        drop(self.guard.take());
        let mut lanes = self.lanes.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if lanes
            .get(&self.name)
            .map_or(false, |lane| Arc::strong_count(lane) == 1)
        {
            lanes.remove(&self.name);
        }
    }
}

/// A file guarded by a sibling lock file, so two processes never rewrite it at the same time.
pub struct LockedFile {
    /// Path to the lock file.
    lock_path: PathBuf,
    /// The file this lock protects.
    file_path: PathBuf,
}

impl LockedFile {
    /// Polls until the lock file can be created, giving up after `timeout`.
    pub async fn acquire(file_path: &Path, timeout: Duration) -> std::io::Result<Self> {
        let mut lock_path = file_path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::WouldBlock,
                            format!("{} is held by another process", lock_path.display()),
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            lock_path,
            file_path: file_path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            tracing::warn!(lock = %self.lock_path.display(), error = %e, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane_count(lanes: &Lanes) -> usize {
        lanes.lanes.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_lane_excludes_second_entry() {
        let lanes = Arc::new(Lanes::new());
        let guard = lanes.enter("web1").await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), lanes.enter("web1")).await;
        assert!(blocked.is_err());
        // A different resource has its own lane.
        let _other = lanes.enter("web2").await;
        drop(guard);
        let _again = lanes.enter("web1").await;
    }

    #[tokio::test]
    async fn test_released_lanes_are_forgotten() {
        let lanes = Arc::new(Lanes::new());
        for name in ["web1", "web2", "web1"] {
            let _guard = lanes.enter(name).await;
            assert_eq!(lane_count(&lanes), 1);
        }
        assert_eq!(lane_count(&lanes), 0);
    }

    #[tokio::test]
    async fn test_lane_with_waiter_is_kept() {
        let lanes = Arc::new(Lanes::new());
        let first = lanes.enter("web1").await;
        let waiter = tokio::spawn({
            let lanes = Arc::clone(&lanes);
            async move {
                let _guard = lanes.enter("web1").await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(lane_count(&lanes), 1);
        waiter.await.unwrap();
        assert_eq!(lane_count(&lanes), 0);
    }

    #[tokio::test]
    async fn test_lock_file_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("resources.yaml");
        let lock = LockedFile::acquire(&file, Duration::from_secs(1)).await.unwrap();
        assert!(dir.path().join("resources.yaml.lock").exists());
        assert!(LockedFile::acquire(&file, Duration::from_millis(150))
            .await
            .is_err());
        drop(lock);
        assert!(!dir.path().join("resources.yaml.lock").exists());
        assert!(LockedFile::acquire(&file, Duration::from_secs(1)).await.is_ok());
    }
}
