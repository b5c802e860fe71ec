//! Persisted environment descriptors and per-name file locks.
//!
//! One JSON file per environment under `<root>/environments/<name>.json`.
//! Writes go through a temp file and a rename so a reader never sees a
//! partially written descriptor.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use capsule_env::DependencySpec;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub name: String,
    pub spec: DependencySpec,
    pub created_at: DateTime<Utc>,
}

impl EnvironmentDescriptor {
    pub fn new(name: impl Into<String>, spec: DependencySpec) -> Self {
        Self {
            name: name.into(),
            spec,
            created_at: Utc::now(),
        }
    }
}

pub struct DescriptorStore {
    dir: PathBuf,
}

impl DescriptorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path(name)).await.unwrap_or(false)
    }

    pub async fn write(&self, descriptor: &EnvironmentDescriptor) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_vec_pretty(descriptor)?;
        let target = self.path(&descriptor.name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", descriptor.name, std::process::id()));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e);
        }
        Ok(())
    }

    pub async fn read(&self, name: &str) -> io::Result<Option<EnvironmentDescriptor>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns whether a descriptor was removed.
    pub async fn remove(&self, name: &str) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every readable descriptor, sorted by name. Unreadable files are
    /// skipped with a warning.
    pub async fn load_all(&self) -> io::Result<Vec<EnvironmentDescriptor>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_descriptor = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_descriptor {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_slice::<EnvironmentDescriptor>(&data)
                        .map_err(|e| e.to_string())
                });
            match parsed {
                Ok(descriptor) => out.push(descriptor),
                Err(e) => warn!("[manager] Skipping unreadable descriptor {:?}: {}", path, e),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// Exclusive cross-process lock on one environment name. Released on drop.
pub struct NameLock {
    _file: File,
    path: PathBuf,
}

impl NameLock {
    /// Block (off the async runtime) until the lock for `name` is held.
    pub async fn acquire(locks_dir: &Path, name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.lock", name));
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || lock_file(&lock_path))
            .await
            .map_err(io::Error::other)??;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_file(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK};

        let handle = file.as_raw_handle() as HANDLE;
        let result = unsafe {
            let mut overlapped = std::mem::zeroed();
            LockFileEx(handle, LOCKFILE_EXCLUSIVE_LOCK, 0, 1, 0, &mut overlapped)
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
    }

    info!("[manager] Acquired name lock {:?}", path);
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_remove() {
        let tmp = TempDir::new().unwrap();
        let store = DescriptorStore::new(tmp.path().join("environments"));
        let descriptor =
            EnvironmentDescriptor::new("demo", DependencySpec::new().with("pip", "requests"));

        store.write(&descriptor).await.unwrap();
        assert!(store.exists("demo").await);
        assert_eq!(store.read("demo").await.unwrap(), Some(descriptor));

        assert!(store.remove("demo").await.unwrap());
        assert!(!store.remove("demo").await.unwrap());
        assert_eq!(store.read("demo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_all_sorted_and_skips_garbage() {
        let tmp = TempDir::new().unwrap();
        let store = DescriptorStore::new(tmp.path());
        for name in ["zeta", "alpha", "mid"] {
            store
                .write(&EnvironmentDescriptor::new(name, DependencySpec::new()))
                .await
                .unwrap();
        }
        std::fs::write(tmp.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let names: Vec<String> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_load_all_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let store = DescriptorStore::new(tmp.path().join("nope"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_descriptor_json_shape() {
        let descriptor = EnvironmentDescriptor::new("demo", DependencySpec::new());
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["name"], "demo");
        assert_eq!(json["spec"], serde_json::json!({}));
        assert!(json["created_at"].is_string());
    }

    #[tokio::test]
    async fn test_name_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let locks = tmp.path().to_path_buf();

        let first = NameLock::acquire(&locks, "demo").await.unwrap();
        assert!(first.path().ends_with("demo.lock"));

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        let waiter_dir = locks.clone();
        let waiter = tokio::spawn(async move {
            let _second = NameLock::acquire(&waiter_dir, "demo").await.unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
