//! Job-scoped temp directory with tracked handles and guaranteed release
//!
//! Every intermediate artifact of a retargeting job lives inside one
//! workspace directory. Paths handed out by the workspace are registered
//! so release can account for each of them exactly once; the directory
//! itself is removed last as a backstop for files external tools drop
//! next to the registered ones. Release is idempotent and also runs from
//! `Drop`, so a panicking or cancelled pipeline cannot leak the tree.

use revoice_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Workspace {
    root: PathBuf,
    files: Mutex<Vec<PathBuf>>,
    dirs: Mutex<Vec<PathBuf>>,
    released: AtomicBool,
}

impl Workspace {
    /// Create an empty, uniquely named workspace under `temp_root`
    pub fn create(temp_root: &Path, prefix: &str) -> Result<Self> {
        let root = temp_root.join(format!("{prefix}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Workspace created");
        Ok(Self {
            root,
            files: Mutex::new(Vec::new()),
            dirs: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return and register a fresh unique filename. The file itself is
    /// not created; the caller (usually an external tool) writes it.
    pub fn path(&self, prefix: &str, ext: Option<&str>) -> PathBuf {
        let name = match ext {
            Some(ext) => format!("{prefix}-{}.{ext}", Uuid::new_v4()),
            None => format!("{prefix}-{}", Uuid::new_v4()),
        };
        let path = self.root.join(name);
        self.files.lock().expect("workspace lock poisoned").push(path.clone());
        path
    }

    /// Register and return a path with a caller-chosen name inside `dir`.
    ///
    /// Used for the fixed layout entries (`original.wav`,
    /// `refs/<speaker>.wav`, `tts/<index>.wav`, `mix/final.wav`).
    pub fn named_path(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        self.files.lock().expect("workspace lock poisoned").push(path.clone());
        path
    }

    /// Create and register a subdirectory
    pub fn dir(&self, prefix: &str) -> Result<PathBuf> {
        let path = self.root.join(format!("{prefix}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        self.dirs.lock().expect("workspace lock poisoned").push(path.clone());
        Ok(path)
    }

    /// Create and register a subdirectory with a fixed name
    pub fn named_dir(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path)?;
        self.dirs.lock().expect("workspace lock poisoned").push(path.clone());
        Ok(path)
    }

    /// Assert `path` exists, is a regular file and is non-empty
    pub fn verify(&self, path: &Path) -> Result<()> {
        let meta = std::fs::metadata(path).map_err(|e| Error::InvalidArtifact {
            path: path.to_path_buf(),
            reason: format!("not accessible: {e}"),
        })?;
        if !meta.is_file() {
            return Err(Error::InvalidArtifact {
                path: path.to_path_buf(),
                reason: "not a regular file".to_string(),
            });
        }
        if meta.len() == 0 {
            return Err(Error::InvalidArtifact {
                path: path.to_path_buf(),
                reason: "empty file".to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort removal of every registered path, then the root.
    ///
    /// Individual failures are logged and do not abort the sweep. The
    /// handle is drained, so a second call is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let files = std::mem::take(&mut *self.files.lock().expect("workspace lock poisoned"));
        for file in files {
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), "Failed to remove workspace file: {e}"),
            }
        }

        let dirs = std::mem::take(&mut *self.dirs.lock().expect("workspace lock poisoned"));
        for dir in dirs {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), "Failed to remove workspace dir: {e}"),
            }
        }

        // External tools may leave unregistered droppings next to the
        // registered artifacts; the root sweep catches those.
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(root = %self.root.display(), "Workspace released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(root = %self.root.display(), "Failed to remove workspace root: {e}"),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}
