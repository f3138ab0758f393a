//! On-disk layout of the staging volume.
//!
//! ```text
//! {volume}/{cart.id}/{cart.cart_uid}/{file.bundle_path}
//! ```
//!
//! The `{cart.id}` directory is the unit of deletion and eviction; the
//! `{cart_uid}` directory beneath it is the bundle that gets tarred.

use crate::models::{cart::Cart, file::CartFile};
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct CartLayout {
    volume: PathBuf,
}

impl CartLayout {
    pub fn new(volume: impl Into<PathBuf>) -> Self {
        Self {
            volume: volume.into(),
        }
    }

    pub fn volume(&self) -> &Path {
        &self.volume
    }

    /// Everything belonging to one cart lives under this directory.
    pub fn cart_root(&self, cart_id: i64) -> PathBuf {
        self.volume.join(cart_id.to_string())
    }

    /// The directory served as the cart's download.
    pub fn bundle_dir(&self, cart: &Cart) -> PathBuf {
        self.cart_root(cart.id).join(&cart.cart_uid)
    }

    /// Absolute destination for one file's bytes.
    pub fn file_path(&self, cart: &Cart, file: &CartFile) -> PathBuf {
        self.bundle_dir(cart).join(&file.bundle_path)
    }

    /// Create the parent directories of `path` if they are missing.
    pub async fn create_parent_dirs(&self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => fs::create_dir_all(parent).await,
            None => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "destination path has no parent directory",
            )),
        }
    }

    /// Remove a cart's whole tree. A tree that never existed (no file was
    /// pulled yet) counts as removed.
    pub async fn remove_cart_tree(&self, cart_id: i64) -> io::Result<()> {
        let root = self.cart_root(cart_id);
        match fs::remove_dir_all(&root).await {
            Ok(()) => {
                debug!("removed cart tree {}", root.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("cart tree {} already missing", root.display());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Strip a single leading `/` from a client-supplied uid or file path.
pub fn fix_absolute_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// A relative bundle path is safe when it stays inside the bundle directory:
/// non-empty, not absolute, and free of `..` components.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
