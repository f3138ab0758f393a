//! Represents a single requested file within a cart.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Staging state of one file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Staged,
    Error,
}

impl FileStatus {
    /// `staged` and `error` are final; only `pending` files still need work.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FileStatus::Pending)
    }
}

/// A file row. Owned by exactly one cart and never deleted on its own.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct CartFile {
    pub id: i64,

    /// Owning cart id.
    pub cart_id: i64,

    /// Archive-side identifier used for status and pull requests.
    pub file_name: String,

    /// Path relative to the cart's bundle directory.
    pub bundle_path: String,

    pub status: FileStatus,

    pub error: Option<String>,
}

/// Outcome of evaluating a cart's files for bundling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one file failed; the cart cannot be satisfied.
    Failed,
    /// Every file is on disk.
    Complete,
    /// Some files are still pending.
    Waiting,
}

/// Decide whether a cart with these files can be bundled.
///
/// A single error wins over everything else. An empty file set counts as
/// complete.
pub fn readiness(files: &[CartFile]) -> Readiness {
    if files.iter().any(|f| f.status == FileStatus::Error) {
        Readiness::Failed
    } else if files.iter().all(|f| f.status == FileStatus::Staged) {
        Readiness::Complete
    } else {
        Readiness::Waiting
    }
}
