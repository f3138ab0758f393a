//! src/services/cart_store.rs
//!
//! CartStore is the persistence boundary for carts and their files. Every
//! query lives here; the "which cart is authoritative" and "which cart may be
//! evicted" rules are applied through the named selectors in
//! [`crate::models::cart`] so they stay testable without a database.

use crate::models::{
    cart::{Cart, CartStatus, select_eviction_candidate, select_latest},
    file::{CartFile, FileStatus},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const CART_COLUMNS: &str = "id, cart_uid, status, bundle_path, error, creation_date, \
                            updated_date, deleted_date";
const FILE_COLUMNS: &str = "id, cart_id, file_name, bundle_path, status, error";

/// Embedded schema, applied statement by statement.
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cart `{0}` not found")]
    CartNotFound(i64),
    #[error("file `{0}` not found")]
    FileNotFound(i64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One requested file before it has a row: archive id plus the relative
/// location inside the bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFile {
    pub file_name: String,
    pub bundle_path: String,
}

/// Repository over the `carts` and `files` tables.
#[derive(Clone)]
pub struct CartStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl CartStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create the tables and indexes if they are missing.
    pub async fn migrate(&self) -> StoreResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    /// Insert a cart and all of its files in one transaction.
    ///
    /// Either every file row exists afterwards or none does, so a concurrent
    /// reader never sees a cart with a partial file set.
    pub async fn create_cart_with_files(
        &self,
        cart_uid: &str,
        files: &[NewFile],
    ) -> StoreResult<(Cart, Vec<CartFile>)> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let cart = sqlx::query_as::<_, Cart>(&format!(
            "INSERT INTO carts (cart_uid, status, creation_date, updated_date)
             VALUES (?, ?, ?, ?)
             RETURNING {CART_COLUMNS}"
        ))
        .bind(cart_uid)
        .bind(CartStatus::Processing)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let mut rows = Vec::with_capacity(files.len());
        for file in files {
            let row = sqlx::query_as::<_, CartFile>(&format!(
                "INSERT INTO files (cart_id, file_name, bundle_path, status)
                 VALUES (?, ?, ?, ?)
                 RETURNING {FILE_COLUMNS}"
            ))
            .bind(cart.id)
            .bind(&file.file_name)
            .bind(&file.bundle_path)
            .bind(FileStatus::Pending)
            .fetch_one(&mut *tx)
            .await?;
            rows.push(row);
        }

        tx.commit().await?;
        debug!(cart_id = cart.id, files = rows.len(), "created cart {}", cart_uid);
        Ok((cart, rows))
    }

    pub async fn get_cart(&self, id: i64) -> StoreResult<Option<Cart>> {
        let cart = sqlx::query_as::<_, Cart>(&format!(
            "SELECT {CART_COLUMNS} FROM carts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(cart)
    }

    pub async fn get_file(&self, id: i64) -> StoreResult<Option<CartFile>> {
        let file = sqlx::query_as::<_, CartFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(file)
    }

    /// All live (non-deleted) carts for a uid, oldest first.
    pub async fn list_live_by_uid(&self, cart_uid: &str) -> StoreResult<Vec<Cart>> {
        let carts = sqlx::query_as::<_, Cart>(&format!(
            "SELECT {CART_COLUMNS} FROM carts
             WHERE cart_uid = ? AND status != 'deleted' AND deleted_date IS NULL
             ORDER BY id ASC"
        ))
        .bind(cart_uid)
        .fetch_all(&*self.db)
        .await?;
        Ok(carts)
    }

    /// The authoritative cart for a uid: the newest live row.
    pub async fn find_latest_by_uid(&self, cart_uid: &str) -> StoreResult<Option<Cart>> {
        let carts = self.list_live_by_uid(cart_uid).await?;
        Ok(select_latest(&carts, cart_uid).cloned())
    }

    /// The oldest-created live cart other than `requesting_cart` that has not
    /// been touched since `cutoff`.
    ///
    /// Dates are stored as RFC 3339 UTC text, which sorts chronologically, so
    /// the filter and ordering run in SQLite. The row is still passed through
    /// [`select_eviction_candidate`] so the eligibility rule has one definition.
    pub async fn find_eviction_candidate(
        &self,
        requesting_cart: i64,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Cart>> {
        let rows = sqlx::query_as::<_, Cart>(&format!(
            "SELECT {CART_COLUMNS} FROM carts
             WHERE id != ? AND status != 'deleted' AND deleted_date IS NULL
               AND updated_date < ?
             ORDER BY creation_date ASC, id ASC
             LIMIT 1"
        ))
        .bind(requesting_cart)
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        Ok(select_eviction_candidate(&rows, requesting_cart, cutoff).cloned())
    }

    pub async fn count_live_carts(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM carts WHERE status != 'deleted' AND deleted_date IS NULL",
        )
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    pub async fn list_files_for_cart(&self, cart_id: i64) -> StoreResult<Vec<CartFile>> {
        let files = sqlx::query_as::<_, CartFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE cart_id = ? ORDER BY id ASC"
        ))
        .bind(cart_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    /// Record a file transition and bump its cart's LRU clock together.
    pub async fn set_file_status(
        &self,
        file: &CartFile,
        status: FileStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query("UPDATE files SET status = ?, error = COALESCE(?, error) WHERE id = ?")
            .bind(status)
            .bind(error)
            .bind(file.id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::FileNotFound(file.id));
        }

        sqlx::query("UPDATE carts SET updated_date = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(file.cart_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move a processing cart to `ready`. Returns false when the cart is gone
    /// or already in another state.
    pub async fn mark_ready(&self, id: i64, bundle_path: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE carts SET status = ?, bundle_path = ?, updated_date = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(CartStatus::Ready)
        .bind(bundle_path)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a processing cart to `error`. Same conditions as [`Self::mark_ready`].
    pub async fn mark_error(&self, id: i64, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE carts SET status = ?, error = ?, updated_date = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(CartStatus::Error)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a live cart deleted. Returns false if it was already deleted.
    pub async fn mark_deleted(&self, id: i64) -> StoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE carts SET status = ?, deleted_date = ?, updated_date = ?
             WHERE id = ? AND status != 'deleted'",
        )
        .bind(CartStatus::Deleted)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
