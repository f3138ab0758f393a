//! Represents a cart: a named collection of requested files tracked through
//! staging to a downloadable bundle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle state of a cart.
///
/// `processing` is the initial state. `ready` and `error` are terminal for the
/// staging pipeline; `deleted` is reachable from any other state through an
/// explicit delete or an eviction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CartStatus {
    Processing,
    Staged,
    Ready,
    Error,
    Deleted,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Processing => "processing",
            CartStatus::Staged => "staged",
            CartStatus::Ready => "ready",
            CartStatus::Error => "error",
            CartStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for CartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cart row.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Cart {
    /// Store-assigned key; also the top-level directory under the volume.
    pub id: i64,

    /// Client-supplied identifier. Not unique: retried requests may create
    /// several rows for the same uid.
    pub cart_uid: String,

    pub status: CartStatus,

    /// Directory that, when tarred, produces the download. Set once ready.
    pub bundle_path: Option<String>,

    /// Human-readable failure, set only when `status` is `error`.
    pub error: Option<String>,

    pub creation_date: DateTime<Utc>,

    /// Bumped on every mutation of the cart or one of its files. This is the
    /// clock used by LRU eviction.
    pub updated_date: DateTime<Utc>,

    pub deleted_date: Option<DateTime<Utc>>,
}

impl Cart {
    /// A cart is live until it has been deleted or evicted.
    pub fn is_live(&self) -> bool {
        self.status != CartStatus::Deleted && self.deleted_date.is_none()
    }

    /// Whether this cart may be evicted to make room for `requesting_cart`.
    ///
    /// The requesting cart is never eligible, nor is a deleted cart, nor one
    /// touched at or after `cutoff` (the LRU grace period).
    pub fn is_evictable_for(&self, requesting_cart: i64, cutoff: DateTime<Utc>) -> bool {
        self.id != requesting_cart && self.is_live() && self.updated_date < cutoff
    }
}

/// Pick the authoritative cart for a uid: the newest live row.
///
/// Ties on `creation_date` fall back to the higher id, which is the later
/// insert.
pub fn select_latest<'a, I>(carts: I, cart_uid: &str) -> Option<&'a Cart>
where
    I: IntoIterator<Item = &'a Cart>,
{
    carts
        .into_iter()
        .filter(|cart| cart.cart_uid == cart_uid && cart.is_live())
        .max_by_key(|cart| (cart.creation_date, cart.id))
}

/// Pick the cart to evict: the oldest-created cart eligible under
/// [`Cart::is_evictable_for`].
pub fn select_eviction_candidate<'a, I>(
    carts: I,
    requesting_cart: i64,
    cutoff: DateTime<Utc>,
) -> Option<&'a Cart>
where
    I: IntoIterator<Item = &'a Cart>,
{
    carts
        .into_iter()
        .filter(|cart| cart.is_evictable_for(requesting_cart, cutoff))
        .min_by_key(|cart| (cart.creation_date, cart.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cart(id: i64, uid: &str, created_mins_ago: i64, updated_mins_ago: i64) -> Cart {
        let now = Utc::now();
        Cart {
            id,
            cart_uid: uid.to_string(),
            status: CartStatus::Processing,
            bundle_path: None,
            error: None,
            creation_date: now - Duration::minutes(created_mins_ago),
            updated_date: now - Duration::minutes(updated_mins_ago),
            deleted_date: None,
        }
    }

    #[test]
    fn latest_prefers_newest_live_row() {
        let mut deleted = cart(3, "abc", 1, 1);
        deleted.status = CartStatus::Deleted;
        deleted.deleted_date = Some(Utc::now());
        let carts = vec![cart(1, "abc", 30, 30), cart(2, "abc", 10, 10), deleted, cart(4, "other", 0, 0)];

        let latest = select_latest(&carts, "abc").unwrap();
        assert_eq!(latest.id, 2);
    }

    #[test]
    fn latest_is_none_when_all_rows_deleted() {
        let mut only = cart(1, "abc", 5, 5);
        only.status = CartStatus::Deleted;
        only.deleted_date = Some(Utc::now());
        assert!(select_latest(&[only], "abc").is_none());
    }

    #[test]
    fn eviction_skips_requesting_deleted_and_recent_carts() {
        let cutoff = Utc::now() - Duration::minutes(5);
        let requesting = cart(1, "a", 100, 100);
        let mut deleted = cart(2, "b", 90, 90);
        deleted.status = CartStatus::Deleted;
        deleted.deleted_date = Some(Utc::now());
        let recent = cart(3, "c", 80, 1);
        let eligible_newer = cart(4, "d", 20, 20);
        let eligible_older = cart(5, "e", 40, 10);

        let carts = vec![requesting, deleted, recent, eligible_newer, eligible_older];
        let picked = select_eviction_candidate(&carts, 1, cutoff).unwrap();
        assert_eq!(picked.id, 5);
    }

    #[test]
    fn eviction_has_no_candidate_when_only_requesting_cart_exists() {
        let cutoff = Utc::now();
        let carts = vec![cart(1, "a", 100, 100)];
        assert!(select_eviction_candidate(&carts, 1, cutoff).is_none());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CartStatus::Ready).unwrap(), "\"ready\"");
        assert_eq!(CartStatus::Processing.to_string(), "processing");
    }
}
