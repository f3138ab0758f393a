//! LRU eviction of other carts to make room for a file.
//!
//! `ensure_space` is a reservation check, not an allocation: two concurrent
//! callers may both see enough room and overshoot together.

use crate::{
    config::AppConfig,
    models::cart::Cart,
    services::{
        cart_store::{CartStore, StoreError},
        layout::CartLayout,
        space::{SpaceError, SpaceProbe, path_size},
    },
};
use chrono::{DateTime, Utc};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EvictionError {
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Evictor {
    store: CartStore,
    layout: CartLayout,
    space: Arc<dyn SpaceProbe>,
    lru_buffer: Duration,
}

impl Evictor {
    pub fn new(
        cfg: &AppConfig,
        store: CartStore,
        layout: CartLayout,
        space: Arc<dyn SpaceProbe>,
    ) -> Self {
        Self {
            store,
            layout,
            space,
            lru_buffer: cfg.lru_buffer(),
        }
    }

    /// Make sure `needed` bytes are free, evicting at most one cart per
    /// attempt.
    ///
    /// Returns `Ok(false)` when the deficit remains and no cart is eligible,
    /// or a candidate could not be removed. The loop runs at most once per
    /// live cart plus the final re-check, since every successful pass turns
    /// one candidate into a deleted cart.
    pub async fn ensure_space(&self, requesting_cart: i64, needed: u64) -> Result<bool, EvictionError> {
        let attempts = self.store.count_live_carts().await?.max(0) as usize + 1;

        for _ in 0..attempts {
            let free = self.space.free_bytes().await?;
            if free >= needed {
                return Ok(true);
            }
            debug!(
                cart_id = requesting_cart,
                needed, free, "not enough space, looking for a cart to evict"
            );

            let cutoff = lru_cutoff(self.lru_buffer);
            let Some(candidate) = self
                .store
                .find_eviction_candidate(requesting_cart, cutoff)
                .await?
            else {
                debug!(cart_id = requesting_cart, "no cart eligible for eviction");
                return Ok(false);
            };

            if !self.evict(&candidate).await? {
                return Ok(false);
            }
        }

        Ok(false)
    }

    /// Remove one cart's tree and mark it deleted. Returns false if the tree
    /// could not be removed, leaving the cart untouched.
    async fn evict(&self, cart: &Cart) -> Result<bool, EvictionError> {
        let root = self.layout.cart_root(cart.id);
        let freed = measure(root.clone()).await;

        if let Err(err) = self.layout.remove_cart_tree(cart.id).await {
            warn!(
                cart_id = cart.id,
                "failed to evict cart tree {}: {}",
                root.display(),
                err
            );
            return Ok(false);
        }
        self.store.mark_deleted(cart.id).await?;
        info!(
            cart_id = cart.id,
            cart_uid = %cart.cart_uid,
            freed_bytes = freed,
            "evicted least recently used cart"
        );
        Ok(true)
    }
}

/// Carts touched at or after this instant are inside the grace period.
fn lru_cutoff(buffer: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(buffer)
        .ok()
        .and_then(|grace| Utc::now().checked_sub_signed(grace))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Size of a tree for logging; unreadable or missing trees count as zero.
async fn measure(root: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || path_size(&root).unwrap_or(0))
        .await
        .unwrap_or(0)
}
