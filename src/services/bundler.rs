//! Readiness check and bundling trigger.
//!
//! Bundling is lazy: a ready cart only certifies that every file is on disk
//! under its bundle directory. The tar is produced at download time.

use crate::{
    models::{
        cart::CartStatus,
        file::{Readiness, readiness},
    },
    services::{
        cart_store::{CartStore, StoreResult},
        layout::CartLayout,
    },
};
use tracing::{debug, info, warn};

/// Error recorded on a cart when any of its files failed.
pub const CART_FAILED_MESSAGE: &str = "Failed to pull file(s)";

#[derive(Clone)]
pub struct Bundler {
    store: CartStore,
    layout: CartLayout,
}

impl Bundler {
    pub fn new(store: CartStore, layout: CartLayout) -> Self {
        Self { store, layout }
    }

    /// Re-evaluate a cart after one of its files changed state.
    ///
    /// Only a `processing` cart moves: `ready` and `error` are sticky. A cart
    /// deleted between the read and the write is left alone without raising
    /// an error; the next file event re-runs the check anyway.
    pub async fn prepare_bundle(&self, cart_id: i64) -> StoreResult<Readiness> {
        let files = self.store.list_files_for_cart(cart_id).await?;
        let state = readiness(&files);

        match state {
            Readiness::Failed => {
                if self.store.mark_error(cart_id, CART_FAILED_MESSAGE).await? {
                    warn!(cart_id, "cart failed: at least one file could not be staged");
                } else {
                    debug!(cart_id, "cart no longer processing, error not recorded");
                }
            }
            Readiness::Complete => self.mark_ready(cart_id).await?,
            Readiness::Waiting => {
                debug!(cart_id, "cart still waiting on pending files");
            }
        }
        Ok(state)
    }

    async fn mark_ready(&self, cart_id: i64) -> StoreResult<()> {
        let Some(cart) = self.store.get_cart(cart_id).await? else {
            debug!(cart_id, "cart vanished before bundling");
            return Ok(());
        };
        if cart.status != CartStatus::Processing {
            debug!(cart_id, status = %cart.status, "cart no longer processing, not marking ready");
            return Ok(());
        }
        let bundle_dir = self.layout.bundle_dir(&cart);
        // A cart with no files still downloads as an empty bundle.
        if let Err(err) = tokio::fs::create_dir_all(&bundle_dir).await {
            warn!(cart_id, "failed to create bundle directory: {}", err);
            self.store
                .mark_error(cart_id, &format!("Failed directory create with error: {}", err))
                .await?;
            return Ok(());
        }
        let bundle_path = bundle_dir.to_string_lossy();
        if self.store.mark_ready(cart_id, &bundle_path).await? {
            info!(cart_id, cart_uid = %cart.cart_uid, "cart ready at {}", bundle_path);
        } else {
            debug!(cart_id, "cart no longer processing, not marking ready");
            let deleted = !self
                .store
                .get_cart(cart_id)
                .await?
                .is_some_and(|current| current.is_live());
            if deleted {
                if let Err(err) = self.layout.remove_cart_tree(cart_id).await {
                    warn!(cart_id, "failed to discard tree of deleted cart: {}", err);
                }
            }
        }
        Ok(())
    }
}
