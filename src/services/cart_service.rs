//! src/services/cart_service.rs
//!
//! CartService: the operations behind the four HTTP verbs. It owns the
//! store, the on-disk layout and the sending half of the staging queue, and
//! is cheap to clone into every handler.

use crate::{
    config::AppConfig,
    models::cart::CartStatus,
    services::{
        archive::ArchiveClient,
        cart_store::{CartStore, NewFile, StoreResult},
        eviction::Evictor,
        layout::CartLayout,
        queue::{QueueError, StagingJob, StagingQueue, spawn_dispatcher},
        space::SpaceProbe,
        staging::StagingOrchestrator,
    },
};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use tokio::{fs, task::JoinHandle};
use tracing::{info, warn};

/// Last recorded `[status, error]` pair for a uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: String,
    pub error: Option<String>,
}

/// What a download request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    /// No live cart, or the cart is still processing or failed.
    NotReady,
    /// The cart is ready but its bundle directory is gone from disk.
    BundleMissing,
    /// Stream `bundle_dir` with `arcname` as its top-level entry.
    Ready { bundle_dir: PathBuf, arcname: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No live cart existed for the uid.
    NotFound,
    /// At least one cart tree could not be removed. Trees removed before the
    /// failure stay removed.
    Partial,
}

#[derive(Clone)]
pub struct CartService {
    /// Shared SQLite connection pool, used directly by readiness probes.
    pub db: Arc<SqlitePool>,

    pub store: CartStore,

    pub layout: CartLayout,

    queue: StagingQueue,
}

impl CartService {
    /// Wire up the staging pipeline and start its dispatcher.
    pub fn start(
        cfg: &AppConfig,
        db: Arc<SqlitePool>,
        archive: Arc<dyn ArchiveClient>,
        space: Arc<dyn SpaceProbe>,
    ) -> (Self, JoinHandle<()>) {
        let store = CartStore::new(db.clone());
        let layout = CartLayout::new(cfg.volume_path.clone());
        let (queue, rx) = StagingQueue::channel();

        let evictor = Evictor::new(cfg, store.clone(), layout.clone(), space);
        let orchestrator = Arc::new(StagingOrchestrator::new(
            cfg,
            store.clone(),
            layout.clone(),
            archive,
            evictor,
            queue.clone(),
        ));
        let dispatcher = spawn_dispatcher(rx, orchestrator, cfg.workers);

        let service = Self {
            db,
            store,
            layout,
            queue,
        };
        (service, dispatcher)
    }

    /// Hand a staging request to the worker pool.
    pub fn request_stage(&self, cart_uid: &str, files: Vec<NewFile>) -> Result<(), QueueError> {
        info!(cart_uid, files = files.len(), "queueing staging request");
        self.queue.enqueue(StagingJob::Stage {
            cart_uid: cart_uid.to_string(),
            files,
        })
    }

    /// Status of the newest live cart for `cart_uid`.
    pub async fn cart_status(&self, cart_uid: &str) -> StoreResult<StatusReport> {
        let report = match self.store.find_latest_by_uid(cart_uid).await? {
            Some(cart) => StatusReport {
                status: cart.status.to_string(),
                error: cart.error,
            },
            None => StatusReport {
                status: CartStatus::Error.to_string(),
                error: Some(format!("No cart with uid {} found", cart_uid)),
            },
        };
        Ok(report)
    }

    /// Resolve what a download of `cart_uid` should return.
    pub async fn download(&self, cart_uid: &str) -> StoreResult<Download> {
        let Some(cart) = self.store.find_latest_by_uid(cart_uid).await? else {
            return Ok(Download::NotReady);
        };
        let (CartStatus::Ready, Some(bundle_path)) = (cart.status, cart.bundle_path) else {
            return Ok(Download::NotReady);
        };

        let bundle_dir = PathBuf::from(bundle_path);
        match fs::metadata(&bundle_dir).await {
            Ok(meta) if meta.is_dir() => Ok(Download::Ready {
                bundle_dir,
                arcname: cart.cart_uid,
            }),
            _ => {
                warn!(
                    cart_id = cart.id,
                    "ready cart is missing its bundle at {}",
                    bundle_dir.display()
                );
                Ok(Download::BundleMissing)
            }
        }
    }

    /// Remove every live cart for `cart_uid`, on disk and in the store.
    pub async fn delete_cart(&self, cart_uid: &str) -> StoreResult<DeleteOutcome> {
        let carts = self.store.list_live_by_uid(cart_uid).await?;
        if carts.is_empty() {
            return Ok(DeleteOutcome::NotFound);
        }

        let mut failed = false;
        for cart in &carts {
            match self.layout.remove_cart_tree(cart.id).await {
                Ok(()) => {
                    self.store.mark_deleted(cart.id).await?;
                    info!(cart_id = cart.id, cart_uid, "deleted cart");
                }
                Err(err) => {
                    warn!(cart_id = cart.id, cart_uid, "failed to delete cart tree: {}", err);
                    failed = true;
                }
            }
        }

        Ok(if failed {
            DeleteOutcome::Partial
        } else {
            DeleteOutcome::Deleted
        })
    }
}
