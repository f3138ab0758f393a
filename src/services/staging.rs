//! StagingOrchestrator: moves requested files from the archive onto the
//! staging volume.
//!
//! Per-file failures never escape this module: they are written onto the file
//! row and surface to clients only through cart status. Only store failures
//! (we cannot record anything) are returned to the caller.

use crate::{
    config::AppConfig,
    models::{
        cart::Cart,
        file::{CartFile, FileStatus},
    },
    services::{
        archive::{ArchiveClient, ArchiveMetadata},
        bundler::Bundler,
        cart_store::{CartStore, NewFile, StoreError},
        eviction::{EvictionError, Evictor},
        layout::CartLayout,
        queue::{StagingJob, StagingQueue},
    },
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const NOT_ENOUGH_SPACE_MESSAGE: &str = "Not enough space to download file";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to one file on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Staged,
    Failed,
    /// Still on tape; a retry has been scheduled.
    Waiting,
    /// Nothing to do: the file was already terminal or its cart is gone.
    Skipped,
}

pub struct StagingOrchestrator {
    store: CartStore,
    layout: CartLayout,
    archive: Arc<dyn ArchiveClient>,
    evictor: Evictor,
    bundler: Bundler,
    queue: StagingQueue,
    retry_delay: Duration,
}

impl StagingOrchestrator {
    pub fn new(
        cfg: &AppConfig,
        store: CartStore,
        layout: CartLayout,
        archive: Arc<dyn ArchiveClient>,
        evictor: Evictor,
        queue: StagingQueue,
    ) -> Self {
        let bundler = Bundler::new(store.clone(), layout.clone());
        Self {
            store,
            layout,
            archive,
            evictor,
            bundler,
            queue,
            retry_delay: cfg.stage_retry(),
        }
    }

    /// Entry point for the dispatcher.
    pub async fn run(&self, job: StagingJob) {
        let result = match job {
            StagingJob::Stage { cart_uid, files } => {
                self.stage_files(&cart_uid, &files).await.map(|_| ())
            }
            StagingJob::Pull { cart_id, file_id } => {
                self.pull_file(cart_id, file_id).await.map(|_| ())
            }
        };
        if let Err(err) = result {
            error!("staging job failed: {}", err);
        }
    }

    /// Record a staging request against a fresh cart and process each file
    /// in turn, re-checking readiness after every one.
    pub async fn stage_files(&self, cart_uid: &str, files: &[NewFile]) -> Result<Cart, StagingError> {
        let (cart, rows) = self.store.create_cart_with_files(cart_uid, files).await?;
        info!(cart_id = cart.id, cart_uid, files = rows.len(), "staging cart");

        for file in &rows {
            // Deletion or eviction may land while earlier files are pulled.
            let Some(current) = self.store.get_cart(cart.id).await? else {
                break;
            };
            if !current.is_live() {
                debug!(cart_id = cart.id, "cart deleted mid-request, stopping");
                break;
            }
            self.process_file(&current, file).await?;
        }
        if rows.is_empty() {
            self.bundler.prepare_bundle(cart.id).await?;
        }
        Ok(cart)
    }

    /// Process one file of an existing cart. Safe to call repeatedly: a file
    /// that is already terminal only re-triggers the readiness check.
    pub async fn pull_file(&self, cart_id: i64, file_id: i64) -> Result<FileOutcome, StagingError> {
        let Some(cart) = self.store.get_cart(cart_id).await? else {
            debug!(cart_id, "cart no longer exists, skipping file {}", file_id);
            return Ok(FileOutcome::Skipped);
        };
        let file = self
            .store
            .get_file(file_id)
            .await?
            .ok_or(StoreError::FileNotFound(file_id))?;
        self.process_file(&cart, &file).await
    }

    async fn process_file(&self, cart: &Cart, file: &CartFile) -> Result<FileOutcome, StagingError> {
        if !cart.is_live() {
            debug!(cart_id = cart.id, file_id = file.id, "cart deleted, skipping file");
            return Ok(FileOutcome::Skipped);
        }
        if file.status.is_terminal() {
            self.bundler.prepare_bundle(cart.id).await?;
            return Ok(FileOutcome::Skipped);
        }

        let outcome = self.stage_one(cart, file).await?;
        if outcome != FileOutcome::Waiting {
            self.bundler.prepare_bundle(cart.id).await?;
        }
        Ok(outcome)
    }

    async fn stage_one(&self, cart: &Cart, file: &CartFile) -> Result<FileOutcome, StagingError> {
        let response = match self.archive.status(&file.file_name).await {
            Ok(response) => response,
            Err(err) => {
                let msg = format!("Failed to get file status from the Archive with error: {}", err);
                return self.fail(file, &msg).await;
            }
        };

        let meta = match ArchiveMetadata::parse(&response) {
            Ok(meta) => meta,
            Err(err) => return self.fail(file, &err.to_string()).await,
        };

        if !meta.on_disk() {
            debug!(
                cart_id = cart.id,
                file = %file.file_name,
                media = %meta.media,
                "file not on disk yet, requesting recall"
            );
            if let Err(err) = self.archive.recall(&file.file_name).await {
                warn!(file = %file.file_name, "archive recall request failed: {}", err);
            }
            self.queue.enqueue_after(
                StagingJob::Pull {
                    cart_id: cart.id,
                    file_id: file.id,
                },
                self.retry_delay,
            );
            return Ok(FileOutcome::Waiting);
        }

        let dest = self.layout.file_path(cart, file);
        if let Err(err) = self.layout.create_parent_dirs(&dest).await {
            let msg = format!("Failed directory create with error: {}", err);
            return self.fail(file, &msg).await;
        }

        match self.evictor.ensure_space(cart.id, meta.size).await {
            Ok(true) => {}
            Ok(false) => return self.fail(file, NOT_ENOUGH_SPACE_MESSAGE).await,
            Err(EvictionError::Space(err)) => {
                let msg = format!("Failed to get available file space with error: {}", err);
                return self.fail(file, &msg).await;
            }
            Err(EvictionError::Store(err)) => return Err(err.into()),
        }

        if !self.still_live(cart).await? {
            return Ok(FileOutcome::Skipped);
        }

        match self.archive.pull(&file.file_name, &dest).await {
            Ok(bytes) => {
                if !self.still_live(cart).await? {
                    return Ok(FileOutcome::Skipped);
                }
                self.store
                    .set_file_status(file, FileStatus::Staged, None)
                    .await?;
                debug!(
                    cart_id = cart.id,
                    file = %file.file_name,
                    bytes,
                    "staged file at {}",
                    dest.display()
                );
                Ok(FileOutcome::Staged)
            }
            Err(err) => {
                let msg = format!("Failed to pull file from the Archive with error: {}", err);
                self.fail(file, &msg).await
            }
        }
    }

    /// Re-read the cart before touching its tree. A cart that was deleted
    /// in the meantime has whatever this pass created on disk removed again,
    /// since nothing else will reclaim it.
    async fn still_live(&self, cart: &Cart) -> Result<bool, StagingError> {
        let live = self
            .store
            .get_cart(cart.id)
            .await?
            .is_some_and(|current| current.is_live());
        if !live {
            debug!(cart_id = cart.id, "cart deleted while staging, discarding its tree");
            if let Err(err) = self.layout.remove_cart_tree(cart.id).await {
                warn!(cart_id = cart.id, "failed to discard tree of deleted cart: {}", err);
            }
        }
        Ok(live)
    }

    async fn fail(&self, file: &CartFile, message: &str) -> Result<FileOutcome, StagingError> {
        warn!(
            cart_id = file.cart_id,
            file = %file.file_name,
            "file failed to stage: {}",
            message
        );
        self.store
            .set_file_status(file, FileStatus::Error, Some(message))
            .await?;
        Ok(FileOutcome::Failed)
    }
}
