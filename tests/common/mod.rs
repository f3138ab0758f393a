//! Shared harness for cart integration tests: a temporary volume and
//! database, an in-memory archive, and a free-space probe whose capacity the
//! test controls.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode},
};
use cart_server::{
    config::AppConfig,
    models::cart::Cart,
    routes,
    services::{
        archive::{ArchiveClient, ArchiveError},
        cart_service::CartService,
        cart_store::CartStore,
        layout::CartLayout,
        space::{SpaceError, SpaceProbe, path_size},
    },
};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tower::ServiceExt;

/// One file known to the fake archive.
#[derive(Clone, Debug)]
pub struct ArchiveFile {
    /// Raw status document returned by `status`.
    pub status: String,
    pub bytes: Vec<u8>,
    /// Status document to switch to once a recall has been requested.
    pub after_recall: Option<String>,
}

impl ArchiveFile {
    /// A file on the disk tier whose reported size matches its bytes.
    pub fn on_disk(bytes: &[u8]) -> Self {
        Self::reporting(bytes, bytes.len() as u64, "disk")
    }

    /// A file whose status reports `size` bytes on `media`.
    pub fn reporting(bytes: &[u8], size: u64, media: &str) -> Self {
        Self {
            status: json!({
                "filesize": size.to_string(),
                "mtime": "Sun, 06 Nov 1994 08:49:37 GMT",
                "file_storage_media": media,
            })
            .to_string(),
            bytes: bytes.to_vec(),
            after_recall: None,
        }
    }
}

#[derive(Default)]
pub struct FakeArchive {
    files: Mutex<HashMap<String, ArchiveFile>>,
    recalls: Mutex<Vec<String>>,
    status_delay_ms: AtomicU64,
}

impl FakeArchive {
    pub fn insert(&self, id: &str, file: ArchiveFile) {
        self.files.lock().unwrap().insert(id.to_string(), file);
    }

    /// Make every status call take `delay`, to widen race windows.
    pub fn set_status_delay(&self, delay: Duration) {
        self.status_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn recalls(&self) -> Vec<String> {
        self.recalls.lock().unwrap().clone()
    }

    fn get(&self, id: &str) -> Result<ArchiveFile, ArchiveError> {
        self.files.lock().unwrap().get(id).cloned().ok_or_else(|| {
            ArchiveError::Io(io::Error::new(io::ErrorKind::NotFound, format!("no file {}", id)))
        })
    }
}

#[async_trait]
impl ArchiveClient for FakeArchive {
    async fn status(&self, file_name: &str) -> Result<String, ArchiveError> {
        let delay = self.status_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self.get(file_name)?.status)
    }

    async fn recall(&self, file_name: &str) -> Result<(), ArchiveError> {
        self.recalls.lock().unwrap().push(file_name.to_string());
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.get_mut(file_name) {
            if let Some(next) = file.after_recall.take() {
                file.status = next;
            }
        }
        Ok(())
    }

    async fn pull(&self, file_name: &str, dest: &Path) -> Result<u64, ArchiveError> {
        let file = self.get(file_name)?;
        tokio::fs::write(dest, &file.bytes).await?;
        Ok(file.bytes.len() as u64)
    }
}

/// Free space = capacity minus whatever currently sits on the volume, so
/// evicting a cart really frees room.
pub struct FakeSpace {
    volume: PathBuf,
    capacity: AtomicU64,
    failing: std::sync::atomic::AtomicBool,
}

impl FakeSpace {
    pub fn new(volume: &Path, capacity: u64) -> Self {
        Self {
            volume: volume.to_path_buf(),
            capacity: AtomicU64::new(capacity),
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn used(&self) -> u64 {
        path_size(&self.volume).unwrap_or(0)
    }
}

#[async_trait]
impl SpaceProbe for FakeSpace {
    async fn free_bytes(&self) -> Result<u64, SpaceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SpaceError::OsQueryFailed {
                path: self.volume.display().to_string(),
                source: io::Error::other("simulated statvfs failure"),
            });
        }
        Ok(self.capacity.load(Ordering::SeqCst).saturating_sub(self.used()))
    }
}

pub struct TestServer {
    pub dir: TempDir,
    pub cfg: AppConfig,
    pub service: CartService,
    pub router: Router,
    pub archive: Arc<FakeArchive>,
    pub space: Arc<FakeSpace>,
}

impl TestServer {
    /// A server with ample free space and no eviction grace period.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("volume");
        std::fs::create_dir_all(&volume).unwrap();

        let mut cfg = AppConfig {
            volume_path: volume.clone(),
            database_url: format!("sqlite://{}", dir.path().join("cart.db").display()),
            lru_buffer_secs: 0,
            stage_retry_secs: 0,
            workers: 2,
            ..AppConfig::default()
        };
        tweak(&mut cfg);

        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("cart.db"))
            .create_if_missing(true);
        let db = Arc::new(
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await
                .unwrap(),
        );
        CartStore::new(db.clone()).migrate().await.unwrap();

        let archive = Arc::new(FakeArchive::default());
        let space = Arc::new(FakeSpace::new(&volume, u64::MAX));
        let (service, _dispatcher) =
            CartService::start(&cfg, db, archive.clone(), space.clone());
        let router = routes::routes::routes().with_state(service.clone());

        Self {
            dir,
            cfg,
            service,
            router,
            archive,
            space,
        }
    }

    pub fn store(&self) -> &CartStore {
        &self.service.store
    }

    pub fn layout(&self) -> CartLayout {
        CartLayout::new(self.cfg.volume_path.clone())
    }

    pub async fn request(&self, method: &str, uri: &str, body: Option<String>) -> Response<Body> {
        let body = body.map(Body::from).unwrap_or_else(Body::empty);
        let request = Request::builder().method(method).uri(uri).body(body).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Send a request and decode the JSON body (Null when empty).
    pub async fn json(&self, method: &str, uri: &str, body: Option<String>) -> (StatusCode, serde_json::Value) {
        let response = self.request(method, uri, body).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// POST a staging request for `(id, path)` pairs.
    pub async fn stage(&self, uid: &str, files: &[(&str, &str)]) -> StatusCode {
        let fileids: Vec<_> = files
            .iter()
            .map(|(id, path)| json!({ "id": id, "path": path }))
            .collect();
        let body = json!({ "fileids": fileids }).to_string();
        self.request("POST", &format!("/{}", uid), Some(body)).await.status()
    }

    /// Poll until the newest live cart for `uid` leaves `processing`.
    pub async fn wait_until_settled(&self, uid: &str) -> Cart {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(cart) = self.store().find_latest_by_uid(uid).await.unwrap() {
                if cart.status.as_str() != "processing" {
                    return cart;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("cart {} did not settle in time", uid);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until a cart for `uid` newer than `after_id` has settled.
    pub async fn wait_for_new_cart(&self, uid: &str, after_id: i64) -> Cart {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(cart) = self.store().find_latest_by_uid(uid).await.unwrap() {
                if cart.id > after_id && cart.status.as_str() != "processing" {
                    return cart;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("no new cart for {} settled in time", uid);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
