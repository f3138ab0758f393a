//! Client side of the remote archive interface.
//!
//! The archive answers three requests per file id:
//! - `HEAD {url}/{id}`: metadata in response headers
//! - `POST {url}/{id}`: recall the file from tape onto the archive's disk tier
//! - `GET  {url}/{id}`: the file bytes
//!
//! Status is handed back as the archive's JSON status document so callers can
//! quote the raw response when it does not decode.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{
    Client, StatusCode,
    header::{CONTENT_LENGTH, HeaderMap, LAST_MODIFIED},
};
use serde_json::{Map, Value};
use std::{
    io::{self, ErrorKind},
    path::Path,
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

/// Storage tier the archive reports for files that can be read right away.
pub const DISK_MEDIA: &str = "disk";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive request for `{file}` failed: {source}")]
    Http {
        file: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("archive returned {status} for `{file}`")]
    Status { file: String, status: StatusCode },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The remote archive as seen by the staging pipeline.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Raw JSON status document for a file.
    async fn status(&self, file_name: &str) -> Result<String, ArchiveError>;

    /// Ask the archive to bring a file onto its disk tier.
    async fn recall(&self, file_name: &str) -> Result<(), ArchiveError>;

    /// Copy a file's bytes to `dest`, returning the number of bytes written.
    async fn pull(&self, file_name: &str, dest: &Path) -> Result<u64, ArchiveError>;
}

/// HTTP implementation of [`ArchiveClient`].
#[derive(Clone, Debug)]
pub struct HttpArchive {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpArchive {
    /// `timeout` bounds connecting and each read. Status and recall calls
    /// also get it as a whole-request deadline; a pull may run as long as
    /// bytes keep arriving.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn file_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url, file_name)
    }

    fn http_error(file_name: &str) -> impl FnOnce(reqwest::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Http {
            file: file_name.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ArchiveClient for HttpArchive {
    async fn status(&self, file_name: &str) -> Result<String, ArchiveError> {
        let resp = self
            .client
            .head(self.file_url(file_name))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::http_error(file_name))?;
        if !resp.status().is_success() {
            return Err(ArchiveError::Status {
                file: file_name.to_string(),
                status: resp.status(),
            });
        }
        Ok(status_document(file_name, resp.headers()).to_string())
    }

    async fn recall(&self, file_name: &str) -> Result<(), ArchiveError> {
        let resp = self
            .client
            .post(self.file_url(file_name))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::http_error(file_name))?;
        if !resp.status().is_success() {
            return Err(ArchiveError::Status {
                file: file_name.to_string(),
                status: resp.status(),
            });
        }
        Ok(())
    }

    async fn pull(&self, file_name: &str, dest: &Path) -> Result<u64, ArchiveError> {
        let resp = self
            .client
            .get(self.file_url(file_name))
            .send()
            .await
            .map_err(Self::http_error(file_name))?;
        if !resp.status().is_success() {
            return Err(ArchiveError::Status {
                file: file_name.to_string(),
                status: resp.status(),
            });
        }

        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "destination missing parent directory")
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        match write_stream(resp, &tmp_path).await {
            Ok(written) => {
                if let Err(err) = fs::rename(&tmp_path, dest).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ArchiveError::Io(err));
                }
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }
}

/// Stream a response body into `path`, syncing before returning.
async fn write_stream(resp: reqwest::Response, path: &Path) -> Result<u64, ArchiveError> {
    let url_file = resp.url().path().to_string();
    let mut file = fs::File::create(path).await?;
    let mut written: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| ArchiveError::Http {
            file: url_file.clone(),
            source,
        })?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Convert the archive's HEAD response headers into its JSON status document.
/// Headers the archive did not send are left out.
fn status_document(file_name: &str, headers: &HeaderMap) -> Value {
    let mut doc = Map::new();
    doc.insert("file".into(), Value::String(file_name.to_string()));

    let mapping: [(&str, &str); 6] = [
        ("filesize", CONTENT_LENGTH.as_str()),
        ("mtime", LAST_MODIFIED.as_str()),
        ("ctime", "x-pacifica-ctime"),
        ("bytes_per_level", "x-pacifica-bytes-per-level"),
        ("file_storage_media", "x-pacifica-file-storage-media"),
        ("message", "x-pacifica-messsage"),
    ];
    for (key, header) in mapping {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            doc.insert(key.into(), Value::String(value.to_string()));
        }
    }
    Value::Object(doc)
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(
        "Failed to decode json for file status with error: {source} Response received from the Archive is: {response}"
    )]
    Json {
        #[source]
        source: serde_json::Error,
        response: String,
    },
    #[error(
        "Failed to decode file {field} json with error: {reason} Response received from the Archive is: {response}"
    )]
    Field {
        field: &'static str,
        reason: String,
        response: String,
    },
}

/// The parts of an archive status document staging relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub size: u64,
    pub mtime: String,
    pub media: String,
}

impl ArchiveMetadata {
    /// Decode a status document. `filesize` may be a number or a numeric
    /// string; `mtime` and `file_storage_media` must be present.
    pub fn parse(response: &str) -> Result<Self, MetadataError> {
        let doc: Value = serde_json::from_str(response).map_err(|source| MetadataError::Json {
            source,
            response: response.to_string(),
        })?;
        let field_err = |field: &'static str, reason: String| MetadataError::Field {
            field,
            reason,
            response: response.to_string(),
        };

        let size = match doc.get("filesize") {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| field_err("size", format!("invalid size `{}`", n)))?,
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| field_err("size", format!("{} (`{}`)", e, s)))?,
            Some(other) => return Err(field_err("size", format!("unexpected value `{}`", other))),
            None => return Err(field_err("size", "missing field `filesize`".into())),
        };

        let mtime = match doc.get("mtime") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => return Err(field_err("mtime", format!("unexpected value `{}`", other))),
            None => return Err(field_err("mtime", "missing field `mtime`".into())),
        };

        let media = match doc.get("file_storage_media") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(field_err(
                    "storage media",
                    format!("unexpected value `{}`", other),
                ));
            }
            None => {
                return Err(field_err(
                    "storage media",
                    "missing field `file_storage_media`".into(),
                ));
            }
        };

        Ok(Self { size, mtime, media })
    }

    /// Whether the file can be pulled without waiting for a tape recall.
    pub fn on_disk(&self) -> bool {
        self.media == DISK_MEDIA
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parse_accepts_string_size() {
        let raw = json!({"filesize": "8", "mtime": "Sun, 06 Nov 1994 08:49:37 GMT", "file_storage_media": "disk"})
            .to_string();
        let meta = ArchiveMetadata::parse(&raw).unwrap();
        assert_eq!(meta.size, 8);
        assert!(meta.on_disk());
    }

    #[test]
    fn parse_reports_missing_filesize() {
        let raw = json!({"mtime": "1", "file_storage_media": "disk"}).to_string();
        let err = ArchiveMetadata::parse(&raw).unwrap_err().to_string();
        assert!(err.starts_with("Failed to decode file size json"), "{}", err);
        assert!(err.contains(&raw));
    }

    #[test]
    fn parse_rejects_non_json() {
        let err = ArchiveMetadata::parse("not json").unwrap_err();
        assert!(matches!(err, MetadataError::Json { .. }));
    }

    #[test]
    fn tape_media_is_not_on_disk() {
        let raw = json!({"filesize": 1, "mtime": 1, "file_storage_media": "tape"}).to_string();
        assert!(!ArchiveMetadata::parse(&raw).unwrap().on_disk());
    }

    #[tokio::test]
    async fn status_maps_headers_to_document() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-pacifica-messsage", "File was found")
                    .insert_header("x-pacifica-ctime", "Sun, 06 Nov 1994 08:49:37 GMT")
                    .insert_header("x-pacifica-bytes-per-level", "0")
                    .insert_header("x-pacifica-file-storage-media", "disk")
                    .insert_header("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT")
                    .set_body_string("blahblah"),
            )
            .mount(&server)
            .await;

        let archive = HttpArchive::new(server.uri(), Duration::from_secs(5)).unwrap();
        let raw = archive.status("1").await.unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["file"], "1");
        assert_eq!(doc["file_storage_media"], "disk");
        assert_eq!(doc["mtime"], "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(doc["message"], "File was found");
    }

    #[tokio::test]
    async fn pull_writes_body_to_destination() {
        let server = MockServer::start().await;
        let body = "This is the body of the file in the archive.";
        Mock::given(method("GET"))
            .and(path("/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("1");
        let archive = HttpArchive::new(server.uri(), Duration::from_secs(5)).unwrap();
        let written = archive.pull("1", &dest).await.unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn recall_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fakeFileName"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let archive = HttpArchive::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = archive.recall("fakeFileName").await.unwrap_err();
        assert!(matches!(err, ArchiveError::Status { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn slow_status_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/1"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let archive = HttpArchive::new(server.uri(), Duration::from_millis(300)).unwrap();
        let err = archive.status("1").await.unwrap_err();
        assert!(matches!(err, ArchiveError::Http { .. }), "{}", err);
    }

    /// Serve one response whose body trickles in over longer than the
    /// client timeout, with every gap well inside it.
    async fn trickle_server(chunks: usize, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", chunks * 10);
            socket.write_all(head.as_bytes()).await.unwrap();
            for _ in 0..chunks {
                tokio::time::sleep(gap).await;
                socket.write_all(&[b'x'; 10]).await.unwrap();
                socket.flush().await.unwrap();
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn long_pull_is_not_cut_off_while_data_flows() {
        let url = trickle_server(4, Duration::from_millis(300)).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("slow");

        let archive = HttpArchive::new(url, Duration::from_millis(800)).unwrap();
        let written = archive.pull("slow", &dest).await.unwrap();

        assert_eq!(written, 40);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![b'x'; 40]);
    }
}
