//! Streaming tar delivery of a bundle directory.
//!
//! A blocking producer serialises the tree with `tar::Builder` into one end of
//! a bounded in-process pipe; the response body reads the other end in
//! `BLOCK_SIZE` chunks. Memory use is bounded by the pipe and one chunk, and
//! no combined archive is ever written to disk.
//!
//! If the producer fails part way (for instance the cart is deleted while it
//! is being read) no end-of-archive trailer is written and the stream ends
//! with an error, which aborts the chunked response. Headers have already
//! gone out by then, so truncation is the only signal the client gets.

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, warn};

/// Size of each chunk handed to the response, and of the pipe buffer.
pub const BLOCK_SIZE: usize = 1 << 20;

/// Stream `bundle_dir` as an uncompressed tar whose single top-level entry is
/// named `arcname`.
///
/// The last item is an error when the producer failed. Must be called from
/// within a Tokio runtime.
pub fn stream_bundle(
    bundle_dir: PathBuf,
    arcname: String,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let (writer, reader) = tokio::io::duplex(BLOCK_SIZE);
    let bridge = SyncIoBridge::new(writer);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        // The bridge is dropped inside write_tar, so the reader sees EOF
        // before the result is sent.
        let result = write_tar(bridge, &bundle_dir, &arcname);
        match &result {
            Ok(()) => debug!("finished streaming bundle {}", bundle_dir.display()),
            Err(err) => warn!(
                "bundle stream for {} ended early: {}",
                bundle_dir.display(),
                err
            ),
        }
        let _ = done_tx.send(result);
    });

    let outcome = stream::once(done_rx).filter_map(|result| async move {
        match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(Err(err)),
            Err(_) => Some(Err(io::Error::other("bundle producer exited without a result"))),
        }
    });

    ReaderStream::with_capacity(reader, BLOCK_SIZE).chain(outcome)
}

/// Write a tar of `dir` (renamed to `arcname`) into `writer` and finish the
/// archive trailer.
///
/// On error the writer is poisoned before the builder drops, so a failed
/// archive never carries an end-of-archive marker.
pub fn write_tar<W: Write>(writer: W, dir: &Path, arcname: &str) -> io::Result<()> {
    let mut builder = tar::Builder::new(TarSink::new(writer));
    builder.follow_symlinks(false);
    if let Err(err) = builder.append_dir_all(arcname, dir) {
        builder.get_mut().poison();
        return Err(err);
    }
    let mut sink = builder.into_inner()?;
    sink.flush()
}

/// Writer that refuses all output once poisoned.
struct TarSink<W> {
    inner: W,
    poisoned: bool,
}

impl<W> TarSink<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            poisoned: false,
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl<W: Write> Write for TarSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.poisoned {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "bundle archive aborted"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Ok(());
        }
        self.inner.flush()
    }
}
