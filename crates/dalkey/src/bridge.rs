//! File-resolver bridge to the host process.
//!
//! The sandbox may run beside a parent frame that holds project files the
//! virtual FS does not. The bridge exposes that as two blocking calls,
//! `is_file` and `read_file`, used only during transpilation (evaluation
//! never falls back to I/O). Requests carry a correlation id over a duplex
//! byte channel; a dedicated reader thread pairs responses back to their
//! pending requests.

use dalkey_proto::{read_frame, write_frame, FsRequest, FsResponse};
use rustc_hash::FxHashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

/// Host-side file lookup used by the manager during transpilation.
pub trait FileResolver {
    /// Whether the host has a file at `path`.
    fn is_file(&self, path: &str) -> io::Result<bool>;

    /// The file's content, or `None` when the host does not have it.
    fn read_file(&self, path: &str) -> io::Result<Option<String>>;
}

/// An in-memory resolver for tests and single-process hosts.
#[derive(Debug, Clone, Default)]
pub struct StaticFileResolver {
    files: FxHashMap<String, String>,
}

impl StaticFileResolver {
    #[must_use]
    pub fn new(files: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            files: files.into_iter().collect(),
        }
    }
}

impl FileResolver for StaticFileResolver {
    fn is_file(&self, path: &str) -> io::Result<bool> {
        Ok(self.files.contains_key(path))
    }

    fn read_file(&self, path: &str) -> io::Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }
}

type PendingMap = Arc<Mutex<FxHashMap<u64, mpsc::Sender<FsResponse>>>>;

/// A [`FileResolver`] speaking the framed protocol over a duplex channel.
pub struct ProtocolFileResolver<W: Write> {
    writer: Mutex<W>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    _reader: thread::JoinHandle<()>,
}

impl<W: Write> ProtocolFileResolver<W> {
    /// Wrap the write half of a channel and spawn a reader thread over the
    /// read half. The thread exits when the channel closes.
    pub fn new<R>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(FxHashMap::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);

        let handle = thread::spawn(move || {
            let mut reader = reader;
            loop {
                match read_frame::<_, FsResponse>(&mut reader) {
                    Ok(response) => {
                        let sender = reader_pending.lock().ok().and_then(|mut map| map.remove(&response.i));
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(response);
                            }
                            None => warn!(id = response.i, "response with no pending request"),
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "file-resolver channel closed");
                        break;
                    }
                }
            }
            // Fail every in-flight and future call once the channel dies.
            reader_closed.store(true, Ordering::SeqCst);
            if let Ok(mut map) = reader_pending.lock() {
                map.clear();
            }
        });

        Self {
            writer: Mutex::new(writer),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            _reader: handle,
        }
    }

    fn call(&self, request: FsRequest) -> io::Result<FsResponse> {
        let id = request.i;
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "bridge poisoned"))?
            .insert(id, tx);

        let write_result = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "bridge poisoned"))?;
            write_frame(&mut *writer, &request)
        };
        if let Err(err) = write_result {
            if let Ok(mut map) = self.pending.lock() {
                map.remove(&id);
            }
            return Err(err);
        }

        if self.closed.load(Ordering::SeqCst) {
            if let Ok(mut map) = self.pending.lock() {
                map.remove(&id);
            }
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "file-resolver channel closed",
            ));
        }

        let response = rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "file-resolver channel closed")
        })?;

        if let Some(message) = response.error {
            return Err(io::Error::new(io::ErrorKind::Other, message));
        }
        Ok(response)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<W: Write> FileResolver for ProtocolFileResolver<W> {
    fn is_file(&self, path: &str) -> io::Result<bool> {
        let response = self.call(FsRequest::is_file(self.next_id(), path))?;
        Ok(response.found.unwrap_or(false))
    }

    fn read_file(&self, path: &str) -> io::Result<Option<String>> {
        let response = self.call(FsRequest::read_file(self.next_id(), path))?;
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dalkey_proto::FsMethod;
    use std::io::Cursor;

    /// One direction of an in-memory duplex channel.
    struct PipeReader {
        rx: mpsc::Receiver<Vec<u8>>,
        buf: Vec<u8>,
        pos: usize,
    }

    struct PipeWriter {
        tx: mpsc::Sender<Vec<u8>>,
    }

    fn pipe() -> (PipeReader, PipeWriter) {
        let (tx, rx) = mpsc::channel();
        (
            PipeReader {
                rx,
                buf: Vec::new(),
                pos: 0,
            },
            PipeWriter { tx },
        )
    }

    impl Read for PipeReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            while self.pos >= self.buf.len() {
                match self.rx.recv() {
                    Ok(chunk) => {
                        self.buf = chunk;
                        self.pos = 0;
                    }
                    Err(_) => return Ok(0),
                }
            }
            let n = out.len().min(self.buf.len() - self.pos);
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for PipeWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Spawn a host loop that answers each request with `respond`.
    fn spawn_host<F>(respond: F) -> (PipeReader, PipeWriter)
    where
        F: Fn(&FsRequest) -> FsResponse + Send + 'static,
    {
        let (host_rx, bridge_tx) = pipe();
        let (bridge_rx, host_tx) = pipe();

        thread::spawn(move || {
            let mut reader = host_rx;
            let mut writer = host_tx;
            while let Ok(request) = read_frame::<_, FsRequest>(&mut reader) {
                if write_frame(&mut writer, &respond(&request)).is_err() {
                    break;
                }
            }
        });

        (bridge_rx, bridge_tx)
    }

    #[test]
    fn test_is_file_round_trip() {
        let (rx, tx) = spawn_host(|request| {
            assert_eq!(request.m, FsMethod::IsFile);
            FsResponse::found(request.i, request.p == "/host/App.js")
        });
        let bridge = ProtocolFileResolver::new(rx, tx);

        assert!(bridge.is_file("/host/App.js").unwrap());
        assert!(!bridge.is_file("/host/ghost.js").unwrap());
    }

    #[test]
    fn test_read_file_round_trip_and_missing() {
        let (rx, tx) = spawn_host(|request| {
            if request.p == "/host/a.js" {
                FsResponse::content(request.i, "module.exports = 1;")
            } else {
                FsResponse::missing(request.i)
            }
        });
        let bridge = ProtocolFileResolver::new(rx, tx);

        assert_eq!(
            bridge.read_file("/host/a.js").unwrap().as_deref(),
            Some("module.exports = 1;")
        );
        assert_eq!(bridge.read_file("/host/ghost.js").unwrap(), None);
    }

    #[test]
    fn test_host_error_surfaces() {
        let (rx, tx) = spawn_host(|request| FsResponse::error(request.i, "permission denied"));
        let bridge = ProtocolFileResolver::new(rx, tx);

        let err = bridge.read_file("/host/secret").unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_closed_channel_is_broken_pipe() {
        let reader = Cursor::new(Vec::new());
        let (_rx, tx) = pipe();
        let bridge = ProtocolFileResolver::new(reader, tx);

        let err = bridge.is_file("/x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticFileResolver::new([(
            "/host/a.js".to_string(),
            "module.exports = 1;".to_string(),
        )]);
        assert!(resolver.is_file("/host/a.js").unwrap());
        assert!(!resolver.is_file("/host/b.js").unwrap());
        assert_eq!(
            resolver.read_file("/host/a.js").unwrap().as_deref(),
            Some("module.exports = 1;")
        );
    }
}
