//! Event-source loop
//!
//! Long-lived sources (listeners, open connections, bound datagram sockets)
//! outlive the node that opened them. The executor owns a single handle
//! table; reader tasks push incoming events into per-handle queues and
//! `event_poll` nodes consume them first-come. Handles are plain integers
//! that travel through the plan as ordinary int results.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use blueprint_core::Value;

use crate::outcome::OpError;

pub type HandleId = u64;

/// One entry in a handle's event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Data {
        bytes: Vec<u8>,
        peer: Option<String>,
    },
    Accept {
        child: HandleId,
        peer: Option<String>,
    },
    Closed,
    Error {
        message: String,
    },
}

impl EventRecord {
    /// The wire shape handed back from `event_poll`:
    /// `{type: "data"|"accept"|"closed"|"error", data: {...}}`.
    pub fn into_value(self) -> Value {
        match self {
            EventRecord::Data { bytes, peer } => Value::record([
                ("type", Value::String("data".into())),
                (
                    "data",
                    Value::record([
                        ("bytes", Value::Bytes(bytes)),
                        ("peer", peer.map(Value::String).unwrap_or(Value::Null)),
                    ]),
                ),
            ]),
            EventRecord::Accept { child, peer } => Value::record([
                ("type", Value::String("accept".into())),
                (
                    "data",
                    Value::record([
                        ("handle", Value::Int(child as i64)),
                        ("peer", peer.map(Value::String).unwrap_or(Value::Null)),
                    ]),
                ),
            ]),
            EventRecord::Closed => Value::record([
                ("type", Value::String("closed".into())),
                ("data", Value::record([])),
            ]),
            EventRecord::Error { message } => Value::record([
                ("type", Value::String("error".into())),
                ("data", Value::record([("message", Value::String(message))])),
            ]),
        }
    }
}

enum SourceWriter {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
    /// Listeners accept; they take no writes.
    Listener,
}

struct SourceEntry {
    queue: VecDeque<EventRecord>,
    writer: Option<SourceWriter>,
    reader: Option<JoinHandle<()>>,
    local_addr: Option<String>,
    /// Set by an explicit close; later operations on the handle fail with a
    /// `closed` error.
    closed: bool,
}

impl SourceEntry {
    fn new(writer: SourceWriter, local_addr: Option<String>) -> Self {
        Self {
            queue: VecDeque::new(),
            writer: Some(writer),
            reader: None,
            local_addr,
            closed: false,
        }
    }
}

/// Executor-owned registry of live event sources.
pub struct EventTable {
    sources: Mutex<HashMap<HandleId, SourceEntry>>,
    notify: Notify,
    next_handle: AtomicU64,
    chunk_bytes: usize,
}

impl EventTable {
    pub fn new(chunk_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            sources: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            next_handle: AtomicU64::new(1),
            chunk_bytes: chunk_bytes.max(1),
        })
    }

    fn alloc(&self) -> HandleId {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    async fn push(&self, handle: HandleId, record: EventRecord) {
        let mut sources = self.sources.lock().await;
        if let Some(entry) = sources.get_mut(&handle) {
            if !entry.closed {
                entry.queue.push_back(record);
                drop(sources);
                self.notify.notify_waiters();
            }
        }
    }

    /// Local address a source actually bound (useful when the script asked
    /// for port 0).
    pub async fn local_addr(&self, handle: HandleId) -> Option<String> {
        let sources = self.sources.lock().await;
        sources.get(&handle).and_then(|e| e.local_addr.clone())
    }

    // ---- opening sources ---------------------------------------------

    pub async fn open_tcp_connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<HandleId, OpError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| OpError::operation(format!("tcp connect {}:{} failed: {}", host, port, e)))?;
        Ok(self.register_tcp_stream(stream).await)
    }

    pub async fn open_tcp_listen(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<HandleId, OpError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| OpError::operation(format!("tcp listen {}:{} failed: {}", host, port, e)))?;
        let local_addr = listener.local_addr().ok().map(|a| a.to_string());

        let handle = self.alloc();
        {
            let mut sources = self.sources.lock().await;
            sources.insert(handle, SourceEntry::new(SourceWriter::Listener, local_addr));
        }

        let table = Arc::clone(self);
        let reader = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let child = table.register_tcp_stream(stream).await;
                        table
                            .push(
                                handle,
                                EventRecord::Accept {
                                    child,
                                    peer: Some(peer.to_string()),
                                },
                            )
                            .await;
                    }
                    Err(e) => {
                        table
                            .push(
                                handle,
                                EventRecord::Error {
                                    message: format!("accept failed: {}", e),
                                },
                            )
                            .await;
                        break;
                    }
                }
            }
        });
        self.attach_reader(handle, reader).await;
        Ok(handle)
    }

    pub async fn open_udp(self: &Arc<Self>, host: &str, port: u16) -> Result<HandleId, OpError> {
        let socket = UdpSocket::bind((host, port))
            .await
            .map_err(|e| OpError::operation(format!("udp bind {}:{} failed: {}", host, port, e)))?;
        let local_addr = socket.local_addr().ok().map(|a| a.to_string());
        let socket = Arc::new(socket);

        let handle = self.alloc();
        {
            let mut sources = self.sources.lock().await;
            sources.insert(
                handle,
                SourceEntry::new(SourceWriter::Udp(Arc::clone(&socket)), local_addr),
            );
        }

        let table = Arc::clone(self);
        let chunk = self.chunk_bytes;
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; chunk];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        table
                            .push(
                                handle,
                                EventRecord::Data {
                                    bytes: buf[..n].to_vec(),
                                    peer: Some(peer.to_string()),
                                },
                            )
                            .await;
                    }
                    Err(e) => {
                        table
                            .push(
                                handle,
                                EventRecord::Error {
                                    message: format!("udp recv failed: {}", e),
                                },
                            )
                            .await;
                        break;
                    }
                }
            }
        });
        self.attach_reader(handle, reader).await;
        Ok(handle)
    }

    #[cfg(unix)]
    pub async fn open_unix_connect(self: &Arc<Self>, path: &str) -> Result<HandleId, OpError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| OpError::operation(format!("unix connect {} failed: {}", path, e)))?;
        Ok(self.register_unix_stream(stream).await)
    }

    #[cfg(unix)]
    pub async fn open_unix_listen(self: &Arc<Self>, path: &str) -> Result<HandleId, OpError> {
        let listener = UnixListener::bind(path)
            .map_err(|e| OpError::operation(format!("unix listen {} failed: {}", path, e)))?;

        let handle = self.alloc();
        {
            let mut sources = self.sources.lock().await;
            sources.insert(
                handle,
                SourceEntry::new(SourceWriter::Listener, Some(path.to_string())),
            );
        }

        let table = Arc::clone(self);
        let reader = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let child = table.register_unix_stream(stream).await;
                        table
                            .push(handle, EventRecord::Accept { child, peer: None })
                            .await;
                    }
                    Err(e) => {
                        table
                            .push(
                                handle,
                                EventRecord::Error {
                                    message: format!("accept failed: {}", e),
                                },
                            )
                            .await;
                        break;
                    }
                }
            }
        });
        self.attach_reader(handle, reader).await;
        Ok(handle)
    }

    async fn register_tcp_stream(self: &Arc<Self>, stream: TcpStream) -> HandleId {
        let local_addr = stream.local_addr().ok().map(|a| a.to_string());
        let (mut read_half, write_half) = stream.into_split();

        let handle = self.alloc();
        {
            let mut sources = self.sources.lock().await;
            sources.insert(
                handle,
                SourceEntry::new(SourceWriter::Tcp(write_half), local_addr),
            );
        }

        let table = Arc::clone(self);
        let chunk = self.chunk_bytes;
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; chunk];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        table.push(handle, EventRecord::Closed).await;
                        break;
                    }
                    Ok(n) => {
                        table
                            .push(
                                handle,
                                EventRecord::Data {
                                    bytes: buf[..n].to_vec(),
                                    peer: None,
                                },
                            )
                            .await;
                    }
                    Err(e) => {
                        table
                            .push(
                                handle,
                                EventRecord::Error {
                                    message: format!("read failed: {}", e),
                                },
                            )
                            .await;
                        break;
                    }
                }
            }
        });
        self.attach_reader(handle, reader).await;
        handle
    }

    #[cfg(unix)]
    async fn register_unix_stream(self: &Arc<Self>, stream: UnixStream) -> HandleId {
        let (mut read_half, write_half) = stream.into_split();

        let handle = self.alloc();
        {
            let mut sources = self.sources.lock().await;
            sources.insert(handle, SourceEntry::new(SourceWriter::Unix(write_half), None));
        }

        let table = Arc::clone(self);
        let chunk = self.chunk_bytes;
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; chunk];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        table.push(handle, EventRecord::Closed).await;
                        break;
                    }
                    Ok(n) => {
                        table
                            .push(
                                handle,
                                EventRecord::Data {
                                    bytes: buf[..n].to_vec(),
                                    peer: None,
                                },
                            )
                            .await;
                    }
                    Err(e) => {
                        table
                            .push(
                                handle,
                                EventRecord::Error {
                                    message: format!("read failed: {}", e),
                                },
                            )
                            .await;
                        break;
                    }
                }
            }
        });
        self.attach_reader(handle, reader).await;
        handle
    }

    async fn attach_reader(&self, handle: HandleId, reader: JoinHandle<()>) {
        let mut sources = self.sources.lock().await;
        match sources.get_mut(&handle) {
            // Entry may already be gone if the table shut down mid-open.
            Some(entry) => entry.reader = Some(reader),
            None => reader.abort(),
        }
    }

    // ---- operations on handles ---------------------------------------

    /// Push bytes to the source. UDP requires an explicit destination.
    pub async fn write(
        &self,
        handle: HandleId,
        bytes: &[u8],
        dest: Option<(String, u16)>,
    ) -> Result<usize, OpError> {
        let mut sources = self.sources.lock().await;
        let entry = sources
            .get_mut(&handle)
            .ok_or_else(|| OpError::operation(format!("unknown event handle {}", handle)))?;
        if entry.closed {
            return Err(OpError::closed(format!("event handle {} is closed", handle)));
        }
        match entry.writer.as_mut() {
            Some(SourceWriter::Tcp(write_half)) => write_half
                .write_all(bytes)
                .await
                .map(|_| bytes.len())
                .map_err(|e| OpError::operation(format!("write failed: {}", e))),
            #[cfg(unix)]
            Some(SourceWriter::Unix(write_half)) => write_half
                .write_all(bytes)
                .await
                .map(|_| bytes.len())
                .map_err(|e| OpError::operation(format!("write failed: {}", e))),
            Some(SourceWriter::Udp(socket)) => {
                let (host, port) = dest.ok_or_else(|| {
                    OpError::operation("udp write requires a destination host and port")
                })?;
                socket
                    .send_to(bytes, (host.as_str(), port))
                    .await
                    .map_err(|e| OpError::operation(format!("udp send failed: {}", e)))
            }
            Some(SourceWriter::Listener) => {
                Err(OpError::operation("cannot write to a listener handle"))
            }
            None => Err(OpError::closed(format!("event handle {} is closed", handle))),
        }
    }

    /// Await the first queued event across `handles`. `None` timeout waits
    /// indefinitely; an expired timeout yields `Ok(None)`, which the driver
    /// surfaces as `Null` (a timeout is not a failure). Events are consumed
    /// by whichever poll reaches them first; there is no fanout.
    pub async fn poll(
        &self,
        handles: &[HandleId],
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, OpError> {
        let wait = async {
            loop {
                // Register for wakeups before checking the queues so a push
                // that lands in between is not lost.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(record) = self.try_pop(handles).await? {
                    return Ok(Some(record.into_value()));
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => Ok(None),
            },
            None => wait.await,
        }
    }

    async fn try_pop(&self, handles: &[HandleId]) -> Result<Option<EventRecord>, OpError> {
        let mut sources = self.sources.lock().await;
        for handle in handles {
            let entry = sources
                .get_mut(handle)
                .ok_or_else(|| OpError::operation(format!("unknown event handle {}", handle)))?;
            if entry.closed {
                return Err(OpError::closed(format!("event handle {} is closed", handle)));
            }
            if let Some(record) = entry.queue.pop_front() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Tear the source down. The entry stays in the table so later
    /// operations fail with a `closed` error rather than `unknown handle`.
    pub async fn close(&self, handle: HandleId) -> Result<(), OpError> {
        let mut sources = self.sources.lock().await;
        let entry = sources
            .get_mut(&handle)
            .ok_or_else(|| OpError::operation(format!("unknown event handle {}", handle)))?;
        if entry.closed {
            return Err(OpError::closed(format!("event handle {} is closed", handle)));
        }
        entry.closed = true;
        entry.queue.clear();
        entry.writer = None;
        if let Some(reader) = entry.reader.take() {
            reader.abort();
        }
        Ok(())
    }

    /// Release every handle; called when the owning plan completes or is
    /// cancelled.
    pub async fn shutdown(&self) {
        let mut sources = self.sources.lock().await;
        for entry in sources.values_mut() {
            if let Some(reader) = entry.reader.take() {
                reader.abort();
            }
            entry.writer = None;
            entry.closed = true;
            entry.queue.clear();
        }
        sources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> usize {
        64 * 1024
    }

    fn field<'a>(value: &'a Value, name: &str) -> &'a Value {
        match value {
            Value::Struct(fields) => fields.get(name).expect("field"),
            other => panic!("expected struct, got {:?}", other),
        }
    }

    #[test]
    fn test_listener_accept_and_echo_round_trip() {
        tokio_test::block_on(async {
            let table = EventTable::new(chunk());
            let listener = table.open_tcp_listen("127.0.0.1", 0).await.expect("listen");
            let addr = table.local_addr(listener).await.expect("addr");
            let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

            let client = table
                .open_tcp_connect("127.0.0.1", port)
                .await
                .expect("connect");

            let accept = table
                .poll(&[listener], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("accept event");
            assert_eq!(field(&accept, "type"), &Value::String("accept".into()));
            let child = match field(field(&accept, "data"), "handle") {
                Value::Int(n) => *n as HandleId,
                other => panic!("expected int handle, got {:?}", other),
            };

            table
                .write(client, b"ping", None)
                .await
                .expect("client write");
            let data = table
                .poll(&[child], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("data event");
            assert_eq!(field(&data, "type"), &Value::String("data".into()));
            assert_eq!(
                field(field(&data, "data"), "bytes"),
                &Value::Bytes(b"ping".to_vec())
            );

            table.write(child, b"pong", None).await.expect("echo write");
            let reply = table
                .poll(&[client], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("reply event");
            assert_eq!(
                field(field(&reply, "data"), "bytes"),
                &Value::Bytes(b"pong".to_vec())
            );

            table.shutdown().await;
        });
    }

    #[test]
    fn test_poll_timeout_yields_none() {
        tokio_test::block_on(async {
            let table = EventTable::new(chunk());
            let listener = table.open_tcp_listen("127.0.0.1", 0).await.expect("listen");
            let polled = table
                .poll(&[listener], Some(Duration::from_millis(50)))
                .await
                .expect("poll");
            assert!(polled.is_none());
            table.shutdown().await;
        });
    }

    #[test]
    fn test_remote_close_produces_closed_event() {
        tokio_test::block_on(async {
            let table = EventTable::new(chunk());
            let listener = table.open_tcp_listen("127.0.0.1", 0).await.expect("listen");
            let addr = table.local_addr(listener).await.expect("addr");
            let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

            let client = table
                .open_tcp_connect("127.0.0.1", port)
                .await
                .expect("connect");
            let accept = table
                .poll(&[listener], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("accept");
            let child = match field(field(&accept, "data"), "handle") {
                Value::Int(n) => *n as HandleId,
                other => panic!("expected int handle, got {:?}", other),
            };

            table.close(child).await.expect("close server side");
            let event = table
                .poll(&[client], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("event");
            assert_eq!(field(&event, "type"), &Value::String("closed".into()));

            table.shutdown().await;
        });
    }

    #[test]
    fn test_operations_on_closed_handle_fail_with_closed_kind() {
        tokio_test::block_on(async {
            let table = EventTable::new(chunk());
            let listener = table.open_tcp_listen("127.0.0.1", 0).await.expect("listen");
            table.close(listener).await.expect("close");

            let err = table
                .poll(&[listener], Some(Duration::from_millis(10)))
                .await
                .expect_err("closed handle");
            assert_eq!(err.kind, crate::outcome::OpErrorKind::Closed);

            let err = table.write(listener, b"x", None).await.expect_err("write");
            assert_eq!(err.kind, crate::outcome::OpErrorKind::Closed);

            let err = table.close(listener).await.expect_err("double close");
            assert_eq!(err.kind, crate::outcome::OpErrorKind::Closed);
        });
    }

    #[test]
    fn test_udp_datagram_round_trip() {
        tokio_test::block_on(async {
            let table = EventTable::new(chunk());
            let a = table.open_udp("127.0.0.1", 0).await.expect("bind a");
            let b = table.open_udp("127.0.0.1", 0).await.expect("bind b");
            let b_addr = table.local_addr(b).await.expect("addr");
            let b_port: u16 = b_addr.rsplit(':').next().unwrap().parse().unwrap();

            let sent = table
                .write(a, b"hello", Some(("127.0.0.1".to_string(), b_port)))
                .await
                .expect("send");
            assert_eq!(sent, 5);

            let event = table
                .poll(&[b], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("datagram");
            assert_eq!(
                field(field(&event, "data"), "bytes"),
                &Value::Bytes(b"hello".to_vec())
            );
            match field(field(&event, "data"), "peer") {
                Value::String(peer) => assert!(peer.starts_with("127.0.0.1:")),
                other => panic!("expected peer string, got {:?}", other),
            }

            table.shutdown().await;
        });
    }

    #[test]
    fn test_udp_write_without_destination_fails() {
        tokio_test::block_on(async {
            let table = EventTable::new(chunk());
            let socket = table.open_udp("127.0.0.1", 0).await.expect("bind");
            let err = table.write(socket, b"x", None).await.expect_err("no dest");
            assert!(err.message.contains("destination"));
            table.shutdown().await;
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_stream_round_trip() {
        tokio_test::block_on(async {
            let dir = std::env::temp_dir().join(format!("bp-unix-{}", std::process::id()));
            let _ = std::fs::create_dir_all(&dir);
            let path = dir.join("events.sock");
            let path_str = path.to_string_lossy().to_string();
            let _ = std::fs::remove_file(&path);

            let table = EventTable::new(chunk());
            let listener = table.open_unix_listen(&path_str).await.expect("listen");
            let client = table.open_unix_connect(&path_str).await.expect("connect");

            let accept = table
                .poll(&[listener], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("accept");
            let child = match field(field(&accept, "data"), "handle") {
                Value::Int(n) => *n as HandleId,
                other => panic!("expected int handle, got {:?}", other),
            };

            table.write(client, b"hi", None).await.expect("write");
            let event = table
                .poll(&[child], Some(Duration::from_secs(2)))
                .await
                .expect("poll")
                .expect("data");
            assert_eq!(
                field(field(&event, "data"), "bytes"),
                &Value::Bytes(b"hi".to_vec())
            );

            table.shutdown().await;
            let _ = std::fs::remove_file(&path);
        });
    }
}
