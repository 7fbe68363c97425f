//! One pipelined connection to one backend address.
//!
//! A connection runs two long-lived tasks: the writer encodes queued
//! requests onto the socket, coalescing flushes; the reader decodes
//! response frames and resolves the in-flight head. The writer is the only
//! task moving requests into the in-flight queue, so a request is either
//! never written (and resolved with an error) or in flight exactly once.
//! Failure on either side tears both tasks down; dropping the queues
//! resolves every pending request with a transport error.

use crate::config::ProxyConfig;
use crate::request::Request;
use crate::resp::{self, Decoder, RespFrame};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

const NEVER_PINGED: u64 = u64::MAX;

/// A pipelined backend connection.
pub struct BackendConn {
    addr: String,
    input: mpsc::UnboundedSender<Request>,
    shutdown: Arc<Notify>,
    healthy: Arc<AtomicBool>,
    closed: AtomicBool,
    last_ping_ms: AtomicU64,
    epoch: Instant,
    keepalive_period: Duration,
}

impl BackendConn {
    /// Open a connection to `addr`. The socket is established in the
    /// background; requests queue until it is up.
    pub(crate) fn new(addr: &str, config: &ProxyConfig) -> Arc<Self> {
        let (input, input_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let healthy = Arc::new(AtomicBool::new(false));
        let conn = Arc::new(Self {
            addr: addr.to_string(),
            input,
            shutdown: shutdown.clone(),
            healthy: healthy.clone(),
            closed: AtomicBool::new(false),
            last_ping_ms: AtomicU64::new(NEVER_PINGED),
            epoch: Instant::now(),
            keepalive_period: config.backend_keepalive_period,
        });
        tokio::spawn(run(
            conn.addr.clone(),
            input_rx,
            shutdown,
            healthy,
            config.backend_connect_timeout,
            config.backend_recv_bufsize,
            config.backend_send_bufsize,
        ));
        conn
    }

    /// The backend address this connection targets.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the socket is up and the connection has not been closed.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Append a request to the send queue. On a dead connection the
    /// request resolves immediately with a transport error.
    pub fn push_back(&self, request: Request) {
        if self.closed.load(Ordering::SeqCst) {
            drop(request);
            return;
        }
        // A send failure drops the request, which resolves its completion.
        let _ = self.input.send(request);
    }

    /// Close the connection. In-flight requests drain; queued requests
    /// resolve with a transport error.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }

    /// Enqueue a no-op ping, at most once per keep-alive period.
    /// Idempotent and non-blocking.
    pub fn keep_alive(&self) {
        let period = self.keepalive_period.as_millis() as u64;
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_ping_ms.load(Ordering::SeqCst);
        if last != NEVER_PINGED && now < last.saturating_add(period) {
            return;
        }
        if self
            .last_ping_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.push_back(Request::detached(vec![RespFrame::bulk(
                Bytes::from_static(b"PING"),
            )]));
        }
    }
}

async fn run(
    addr: String,
    input: mpsc::UnboundedReceiver<Request>,
    shutdown: Arc<Notify>,
    healthy: Arc<AtomicBool>,
    connect_timeout: Duration,
    recv_bufsize: usize,
    send_bufsize: usize,
) {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%addr, error = %e, "backend connect failed");
            return;
        }
        Err(_) => {
            warn!(%addr, "backend connect timed out");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "set_nodelay failed");
    }
    healthy.store(true, Ordering::SeqCst);
    debug!(%addr, "backend connected");

    let (read_half, write_half) = stream.into_split();
    let (inflight_tx, inflight_rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(
        write_half,
        input,
        inflight_tx,
        shutdown,
        send_bufsize,
    ));
    let mut reader = tokio::spawn(read_loop(read_half, inflight_rx, recv_bufsize));

    tokio::select! {
        result = &mut writer => {
            if matches!(result, Ok(true)) {
                // Clean close: let the reader drain the in-flight queue.
                let _ = reader.await;
            } else {
                reader.abort();
                let _ = reader.await;
            }
        }
        _ = &mut reader => {
            writer.abort();
            let _ = writer.await;
        }
    }

    healthy.store(false, Ordering::SeqCst);
    debug!(%addr, "backend connection terminated");
}

/// Returns `true` on a clean shutdown, `false` on a transport failure.
async fn write_loop(
    write_half: OwnedWriteHalf,
    mut input: mpsc::UnboundedReceiver<Request>,
    inflight: mpsc::UnboundedSender<Request>,
    shutdown: Arc<Notify>,
    bufsize: usize,
) -> bool {
    let mut wr = BufWriter::with_capacity(bufsize, write_half);
    let mut buf = BytesMut::new();
    loop {
        let mut request = tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            next = input.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };
        // Drain the burst into one flush.
        loop {
            buf.clear();
            resp::encode_command(&mut buf, &request.multi);
            if let Err(e) = wr.write_all(&buf).await {
                request.resolve(Err(e.into()));
                return false;
            }
            if inflight.send(request).is_err() {
                // Reader is gone; the rejected request resolves on drop.
                return false;
            }
            match input.try_recv() {
                Ok(next) => request = next,
                Err(_) => break,
            }
        }
        if wr.flush().await.is_err() {
            return false;
        }
    }
    let _ = wr.flush().await;
    true
}

async fn read_loop(
    read_half: OwnedReadHalf,
    mut inflight: mpsc::UnboundedReceiver<Request>,
    bufsize: usize,
) {
    let mut decoder = Decoder::with_capacity(read_half, bufsize);
    while let Some(mut request) = inflight.recv().await {
        match decoder.decode().await {
            Ok(frame) => request.resolve(Ok(frame)),
            Err(e) => {
                request.resolve(Err(e));
                // Remaining in-flight requests drain when the queue drops.
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransportError};
    use crate::testing::MockBackend;
    use tokio::time::sleep;

    fn command(parts: &[&str]) -> Vec<RespFrame> {
        parts.iter().map(|p| RespFrame::bulk(p.to_string())).collect()
    }

    fn test_config() -> ProxyConfig {
        ProxyConfig::default().with_connect_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn request_round_trips() {
        let backend = MockBackend::start().await.unwrap();
        backend.set_reply(b"GET", RespFrame::bulk("bar"));
        let conn = BackendConn::new(&backend.addr(), &test_config());

        let (request, handle) = Request::new(command(&["GET", "foo"]), 0, 0);
        conn.push_back(request);

        assert_eq!(handle.wait().await.unwrap(), RespFrame::bulk("bar"));
        assert_eq!(backend.commands()[0][1], &b"foo"[..]);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn pipelined_responses_keep_order() {
        let backend = MockBackend::start().await.unwrap();
        let conn = BackendConn::new(&backend.addr(), &test_config());

        let mut handles = Vec::new();
        for i in 0..16 {
            let (request, handle) = Request::new(command(&["SET", &format!("k{i}"), "v"]), 0, 0);
            conn.push_back(request);
            handles.push(handle);
        }
        for handle in handles {
            assert_eq!(handle.wait().await.unwrap(), RespFrame::simple("OK"));
        }
        let keys: Vec<_> = backend
            .commands()
            .iter()
            .map(|c| String::from_utf8_lossy(&c[1]).into_owned())
            .collect();
        let expected: Vec<_> = (0..16).map(|i| format!("k{i}")).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_requests() {
        crate::testing::init_tracing();
        // Port 1 on localhost refuses connections.
        let config = ProxyConfig::default().with_connect_timeout(Duration::from_millis(300));
        let conn = BackendConn::new("127.0.0.1:1", &config);

        let (request, handle) = Request::new(command(&["GET", "foo"]), 0, 0);
        conn.push_back(request);

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::ConnectionReset));
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn close_rejects_new_requests() {
        let backend = MockBackend::start().await.unwrap();
        let conn = BackendConn::new(&backend.addr(), &test_config());
        conn.close();

        let (request, handle) = Request::new(command(&["GET", "foo"]), 0, 0);
        conn.push_back(request);
        assert!(handle.wait().await.is_err());
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn keep_alive_is_rate_limited() {
        let backend = MockBackend::start().await.unwrap();
        let config = test_config().with_keepalive_period(Duration::from_secs(60));
        let conn = BackendConn::new(&backend.addr(), &config);

        conn.keep_alive();
        conn.keep_alive();
        conn.keep_alive();

        // Give the ping time to travel.
        for _ in 0..50 {
            if backend.command_count() > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.command_count(), 1);
        assert_eq!(backend.commands()[0][0], &b"PING"[..]);
    }
}
