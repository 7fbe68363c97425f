//! Short-lived INFO probe cache used by master switch.
//!
//! A cache lives for one `switch_masters` call: every address is probed at
//! most once, with a hard per-address timeout so a dead backend cannot
//! stall the switch.

use crate::error::{Error, Result, TransportError};
use crate::resp::{self, Decoder, RespFrame};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Per-address run-id lookup with memoized results.
pub struct InfoCache {
    auth: Option<String>,
    timeout: Duration,
    cache: HashMap<String, Option<String>>,
}

impl InfoCache {
    pub fn new(auth: Option<String>, timeout: Duration) -> Self {
        Self {
            auth,
            timeout,
            cache: HashMap::new(),
        }
    }

    /// The `run_id` reported by the backend at `addr`, or `None` when it
    /// cannot be fetched in time. Results are memoized per address.
    pub async fn run_id(&mut self, addr: &str) -> Option<String> {
        if addr.is_empty() {
            return None;
        }
        if let Some(cached) = self.cache.get(addr) {
            return cached.clone();
        }
        let fetched = match self.fetch(addr).await {
            Ok(run_id) => Some(run_id),
            Err(e) => {
                debug!(%addr, error = %e, "run-id probe failed");
                None
            }
        };
        self.cache.insert(addr.to_string(), fetched.clone());
        fetched
    }

    async fn fetch(&self, addr: &str) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.probe(addr)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(TransportError::Timeout)),
        }
    }

    async fn probe(&self, addr: &str) -> Result<String> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut decoder = Decoder::new(read_half);
        let mut buf = BytesMut::new();

        if let Some(auth) = &self.auth {
            resp::encode_command(
                &mut buf,
                &[
                    RespFrame::bulk(Bytes::from_static(b"AUTH")),
                    RespFrame::bulk(auth.clone().into_bytes()),
                ],
            );
            write_half.write_all(&buf).await?;
            if let RespFrame::Error(message) = decoder.decode().await? {
                return Err(Error::Probe(
                    String::from_utf8_lossy(&message).into_owned(),
                ));
            }
            buf.clear();
        }

        resp::encode_command(&mut buf, &[RespFrame::bulk(Bytes::from_static(b"INFO"))]);
        write_half.write_all(&buf).await?;
        match decoder.decode().await? {
            RespFrame::Bulk(Some(payload)) => parse_run_id(&payload)
                .ok_or_else(|| Error::Probe("run_id not reported".to_string())),
            RespFrame::Error(message) => Err(Error::Probe(
                String::from_utf8_lossy(&message).into_owned(),
            )),
            _ => Err(Error::Probe("unexpected INFO reply".to_string())),
        }
    }
}

fn parse_run_id(info: &[u8]) -> Option<String> {
    for line in info.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(run_id) = line.strip_prefix(b"run_id:") {
            return Some(String::from_utf8_lossy(run_id).into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    #[tokio::test]
    async fn fetches_and_memoizes_run_id() {
        let backend = MockBackend::start().await.unwrap();
        backend.set_run_id("deadbeef");

        let mut cache = InfoCache::new(None, Duration::from_millis(500));
        assert_eq!(
            cache.run_id(&backend.addr()).await.as_deref(),
            Some("deadbeef")
        );

        // Memoized: the second lookup does not hit the backend again.
        let probes_before = backend.command_count();
        assert_eq!(
            cache.run_id(&backend.addr()).await.as_deref(),
            Some("deadbeef")
        );
        assert_eq!(backend.command_count(), probes_before);
    }

    #[tokio::test]
    async fn dead_address_yields_none() {
        let mut cache = InfoCache::new(None, Duration::from_millis(100));
        assert_eq!(cache.run_id("127.0.0.1:1").await, None);
        assert_eq!(cache.run_id("").await, None);
    }

    #[tokio::test]
    async fn auth_is_sent_before_info() {
        let backend = MockBackend::start().await.unwrap();
        backend.set_run_id("cafe");

        let mut cache = InfoCache::new(Some("secret".to_string()), Duration::from_millis(500));
        assert_eq!(cache.run_id(&backend.addr()).await.as_deref(), Some("cafe"));

        let commands = backend.commands();
        assert_eq!(commands[0][0], &b"AUTH"[..]);
        assert_eq!(commands[0][1], &b"secret"[..]);
        assert_eq!(commands[1][0], &b"INFO"[..]);
    }

    #[test]
    fn run_id_line_parses() {
        assert_eq!(
            parse_run_id(b"# Server\r\nrun_id:abc123\r\nrole:master\r\n").as_deref(),
            Some("abc123")
        );
        assert_eq!(parse_run_id(b"role:master\r\n"), None);
    }
}
