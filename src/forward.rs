//! Migration-probe forwarding disciplines.
//!
//! While a slot is migrating, every keyed request is preceded by a probing
//! command against the migration source that moves the hash key to the new
//! primary if it still lives there. The two disciplines differ only in who
//! waits for the probe: `Sync` suspends the dispatching task, `SemiAsync`
//! lets the probe's completion trigger the forward.

use crate::backend::BackendConn;
use crate::error::{Error, ProtocolError, Result};
use crate::request::{Request, ResponseHandle};
use crate::resp::RespFrame;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Control command that moves one hash key off the migration source.
const MIGRATE_PROBE_OP: &[u8] = b"SLOTSMGRTTAGONE";

fn probe_request(hkey: &[u8], database: u32, seed: u64) -> (Request, ResponseHandle) {
    let multi = vec![
        RespFrame::bulk(Bytes::from_static(MIGRATE_PROBE_OP)),
        RespFrame::bulk(Bytes::copy_from_slice(hkey)),
    ];
    Request::new(multi, database, seed)
}

/// A non-error probe reply means the key now lives on the primary. Error
/// replies fail the triggering request; anything else is a protocol
/// violation.
fn accept(reply: RespFrame) -> Result<()> {
    match reply {
        RespFrame::Integer(moved) => {
            debug!(moved, "migration probe acknowledged");
            Ok(())
        }
        RespFrame::Simple(_) => Ok(()),
        RespFrame::Error(message) => {
            Err(Error::Probe(String::from_utf8_lossy(&message).into_owned()))
        }
        _ => Err(ProtocolError::BadProbeReply.into()),
    }
}

/// Synchronous discipline: round-trip the probe before pushing the real
/// request.
pub(crate) async fn probe_migrate(
    source: &Arc<BackendConn>,
    hkey: &[u8],
    database: u32,
    seed: u64,
) -> Result<()> {
    let (request, handle) = probe_request(hkey, database, seed);
    source.push_back(request);
    handle.wait().await.and_then(accept)
}

/// Semi-asynchronous discipline: enqueue the probe and forward the real
/// request from its completion, so dispatch never suspends on the
/// migration source.
pub(crate) fn probe_then_forward(
    source: Arc<BackendConn>,
    target: Arc<BackendConn>,
    mut request: Request,
    hkey: &[u8],
) {
    let (probe, handle) = probe_request(hkey, request.database, request.seed);
    source.push_back(probe);
    tokio::spawn(async move {
        match handle.wait().await.and_then(accept) {
            Ok(()) => target.push_back(request),
            Err(e) => request.resolve(Err(e)),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_and_ack_replies_are_accepted() {
        assert!(accept(RespFrame::Integer(0)).is_ok());
        assert!(accept(RespFrame::Integer(1)).is_ok());
        assert!(accept(RespFrame::simple("OK")).is_ok());
    }

    #[test]
    fn error_reply_fails_with_its_message() {
        let err = accept(RespFrame::error("ERR target unreachable")).unwrap_err();
        assert_eq!(err, Error::Probe("ERR target unreachable".to_string()));
    }

    #[test]
    fn other_frames_are_protocol_violations() {
        let err = accept(RespFrame::bulk("1")).unwrap_err();
        assert_eq!(err, Error::Protocol(ProtocolError::BadProbeReply));
    }

    #[test]
    fn probe_carries_the_hash_key() {
        let (request, _handle) = probe_request(b"user1000", 2, 7);
        assert_eq!(&request.op[..], MIGRATE_PROBE_OP);
        assert_eq!(request.multi[1].as_bulk().unwrap(), &b"user1000"[..]);
        assert_eq!(request.database, 2);
    }
}
