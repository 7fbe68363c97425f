//! Requests and their completion handles.

use crate::error::{Error, Result, TransportError};
use crate::resp::RespFrame;
use crate::slot::SlotToken;
use bytes::Bytes;
use tokio::sync::oneshot;

/// One client command travelling through the core.
///
/// A request is resolved exactly once: with the backend's response frame,
/// or with an error. Dropping an unresolved request resolves it with a
/// transport error — every queue-drain path relies on this.
#[derive(Debug)]
pub struct Request {
    /// The parsed command: a multi-bulk sequence of bulk strings.
    pub multi: Vec<RespFrame>,

    /// Upper-cased first element of `multi`.
    pub op: Bytes,

    /// Backend database index.
    pub database: u32,

    /// Per-session seed, used for pool index selection.
    pub seed: u64,

    /// The session requires the primary even when replicas are bound.
    pub master_only: bool,

    completion: Option<oneshot::Sender<Result<RespFrame>>>,
    token: Option<SlotToken>,
}

impl Request {
    /// Build a request and the handle its response arrives on.
    pub fn new(multi: Vec<RespFrame>, database: u32, seed: u64) -> (Self, ResponseHandle) {
        let op = match multi.first() {
            Some(RespFrame::Bulk(Some(name))) => Bytes::from(name.to_ascii_uppercase()),
            _ => Bytes::new(),
        };
        let (tx, rx) = oneshot::channel();
        let request = Self {
            multi,
            op,
            database,
            seed,
            master_only: false,
            completion: Some(tx),
            token: None,
        };
        (request, ResponseHandle { rx })
    }

    /// Build a request whose response nobody consumes (keep-alive pings).
    pub(crate) fn detached(multi: Vec<RespFrame>) -> Self {
        let (request, _handle) = Self::new(multi, 0, 0);
        request
    }

    /// Tie this request to its slot's barrier; the slot refcount drops
    /// when the request resolves.
    pub(crate) fn attach_token(&mut self, token: SlotToken) {
        self.token = Some(token);
    }

    /// Resolve the completion. A closed handle makes this a silent
    /// discard.
    pub(crate) fn resolve(&mut self, result: Result<RespFrame>) {
        self.token.take();
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(TransportError::ConnectionReset.into()));
        }
    }
}

/// Resolve a request with `err` and hand the same error back to the
/// dispatching caller.
pub(crate) fn reject(mut request: Request, err: Error) -> Error {
    request.resolve(Err(err.clone()));
    err
}

/// Receiving side of a request's completion.
///
/// Dropping the handle abandons the request; the eventual resolution is
/// discarded without side effects.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<RespFrame>>,
}

impl ResponseHandle {
    /// Wait for the response or the failure that consumed the request.
    pub async fn wait(self) -> Result<RespFrame> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(TransportError::ConnectionReset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Vec<RespFrame> {
        parts.iter().map(|p| RespFrame::bulk(p.to_string())).collect()
    }

    #[test]
    fn op_is_uppercased_first_element() {
        let (request, _handle) = Request::new(command(&["get", "foo"]), 0, 0);
        assert_eq!(&request.op[..], b"GET");
    }

    #[test]
    fn empty_command_has_empty_op() {
        let (request, _handle) = Request::new(Vec::new(), 0, 0);
        assert!(request.op.is_empty());
    }

    #[tokio::test]
    async fn resolve_delivers_response() {
        let (mut request, handle) = Request::new(command(&["PING"]), 0, 0);
        request.resolve(Ok(RespFrame::simple("PONG")));
        assert_eq!(handle.wait().await.unwrap(), RespFrame::simple("PONG"));
    }

    #[tokio::test]
    async fn drop_resolves_with_transport_error() {
        let (request, handle) = Request::new(command(&["GET", "k"]), 0, 0);
        drop(request);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::ConnectionReset));
    }

    #[tokio::test]
    async fn abandoned_handle_makes_resolve_a_noop() {
        let (mut request, handle) = Request::new(command(&["GET", "k"]), 0, 0);
        drop(handle);
        request.resolve(Ok(RespFrame::simple("OK")));
    }
}
