//! Routing and dispatch core of a slot-sharded Redis proxy.
//!
//! This crate sits between client sessions speaking RESP and a fleet of
//! backend Redis servers partitioned into a fixed slot space. It provides:
//!
//! - **Deterministic routing**: key → hash tag → crc32 → one of 1024
//!   slots → one pooled backend connection.
//! - **Online reconfiguration**: a slot rebinds to a new primary,
//!   migration source and replica groups atomically; in-flight requests
//!   drain behind a per-slot barrier while the rest of the table keeps
//!   dispatching.
//! - **Connection multiplexing**: a bounded set of pipelined connections
//!   per address, shared across all sessions with coalesced flushes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              Client sessions                  │
//! └───────────────────────────────────────────────┘
//!            │ dispatch(request)
//!            ▼
//! ┌───────────────────────────────────────────────┐
//! │ Router    slots[1024]   primary/replica pools │
//! └───────────────────────────────────────────────┘
//!            │ forward (sync / semi-async probe)
//!            ▼
//! ┌───────────────────────────────────────────────┐
//! │ BackendConn   writer task ⇄ reader task       │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use slotline::{ProxyConfig, Request, RespFrame, Router, SlotDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> slotline::Result<()> {
//!     let router = Router::new(ProxyConfig::default());
//!
//!     // The topology controller pushes the routing table.
//!     let descriptor = SlotDescriptor::new(0).with_backend("127.0.0.1:6379", 1);
//!     router.fill_slot(&descriptor).await?;
//!     router.start();
//!
//!     // A session dispatches a parsed command.
//!     let multi = vec![RespFrame::bulk("GET"), RespFrame::bulk("foo")];
//!     let (request, handle) = Request::new(multi, 0, 1);
//!     router.dispatch(request).await?;
//!     let response = handle.wait().await?;
//!     println!("{response:?}");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod hashkey;
pub mod models;
pub mod request;
pub mod resp;
pub mod router;
pub mod testing;

mod forward;
mod slot;

pub use backend::{BackendConn, InfoCache, SharedBackendConn, SharedBackendPool};
pub use config::ProxyConfig;
pub use error::{Error, ProtocolError, Result, RoutingError, TransportError};
pub use models::{ForwardKind, GroupId, SlotDescriptor, MAX_SLOT_NUM};
pub use request::{Request, ResponseHandle};
pub use resp::{Decoder, RespFrame};
pub use router::Router;
pub use slot::Slot;
