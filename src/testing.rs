//! Test support: a scriptable RESP backend.
//!
//! `MockBackend` accepts connections, records every decoded command, and
//! answers with scripted or default replies. `hold`/`release` park request
//! handling so tests can observe in-flight drains.

use crate::resp::{self, Decoder, RespFrame};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type CommandLog = Arc<Mutex<Vec<Vec<Bytes>>>>;
type ReplyTable = Arc<Mutex<HashMap<Vec<u8>, RespFrame>>>;

/// Opt-in test logging: `RUST_LOG=slotline=debug cargo test -- --nocapture`.
/// Safe to call from every test; only the first call installs the
/// subscriber.
#[cfg(test)]
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A scriptable in-process backend speaking RESP.
pub struct MockBackend {
    addr: SocketAddr,
    commands: CommandLog,
    replies: ReplyTable,
    hold: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl MockBackend {
    /// Bind an ephemeral port and start serving.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let commands: CommandLog = Arc::new(Mutex::new(Vec::new()));
        let replies: ReplyTable = Arc::new(Mutex::new(HashMap::new()));
        let (hold, hold_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            commands.clone(),
            replies.clone(),
            hold_rx,
        ));
        Ok(Self {
            addr,
            commands,
            replies,
            hold,
            accept_task,
        })
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Script the reply for one op; unscripted ops get default replies.
    pub fn set_reply(&self, op: &[u8], reply: RespFrame) {
        self.replies.lock().insert(op.to_ascii_uppercase(), reply);
    }

    /// Advertise a run id through the INFO reply.
    pub fn set_run_id(&self, run_id: &str) {
        self.set_reply(
            b"INFO",
            RespFrame::bulk(format!("# Server\r\nrun_id:{run_id}\r\n")),
        );
    }

    /// Park request handling after the command is recorded; replies resume
    /// on [`release`](Self::release).
    pub fn hold(&self) {
        let _ = self.hold.send(true);
    }

    pub fn release(&self) {
        let _ = self.hold.send(false);
    }

    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<Vec<Bytes>> {
        self.commands.lock().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    commands: CommandLog,
    replies: ReplyTable,
    hold: watch::Receiver<bool>,
) {
    while let Ok((socket, _)) = listener.accept().await {
        tokio::spawn(serve(
            socket,
            commands.clone(),
            replies.clone(),
            hold.clone(),
        ));
    }
}

async fn serve(
    socket: TcpStream,
    commands: CommandLog,
    replies: ReplyTable,
    mut hold: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut decoder = Decoder::new(read_half);
    loop {
        let multi = match decoder.decode_multi_bulk().await {
            Ok(multi) => multi,
            Err(_) => return,
        };
        let args: Vec<Bytes> = multi.iter().filter_map(|f| f.as_bulk().cloned()).collect();
        if args.is_empty() {
            continue;
        }
        let op = args[0].to_ascii_uppercase();
        commands.lock().push(args);

        while *hold.borrow() {
            if hold.changed().await.is_err() {
                return;
            }
        }

        let reply = replies
            .lock()
            .get(&op)
            .cloned()
            .unwrap_or_else(|| default_reply(&op));
        let mut buf = BytesMut::new();
        resp::encode_frame(&mut buf, &reply);
        if write_half.write_all(&buf).await.is_err() {
            return;
        }
    }
}

fn default_reply(op: &[u8]) -> RespFrame {
    if op == b"PING" {
        RespFrame::simple("PONG")
    } else if op == b"SLOTSMGRTTAGONE" {
        RespFrame::Integer(1)
    } else if op == b"INFO" {
        RespFrame::bulk("run_id:mock\r\n")
    } else {
        RespFrame::simple("OK")
    }
}
