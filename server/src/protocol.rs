//! Per-connection protocol: request scheduling under the concurrency cap,
//! read-pause backpressure, response serialization through a draining
//! writer, and graceful close.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use tether_protocol::{pack_message, Declare, EventType, Handler, Message, Registry, RequestCodec, Value};
use tether_std::errors::RemoteError;

use crate::state::{ConnHandle, ServerState};
use crate::worker::WorkerPool;

/// Responses queued to the writer before response tasks start parking.
const WRITE_QUEUE_DEPTH: usize = 16;

/// Pieces shared by every connection of one server.
pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) workers: WorkerPool,
    pub(crate) concurrency_limit: usize,
}

pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    handle: ConnHandle,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(
        write_half,
        writer_rx,
        state.clone(),
        handle.clone(),
    ));

    let mut conn = Connection {
        reader: FramedRead::new(read_half, RequestCodec::default()),
        writer_tx,
        running: JoinSet::new(),
        pending: VecDeque::new(),
        read_paused: false,
        peer,
        state: state.clone(),
        handle: handle.clone(),
        shared,
        count: 0,
    };
    conn.run(shutdown).await;

    let count = conn.count;
    handle.mark_closing();
    // dropping the connection releases the writer channel so the write
    // loop can flush and exit
    drop(conn);
    let _ = writer.await;

    state.connection_lost(&handle);
    info!(
        "Connection lost: {}, consumed-event={}, monitored={}",
        peer,
        count,
        state.current_size()
    );
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut responses: mpsc::Receiver<Bytes>,
    state: Arc<ServerState>,
    handle: ConnHandle,
) {
    while let Some(payload) = responses.recv().await {
        if let Err(err) = writer.write_all(&payload).await {
            debug!("write failed on connection #{}: {}", handle.id(), err);
            handle.cancel();
            break;
        }
        state.connection_active(&handle);
    }
    let _ = writer.shutdown().await;
}

struct Connection {
    reader: FramedRead<tokio::net::tcp::OwnedReadHalf, RequestCodec>,
    writer_tx: mpsc::Sender<Bytes>,
    running: JoinSet<()>,
    pending: VecDeque<Message>,
    read_paused: bool,
    peer: SocketAddr,
    state: Arc<ServerState>,
    handle: ConnHandle,
    shared: Arc<Shared>,
    count: u64,
}

impl Connection {
    async fn run(&mut self, shutdown: CancellationToken) {
        let close = self.handle.close_token();
        loop {
            tokio::select! {
                _ = close.cancelled() => {
                    debug!("connection #{} close requested", self.handle.id());
                    self.running.shutdown().await;
                    return;
                }
                _ = shutdown.cancelled() => {
                    self.graceful_close().await;
                    return;
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    self.on_task_done(joined);
                }
                frame = self.reader.next(), if !self.read_paused => {
                    match frame {
                        Some(Ok(message)) => self.on_message(message),
                        Some(Err(err)) => {
                            // poisoned parser or transport failure; close
                            // without answering
                            error!("transport {} error: {}", self.peer, err);
                            self.running.shutdown().await;
                            return;
                        }
                        None => {
                            // peer finished sending, flush what is queued
                            self.graceful_close().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        self.state.connection_active(&self.handle);
        let limit = self.shared.concurrency_limit;
        if limit != 0 && self.running.len() >= limit {
            debug!(
                "connection #{} offends flow control, queueing seq={}",
                self.handle.id(),
                message.sequence_number
            );
            self.pending.push_back(message);
            self.read_paused = true;
        } else {
            self.spawn_response(message);
        }
    }

    fn spawn_response(&mut self, message: Message) {
        self.count += 1;
        let shared = self.shared.clone();
        let writer_tx = self.writer_tx.clone();
        let peer = self.peer;

        self.running.spawn(async move {
            let seq = message.sequence_number;
            debug!("Connection {} prepare consume request seq={}", peer, seq);

            let declare = shared.registry.resolve(&message.method);
            let result = execute(&declare, message.args, &shared.workers).await;
            match &result {
                Err(err) => error!(
                    "Connection {} raise error when consume seq={}: {}",
                    peer, seq, err
                ),
                Ok(_) => debug!("Connection {} finish consume request seq={}", peer, seq),
            }

            let payload = pack_response(seq, result);
            // awaiting the bounded channel is the drain point when the
            // writer is backed up; failure means the connection is gone
            let _ = writer_tx.send(payload).await;
        });
    }

    fn on_task_done(&mut self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            error!("response task for {} failed: {}", self.peer, err);
        }
        let limit = self.shared.concurrency_limit;
        if limit == 0 {
            return;
        }
        while self.running.len() < limit {
            match self.pending.pop_front() {
                Some(message) => self.spawn_response(message),
                None => break,
            }
        }
        self.read_paused = false;
    }

    /// Accept no new messages, but promote everything pending and wait for
    /// every running task before tearing down.
    async fn graceful_close(&mut self) {
        self.handle.mark_closing();
        while let Some(message) = self.pending.pop_front() {
            self.spawn_response(message);
        }
        while self.running.join_next().await.is_some() {}
    }
}

async fn execute(
    declare: &Declare,
    args: Vec<Value>,
    workers: &WorkerPool,
) -> Result<Value, RemoteError> {
    let bound = declare.bind(args)?;
    match declare.handler() {
        Handler::Inline(handler) => handler(bound),
        Handler::Cooperative(handler) => handler(bound).await,
        Handler::Worker(handler) => workers.run(handler.clone(), bound).await,
    }
}

/// Pack a result, falling back to packing the pack error itself so every
/// request gets exactly one response while the connection lives.
fn pack_response(seq: u16, result: Result<Value, RemoteError>) -> Bytes {
    let packed = match &result {
        Ok(value) => pack_message(seq, EventType::Response, Ok(value)),
        Err(error) => pack_message(seq, EventType::Response, Err(error)),
    };
    packed.unwrap_or_else(|pack_error| {
        pack_message(seq, EventType::Response, Err(&pack_error))
            .expect("packing an error string payload")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use futures::FutureExt;
    use tether_protocol::{decode_header, ResponseCodec, HEADER_SIZE};
    use tokio_util::codec::Decoder;

    #[tokio::test]
    async fn test_execute_dispatches_by_mode() {
        let workers = WorkerPool::default();

        let inline = Declare::builder("add")
            .param("a")
            .param("b")
            .inline(|args| {
                let sum = args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0);
                Ok(Value::Int(sum))
            })
            .unwrap();
        let result = execute(&inline, vec![Value::Int(2), Value::Int(3)], &workers).await;
        assert_eq!(result.unwrap(), Value::Int(5));

        let cooperative = Declare::builder("later")
            .cooperative(|_args| async { Ok(Value::Str("done".into())) }.boxed())
            .unwrap();
        let result = execute(&cooperative, vec![], &workers).await;
        assert_eq!(result.unwrap(), Value::Str("done".into()));

        let worker = Declare::builder("heavy")
            .worker(|_args| Ok(Value::Bool(true)))
            .unwrap();
        let result = execute(&worker, vec![], &workers).await;
        assert_eq!(result.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn test_execute_surfaces_binding_failures() {
        let workers = WorkerPool::default();
        let declare = Declare::builder("strict")
            .param("required")
            .inline(|args| Ok(args[0].clone()))
            .unwrap();

        let err = execute(&declare, vec![], &workers).await.unwrap_err();
        assert_eq!(err.code(), 402);
    }

    #[tokio::test]
    async fn test_execute_unknown_method_is_not_implemented() {
        let workers = WorkerPool::default();
        let registry = Registry::new();
        let declare = registry.resolve("nope");

        let err = execute(&declare, vec![], &workers).await.unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_pack_response_always_produces_a_frame() {
        let packed = pack_response(4, Ok(Value::Str("ok".into())));
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&packed[..HEADER_SIZE]);
        let header = decode_header(&raw).unwrap();
        assert_eq!(header.errno, 0);
        assert_eq!(header.sequence_number, 4);

        let packed = pack_response(5, Err(RemoteError::RemoteInternal("kaput".into())));
        let mut codec = ResponseCodec::default();
        let mut buffer = BytesMut::from(&packed[..]);
        let response = codec.decode(&mut buffer).unwrap().unwrap();
        let err = response.result.unwrap_err();
        assert_eq!(err.code(), 500);
        assert!(err.to_string().contains("kaput"));
    }
}
