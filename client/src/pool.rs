use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tracing::debug;

use tether_protocol::{ResponseCodec, Value};
use tether_std::errors::{Result, TetherError};

use crate::blocking::CONNECT_TIMEOUT;
use crate::config::ClientConfig;
use crate::request::Request;

/// Connections with more than this many outstanding requests push the pool
/// into growing instead of pipelining further. Independent of the server's
/// concurrency limit.
const MAX_OUTSTANDING: usize = 8;

type Waiters = Arc<Mutex<HashMap<u16, oneshot::Sender<Result<Value>>>>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// One multiplexed connection: a locked write half plus a reader task that
/// resolves waiters by sequence number.
struct Connection {
    id: u64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    waiters: Waiters,
    closed: Arc<AtomicBool>,
}

impl Connection {
    async fn open(config: &ClientConfig) -> Result<Arc<Self>> {
        let connect = TcpStream::connect((config.host.clone(), config.port));
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| TetherError::Timeout)??;
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;

        let (read_half, write_half) = stream.into_split();
        let waiters: Waiters = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            writer: tokio::sync::Mutex::new(write_half),
            waiters: waiters.clone(),
            closed: closed.clone(),
        });

        tokio::spawn(read_loop(
            conn.id,
            FramedRead::new(read_half, ResponseCodec::default()),
            waiters,
            closed,
        ));
        Ok(conn)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register the waiter, then write. Registration comes first so a
    /// response racing the write cannot be discarded as unmatched.
    async fn send(&self, request: &Request) -> Result<oneshot::Receiver<Result<Value>>> {
        if self.is_closed() {
            return Err(TetherError::ConnectionLost);
        }
        let payload = request.pack()?;
        let seq = request.sequence_number();

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().unwrap();
            if waiters.contains_key(&seq) {
                return Err(TetherError::DuplicateSequence(seq));
            }
            waiters.insert(seq, tx);
        }

        let written = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&payload).await
        };
        if let Err(err) = written {
            self.waiters.lock().unwrap().remove(&seq);
            return Err(err.into());
        }
        Ok(rx)
    }

    fn forget(&self, seq: u16) {
        self.waiters.lock().unwrap().remove(&seq);
    }
}

async fn read_loop(
    id: u64,
    mut framed: FramedRead<OwnedReadHalf, ResponseCodec>,
    waiters: Waiters,
    closed: Arc<AtomicBool>,
) {
    while let Some(item) = framed.next().await {
        match item {
            Ok(response) => {
                let waiter = waiters.lock().unwrap().remove(&response.sequence_number);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response.result.map_err(TetherError::from));
                    }
                    // late or duplicate response, nothing to complete
                    None => debug!(
                        conn = id,
                        seq = response.sequence_number,
                        "discarding response without a waiter"
                    ),
                }
            }
            Err(err) => {
                debug!(conn = id, error = %err, "response stream failed");
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    let drained: Vec<_> = {
        let mut waiters = waiters.lock().unwrap();
        waiters.drain().collect()
    };
    debug!(conn = id, waiters = drained.len(), "connection lost");
    for (_, tx) in drained {
        let _ = tx.send(Err(TetherError::ConnectionLost));
    }
}

#[derive(Default)]
struct PoolInner {
    conns: VecDeque<Arc<Connection>>,
    outstanding: HashMap<u64, usize>,
}

/// Busy means dispatch should open a fresh connection instead of reusing
/// one: nothing pooled yet, or (below capacity) some connection is already
/// pipelining deeper than [`MAX_OUTSTANDING`].
fn pool_is_busy(
    conn_count: usize,
    pool_size: usize,
    outstanding: &HashMap<u64, usize>,
) -> bool {
    if conn_count == 0 {
        return true;
    }
    if conn_count == pool_size {
        return false;
    }
    outstanding.values().any(|count| *count > MAX_OUTSTANDING)
}

/// Deque of multiplexed connections with per-connection outstanding counts.
pub struct AsyncPool {
    config: ClientConfig,
    inner: tokio::sync::Mutex<PoolInner>,
}

impl AsyncPool {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            inner: tokio::sync::Mutex::new(PoolInner::default()),
        }
    }

    pub async fn dispatch_request(&self, request: &Request) -> Result<Value> {
        let conn = self.acquire().await?;

        let outcome = match conn.send(request).await {
            Ok(receiver) => self.wait(&conn, request, receiver).await,
            Err(err) => Err(err),
        };

        self.release(&conn).await;
        outcome
    }

    async fn acquire(&self) -> Result<Arc<Connection>> {
        let mut inner = self.inner.lock().await;
        let conn = if pool_is_busy(
            inner.conns.len(),
            self.config.pool_size as usize,
            &inner.outstanding,
        ) {
            Connection::open(&self.config).await?
        } else {
            match inner.conns.pop_front() {
                Some(conn) if !conn.is_closed() => conn,
                stale => {
                    if let Some(conn) = stale {
                        inner.outstanding.remove(&conn.id);
                    }
                    Connection::open(&self.config).await?
                }
            }
        };

        inner.conns.push_back(conn.clone());
        *inner.outstanding.entry(conn.id).or_insert(0) += 1;
        Ok(conn)
    }

    async fn wait(
        &self,
        conn: &Connection,
        request: &Request,
        receiver: oneshot::Receiver<Result<Value>>,
    ) -> Result<Value> {
        let received = match self.config.io_timeout() {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    conn.forget(request.sequence_number());
                    return Err(TetherError::Timeout);
                }
            },
            None => receiver.await,
        };

        // a dropped sender means the reader task tore the connection down
        received.unwrap_or(Err(TetherError::ConnectionLost))
    }

    async fn release(&self, conn: &Arc<Connection>) {
        let mut inner = self.inner.lock().await;
        if let Some(count) = inner.outstanding.get_mut(&conn.id) {
            *count = count.saturating_sub(1);
        }
        if conn.is_closed() {
            inner.conns.retain(|c| c.id != conn.id);
            inner.outstanding.remove(&conn.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use tether_protocol::{decode_header, pack_message, EventType, HEADER_SIZE, MAX_SEQUENCE_ID};

    fn config_for(port: u16) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: 5,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_live_sequence_fails_synchronously() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // accept but never answer, keeping the first waiter live
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let conn = Connection::open(&config_for(port)).await.unwrap();
        let first = Request::new("ping", vec![]);
        let _rx = conn.send(&first).await.unwrap();

        // cycle the thread-local allocator all the way around so the next
        // request reuses the live sequence id
        for _ in 0..MAX_SEQUENCE_ID as u32 - 1 {
            let _ = crate::request::next_sequence_id();
        }
        let clash = Request::new("ping", vec![]);
        assert_eq!(clash.sequence_number(), first.sequence_number());

        let err = conn.send(&clash).await.unwrap_err();
        match err {
            TetherError::DuplicateSequence(seq) => {
                assert_eq!(seq, first.sequence_number());
            }
            other => panic!("unexpected error: {other:?}"),
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_unmatched_response_is_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            // unsolicited response first; no waiter can match it
            let stray = pack_message(60999, EventType::Response, Ok(&Value::Nil)).unwrap();
            stream.write_all(&stray).await.unwrap();

            // then answer the real request by echoing its sequence number
            let mut raw = [0u8; HEADER_SIZE];
            stream.read_exact(&mut raw).await.unwrap();
            let header = decode_header(&raw).unwrap();
            let mut body = vec![0u8; header.payload_size as usize];
            stream.read_exact(&mut body).await.unwrap();

            let reply = pack_message(
                header.sequence_number,
                EventType::Response,
                Ok(&Value::Str("pong".into())),
            )
            .unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let conn = Connection::open(&config_for(port)).await.unwrap();
        let request = Request::new("ping", vec![]);
        let receiver = conn.send(&request).await.unwrap();
        let reply = receiver.await.unwrap().unwrap();
        assert_eq!(reply, Value::Str("pong".into()));

        server.await.unwrap();
    }

    #[test]
    fn test_pool_is_busy_with_no_connections() {
        assert!(pool_is_busy(0, 12, &HashMap::new()));
    }

    #[test]
    fn test_pool_is_not_busy_when_full() {
        let outstanding = HashMap::from([(0, 100), (1, 100)]);
        assert!(!pool_is_busy(2, 2, &outstanding));
    }

    #[test]
    fn test_pool_grows_past_deep_pipelines() {
        let shallow = HashMap::from([(0, MAX_OUTSTANDING)]);
        assert!(!pool_is_busy(1, 12, &shallow));

        let deep = HashMap::from([(0, MAX_OUTSTANDING + 1)]);
        assert!(pool_is_busy(1, 12, &deep));
    }
}
