use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use socket2::SockRef;
use tracing::debug;

use tether_protocol::{decode_header, unpack_payload, EventType, Value, HEADER_SIZE};
use tether_std::errors::{RemoteError, Result, TetherError};

use crate::config::ClientConfig;
use crate::request::Request;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A bounded queue of blocking connections. One request is in flight per
/// connection at a time, so correlation is implicit.
pub struct BlockingPool {
    config: ClientConfig,
    idle: Mutex<VecDeque<TcpStream>>,
}

impl BlockingPool {
    /// Opens the first connection eagerly so a dead endpoint surfaces here
    /// rather than on the first dispatch.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let pool = Self {
            idle: Mutex::new(VecDeque::new()),
            config,
        };
        let conn = pool.connect()?;
        pool.idle.lock().unwrap().push_back(conn);
        Ok(pool)
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no address resolved")
            })?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;
        stream.set_read_timeout(self.config.io_timeout())?;
        stream.set_write_timeout(self.config.io_timeout())?;
        Ok(stream)
    }

    /// Send one request and wait for its response. Healthy connections go
    /// back to the queue; transport failures close them.
    pub fn dispatch_request(&self, request: &Request) -> Result<Value> {
        let mut conn = match self.idle.lock().unwrap().pop_front() {
            Some(conn) => conn,
            None => self.connect()?,
        };

        match Self::roundtrip(&mut conn, request) {
            Ok(outcome) => {
                let mut idle = self.idle.lock().unwrap();
                if idle.len() < self.config.pool_size as usize {
                    idle.push_back(conn);
                }
                outcome.map_err(TetherError::from)
            }
            Err(err) => {
                debug!(error = %err, "closing connection after transport failure");
                drop(conn);
                Err(err)
            }
        }
    }

    /// Outer `Err` means the connection is unusable; inner `Err` is an
    /// application error carried in a well-formed response.
    fn roundtrip(
        conn: &mut TcpStream,
        request: &Request,
    ) -> Result<Result<Value, RemoteError>> {
        conn.write_all(&request.pack()?)?;

        let mut raw = [0u8; HEADER_SIZE];
        conn.read_exact(&mut raw).map_err(eof_to_lost)?;
        let header = decode_header(&raw)?;
        if header.event_type != EventType::Response as u8 {
            return Err(RemoteError::Frame(format!(
                "expect response, got event type {}",
                header.event_type
            ))
            .into());
        }

        let mut body = vec![0u8; header.payload_size as usize];
        conn.read_exact(&mut body).map_err(eof_to_lost)?;
        let value = unpack_payload(header.compress_flag, &body)?;

        if header.errno != 0 {
            let message = match value {
                Value::Str(message) => message,
                other => format!("{other:?}"),
            };
            return Ok(Err(RemoteError::from_wire(header.errno, message)));
        }
        Ok(Ok(value))
    }
}

fn eof_to_lost(err: io::Error) -> TetherError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TetherError::ConnectionLost
    } else {
        err.into()
    }
}
