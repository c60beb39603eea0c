use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tether_protocol::Registry;
use tether_std::errors::Result;

use crate::args::ServerConfig;
use crate::protocol::{serve_connection, Shared};
use crate::state::{ReaperTask, ServerState};
use crate::worker::WorkerPool;

pub struct Server {
    config: ServerConfig,
    state: Arc<ServerState>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig, registry: Registry) -> Self {
        let shared = Arc::new(Shared {
            registry: Arc::new(registry),
            workers: WorkerPool::default(),
            concurrency_limit: config.concurrency_limit as usize,
        });
        Self {
            config,
            state: ServerState::new(),
            shared,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token gracefully shuts the server down, exactly like
    /// a termination signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the listener. Split from [`Server::serve`] so callers can learn
    /// the bound address when the configured port is zero.
    pub fn listen(&self) -> Result<TcpListener> {
        let addr = resolve_bind_addr(&self.config)?;
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_keepalive(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        #[cfg(not(unix))]
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.config.backlog)?)
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let pid = std::process::id();
        info!("Starting worker [{pid}]");

        if self.config.max_idle_time != 0 {
            ReaperTask::start(
                self.state.clone(),
                Duration::from_secs(self.config.max_idle_time),
                self.shutdown.clone(),
            );
        }

        let mut connections = JoinSet::new();
        self.accept_loop(&listener, &mut connections).await?;

        info!("Stopping worker [{pid}]");
        drop(listener);
        self.shutdown.cancel();

        if !connections.is_empty() {
            info!(
                "Wait {} connection graceful close. [{pid}]",
                connections.len()
            );
        }
        while connections.join_next().await.is_some() {}

        info!("Exit worker [{pid}]");
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        connections: &mut JoinSet<()>,
    ) -> Result<()> {
        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);

        loop {
            #[cfg(unix)]
            let terminated = sigterm.recv();
            #[cfg(not(unix))]
            let terminated = std::future::pending::<Option<()>>();

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer, connections),
                    Err(err) => error!("accept failed: {err}"),
                },
                _ = &mut interrupted => break,
                _ = terminated => break,
                _ = self.shutdown.cancelled() => break,
            }
        }
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr, connections: &mut JoinSet<()>) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {peer}: {err}");
        }
        let handle = self.state.connection_made();
        info!(
            "Connection made: {peer}, monitored={}",
            self.state.current_size()
        );
        connections.spawn(serve_connection(
            stream,
            peer,
            self.state.clone(),
            handle,
            self.shared.clone(),
            self.shutdown.clone(),
        ));
    }
}

fn resolve_bind_addr(config: &ServerConfig) -> std::io::Result<SocketAddr> {
    (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no listen address resolved")
        })
}
