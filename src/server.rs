//! Accept loop and shutdown coordination.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ProtocolServerConfig;
use crate::error::ConfigError;
use crate::executor::RemoteExecutor;
use crate::ssh::serve_connection;

/// Pause after a failed accept so a persistent error does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the first free port in `port..port + attempts`; port 0 binds an
/// ephemeral port on the first try.
pub async fn bind_listener(
    address: IpAddr,
    port: u16,
    attempts: u16,
) -> Result<TcpListener, ConfigError> {
    if port == 0 {
        return Ok(TcpListener::bind(SocketAddr::new(address, 0)).await?);
    }

    let end = port.saturating_add(attempts.saturating_sub(1));
    let mut last_error = None;
    for candidate in port..=end {
        match TcpListener::bind(SocketAddr::new(address, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!("port {} unavailable: {}", candidate, e);
                last_error = Some(e);
            }
        }
    }

    Err(ConfigError::NoFreePort {
        start: port,
        end,
        source: last_error.unwrap_or_else(|| std::io::Error::other("no port attempted")),
    })
}

/// Raises the shutdown signal of a [`ProxyServer`]. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting connections. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        let was_raised = self.tx.send_replace(true);
        if !was_raised {
            tracing::info!("SSH proxy: shutting down");
        }
    }
}

/// Connections that were still being served when the accept loop stopped.
pub struct InFlight {
    connections: JoinSet<()>,
}

impl InFlight {
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Wait for every connection to end on its own. Whatever is still running
    /// once `grace` has passed is aborted.
    pub async fn drain(mut self, grace: Duration) {
        if self.is_empty() {
            return;
        }
        tracing::info!("SSH proxy: waiting for {} connection(s) to finish", self.len());

        let connections = &mut self.connections;
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = connections.join_next().await {
                log_connection_exit(joined);
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!(
                "SSH proxy: aborting {} connection(s) still open after {:?}",
                self.len(),
                grace
            );
            self.connections.abort_all();
        }
    }
}

fn log_connection_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("connection task panicked: {}", e);
        }
    }
}

/// Owns the listening socket and hands every connection to its own task.
pub struct ProxyServer {
    listener: TcpListener,
    config: ProtocolServerConfig,
    executor: Arc<dyn RemoteExecutor>,
    shutdown: ShutdownHandle,
}

impl ProxyServer {
    pub fn new(
        listener: TcpListener,
        config: ProtocolServerConfig,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            listener,
            config,
            executor,
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is raised. The listener is released
    /// when this returns; connections already accepted keep running and are
    /// handed back to the caller.
    pub async fn serve(self) -> InFlight {
        match self.local_addr() {
            Ok(addr) => tracing::info!("SSH proxy: serving on {}", addr),
            Err(e) => tracing::warn!("SSH proxy: serving on unknown address: {}", e),
        }

        let mut connections = JoinSet::new();
        let mut shutdown = self.shutdown.tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            while let Some(joined) = connections.try_join_next() {
                                log_connection_exit(joined);
                            }
                            let config = self.config.clone();
                            let executor = self.executor.clone();
                            let connection = serve_connection(stream, peer_addr, config, executor);
                            connections.spawn(connection);
                        }
                        Err(e) => {
                            tracing::warn!("listen.Accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        drop(self.listener);
        tracing::info!("SSH proxy: listener closed");
        InFlight { connections }
    }
}
