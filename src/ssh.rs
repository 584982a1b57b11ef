use anyhow::Result;
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{AuthPolicy, ProtocolServerConfig};
use crate::executor::RemoteExecutor;
use crate::session::{RusshChannel, SessionRequest, SessionRequestHandler};

/// Run the SSH protocol on one accepted connection until the peer goes away.
///
/// Errors are reported here and never reach the accept loop.
pub async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: ProtocolServerConfig,
    executor: Arc<dyn RemoteExecutor>,
) {
    let conn_id = Uuid::new_v4();
    let span = tracing::info_span!("connection", %conn_id, peer = %peer_addr);

    async move {
        tracing::info!("SSH proxy: accepted connection");
        let handler = ProxyHandler::new(
            peer_addr,
            config.auth.clone(),
            executor,
            tracing::Span::current(),
        );

        match russh::server::run_stream(config.ssh.clone(), stream, handler).await {
            Ok(session) => {
                if let Err(e) = session.await {
                    tracing::warn!("SSH session error: {:#}", e);
                }
            }
            Err(e) => {
                tracing::warn!("SSH handshake failed: {:#}", e);
            }
        }
        tracing::debug!("connection closed");
    }
    .instrument(span)
    .await
}

/// Per-connection protocol handler: authenticates the peer, accepts session
/// channels and routes their requests to one [`SessionRequestHandler`] each.
pub struct ProxyHandler {
    peer_addr: SocketAddr,
    auth: Arc<AuthPolicy>,
    executor: Arc<dyn RemoteExecutor>,
    /// Request queues of the open session channels.
    sessions: HashMap<ChannelId, mpsc::UnboundedSender<SessionRequest>>,
    span: tracing::Span,
}

impl ProxyHandler {
    fn new(
        peer_addr: SocketAddr,
        auth: Arc<AuthPolicy>,
        executor: Arc<dyn RemoteExecutor>,
        span: tracing::Span,
    ) -> Self {
        Self {
            peer_addr,
            auth,
            executor,
            sessions: HashMap::new(),
            span,
        }
    }

    /// Queue a channel request for the channel's session task and reply to it.
    ///
    /// Success is only sent for an accepted request that reached a live session
    /// task. The queue is released once `exec` is queued, so anything that
    /// follows on the channel is refused.
    fn route(&mut self, channel_id: ChannelId, request: SessionRequest, session: &mut Session) {
        let accepted = request.is_accepted();
        let is_exec = matches!(request, SessionRequest::Exec { .. });
        let kind = request.kind().to_string();

        let delivered = match self.sessions.get(&channel_id) {
            Some(queue) => queue.send(request).is_ok(),
            None => false,
        };
        if !delivered || is_exec {
            self.sessions.remove(&channel_id);
        }
        if !delivered {
            tracing::debug!(
                parent: &self.span,
                "refusing {} request for inactive channel {:?}",
                kind,
                channel_id
            );
        }

        if accepted && delivered {
            let _ = session.channel_success(channel_id);
        } else {
            let _ = session.channel_failure(channel_id);
        }
    }
}

impl russh::server::Handler for ProxyHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.auth.permits(user, public_key) {
            tracing::info!(parent: &self.span, "authenticated {} from {}", user, self.peer_addr);
            Ok(Auth::Accept)
        } else {
            tracing::warn!(parent: &self.span, "rejected key for {} from {}", user, self.peer_addr);
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        tracing::debug!(parent: &self.span, "session channel opened: {:?}", channel_id);

        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(channel_id, tx);

        let transport = RusshChannel::new(channel, session.handle());
        let handler = SessionRequestHandler::new(transport, rx, self.executor.clone());
        let span = tracing::info_span!(parent: &self.span, "session", channel = ?channel_id);
        tokio::spawn(handler.run().instrument(span));

        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // russh answers a refused open of a channel type it knows with
        // SSH_OPEN_ADMINISTRATIVELY_PROHIBITED.
        tracing::info!(
            parent: &self.span,
            "rejecting direct-tcpip channel {:?}: only session channels are served",
            channel.id()
        );
        Ok(false)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the queue ends a session that is still waiting for `exec`.
        self.sessions.remove(&channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            parent: &self.span,
            "discarding tcpip-forward global request for {}:{}",
            address,
            port
        );
        Ok(false)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = SessionRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.route(channel, request, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match std::str::from_utf8(data) {
            Ok(command) => {
                let request = SessionRequest::Exec {
                    command: command.to_string(),
                };
                self.route(channel, request, session);
            }
            Err(e) => {
                tracing::warn!(
                    parent: &self.span,
                    "skipping exec request with malformed command: {}",
                    e
                );
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, SessionRequest::unknown("shell"), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(parent: &self.span, "subsystem {} is not served by this proxy", name);
        self.route(channel, SessionRequest::unknown("subsystem"), session);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, SessionRequest::unknown("pty-req"), session);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, SessionRequest::unknown("x11-req"), session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, SessionRequest::unknown("window-change"), session);
        Ok(())
    }
}
