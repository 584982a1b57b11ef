//! Request handling for one accepted `session` channel.
//!
//! The SSH handler forwards each channel request, in order, to a
//! [`SessionRequestHandler`] running in its own task and answers it. The
//! handler accumulates `env` pairs, runs the single `exec` command through the
//! [`RemoteExecutor`], reports the exit status and closes the channel.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::executor::{BoxedReader, BoxedWriter, RemoteCommand, RemoteExecutor};

/// Extended data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// A channel-scope request, reduced to the kinds this server understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Env { name: String, value: String },
    Exec { command: String },
    Unknown { kind: String },
}

impl SessionRequest {
    pub fn unknown(kind: impl Into<String>) -> Self {
        SessionRequest::Unknown { kind: kind.into() }
    }

    /// Request type name as it appears on the wire.
    pub fn kind(&self) -> &str {
        match self {
            SessionRequest::Env { .. } => "env",
            SessionRequest::Exec { .. } => "exec",
            SessionRequest::Unknown { kind } => kind,
        }
    }

    /// Whether the client gets a success reply for this request.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, SessionRequest::Unknown { .. })
    }
}

/// Environment pairs gathered from `env` requests, in arrival order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionEnvironment {
    pairs: Vec<(String, String)>,
}

impl SessionEnvironment {
    pub fn push(&mut self, name: String, value: String) {
        self.pairs.push((name, value));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.pairs
    }
}

/// Streams a command reads from and writes to.
pub struct CommandStreams {
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
}

/// The transport side of an accepted session channel.
#[async_trait]
pub trait SessionChannel: Send {
    /// Hand out the channel's data streams. Returns `None` once taken.
    fn take_streams(&mut self) -> Option<CommandStreams>;

    async fn send_exit_status(&mut self, code: u32) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// A russh session channel plus the connection handle used to signal on it.
///
/// russh copies every request and data packet of the channel into a bounded
/// queue. A pump task reads that queue for the whole life of the channel so
/// the connection loop never blocks on it, and keeps the data packets as the
/// command's stdin.
pub struct RusshChannel {
    id: ChannelId,
    handle: Handle,
    streams: Option<CommandStreams>,
    pump: JoinHandle<()>,
}

impl RusshChannel {
    pub fn new(channel: Channel<Msg>, handle: Handle) -> Self {
        let id = channel.id();
        let stdout = channel.make_writer_ext(None);
        let stderr = channel.make_writer_ext(Some(SSH_EXTENDED_DATA_STDERR));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_channel(channel, input_tx));

        Self {
            id,
            handle,
            streams: Some(CommandStreams {
                stdin: Box::new(ChannelInput::new(input_rx)),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            }),
            pump,
        }
    }
}

impl Drop for RusshChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Read the channel until the peer closes it. Data before EOF is forwarded to
/// `input`; requests were already answered by the connection handler.
async fn pump_channel(mut channel: Channel<Msg>, input: mpsc::UnboundedSender<Vec<u8>>) {
    let mut input = Some(input);
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                if let Some(tx) = &input {
                    let _ = tx.send(data.to_vec());
                }
            }
            ChannelMsg::Eof => input = None,
            ChannelMsg::Close => break,
            _ => {}
        }
    }
}

/// Stdin of a command: the data packets the peer sent on the channel.
/// Reaches end of file when the peer sends EOF or the channel goes away.
struct ChannelInput {
    chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl ChannelInput {
    fn new(chunks: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            chunks,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl AsyncRead for ChannelInput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.offset >= this.pending.len() {
            match ready!(this.chunks.poll_recv(cx)) {
                Some(chunk) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len() - this.offset);
        buf.put_slice(&this.pending[this.offset..this.offset + n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl SessionChannel for RusshChannel {
    fn take_streams(&mut self) -> Option<CommandStreams> {
        self.streams.take()
    }

    async fn send_exit_status(&mut self, code: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.id, code)
            .await
            .map_err(|_| anyhow!("Failed to send exit status on channel {:?}", self.id))
    }

    async fn close(&mut self) -> Result<()> {
        // The peer may already have closed its side.
        let _ = self.handle.eof(self.id).await;
        self.handle
            .close(self.id)
            .await
            .map_err(|_| anyhow!("Failed to close channel {:?}", self.id))
    }
}

/// Drives one session channel from its first request until it is closed.
pub struct SessionRequestHandler<C: SessionChannel> {
    channel: C,
    requests: mpsc::UnboundedReceiver<SessionRequest>,
    executor: Arc<dyn RemoteExecutor>,
    env: SessionEnvironment,
}

impl<C: SessionChannel> SessionRequestHandler<C> {
    pub fn new(
        channel: C,
        requests: mpsc::UnboundedReceiver<SessionRequest>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            channel,
            requests,
            executor,
            env: SessionEnvironment::default(),
        }
    }

    /// Process requests until an `exec` completes or the request stream ends,
    /// then close the channel.
    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                SessionRequest::Env { name, value } => {
                    tracing::debug!("accepting env request: {}", name);
                    self.env.push(name, value);
                }
                SessionRequest::Exec { command } => {
                    tracing::info!("accepting exec request");
                    self.execute(command).await;
                    break;
                }
                SessionRequest::Unknown { kind } => {
                    tracing::info!("rejecting {} request", kind);
                }
            }
        }

        self.requests.close();
        if let Err(e) = self.channel.close().await {
            tracing::debug!("{}", e);
        }
    }

    async fn execute(&mut self, command: String) {
        if command.is_empty() {
            tracing::debug!("exec request without a command, closing");
            return;
        }

        let Some(streams) = self.channel.take_streams() else {
            tracing::error!("channel streams already consumed, cannot run {}", command);
            return;
        };

        tracing::info!("starting {} with {} environment variable(s)", command, self.env.len());
        let cmd = RemoteCommand {
            command: command.clone(),
            env: std::mem::take(&mut self.env).into_pairs(),
            stdin: streams.stdin,
            stdout: streams.stdout,
            stderr: streams.stderr,
        };

        match self.executor.execute(cmd).await {
            Ok(code) => {
                tracing::info!("{} exited with status {}", command, code);
                if let Err(e) = self.channel.send_exit_status(code).await {
                    tracing::warn!("{}", e);
                }
            }
            Err(e) => {
                tracing::error!("{:#}", anyhow::Error::from(e));
            }
        }
    }
}
