//! The boundary toward the real target: something that can run a command.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A command invocation bound to one session channel's streams.
pub struct RemoteCommand {
    pub command: String,
    /// Environment pairs in the order the client sent them.
    pub env: Vec<(String, String)>,
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    /// Extended data stream, conventionally stderr.
    pub stderr: BoxedWriter,
}

/// Errors that keep a command from producing an exit status.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{command}`")]
    Start {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lost the {0} pipe of the child process")]
    MissingPipe(&'static str),

    #[error("failed waiting for `{command}`")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs commands against the real target.
///
/// Implementations must not return until the command has finished; the
/// returned value is the command's exit status.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, cmd: RemoteCommand) -> Result<u32, ExecError>;
}

/// Runs commands on this machine through a shell.
pub struct LocalExecutor {
    shell: String,
}

impl LocalExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, cmd: RemoteCommand) -> Result<u32, ExecError> {
        let RemoteCommand {
            command,
            env,
            mut stdin,
            mut stdout,
            mut stderr,
        } = cmd;

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&command)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Start {
                command: command.clone(),
                source,
            })?;

        let mut child_stdin = child.stdin.take().ok_or(ExecError::MissingPipe("stdin"))?;
        let mut child_stdout = child.stdout.take().ok_or(ExecError::MissingPipe("stdout"))?;
        let mut child_stderr = child.stderr.take().ok_or(ExecError::MissingPipe("stderr"))?;

        // The client may never send EOF, so stdin is fed from its own task and
        // abandoned once the child exits.
        let feed = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut child_stdin).await {
                tracing::debug!("stdin copy ended: {}", e);
            }
            let _ = child_stdin.shutdown().await;
        });

        let pump_stdout = async {
            tokio::io::copy(&mut child_stdout, &mut stdout).await?;
            stdout.flush().await
        };
        let pump_stderr = async {
            tokio::io::copy(&mut child_stderr, &mut stderr).await?;
            stderr.flush().await
        };

        let (status, out, err) =
            futures::future::join3(child.wait(), pump_stdout, pump_stderr).await;
        feed.abort();

        if let Err(e) = out {
            tracing::warn!("Failed to forward stdout: {}", e);
        }
        if let Err(e) = err {
            tracing::warn!("Failed to forward stderr: {}", e);
        }

        let status = status.map_err(|source| ExecError::Wait { command, source })?;
        Ok(exit_code(status))
    }
}

/// Map a process exit status onto the numeric status reported to the client.
fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    255
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn command(
        text: &str,
        env: &[(&str, &str)],
        input: &[u8],
    ) -> (RemoteCommand, DuplexStream, DuplexStream) {
        let (stdout, stdout_rx) = tokio::io::duplex(64 * 1024);
        let (stderr, stderr_rx) = tokio::io::duplex(64 * 1024);
        let cmd = RemoteCommand {
            command: text.to_string(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            stdin: Box::new(Cursor::new(input.to_vec())),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        };
        (cmd, stdout_rx, stderr_rx)
    }

    async fn read_all(mut stream: DuplexStream) -> String {
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_environment_is_applied() {
        let executor = LocalExecutor::new("/bin/sh");
        let (cmd, stdout, _stderr) = command("echo $FOO", &[("FOO", "bar")], b"");

        let code = executor.execute(cmd).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(read_all(stdout).await, "bar\n");
    }

    #[tokio::test]
    async fn test_later_env_pairs_win() {
        let executor = LocalExecutor::new("/bin/sh");
        let (cmd, stdout, _stderr) = command("echo $FOO", &[("FOO", "one"), ("FOO", "two")], b"");

        executor.execute(cmd).await.unwrap();

        assert_eq!(read_all(stdout).await, "two\n");
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let executor = LocalExecutor::new("/bin/sh");
        let (cmd, _stdout, stderr) = command("echo oops >&2; exit 3", &[], b"");

        let code = executor.execute(cmd).await.unwrap();

        assert_eq!(code, 3);
        assert_eq!(read_all(stderr).await, "oops\n");
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let executor = LocalExecutor::new("/bin/sh");
        let (cmd, stdout, _stderr) = command("cat", &[], b"hello from the orchestrator");

        let code = executor.execute(cmd).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(read_all(stdout).await, "hello from the orchestrator");
    }

    #[tokio::test]
    async fn test_missing_shell_fails_to_start() {
        let executor = LocalExecutor::new("/nonexistent/shell");
        let (cmd, _stdout, _stderr) = command("true", &[], b"");

        let err = executor.execute(cmd).await.unwrap_err();

        assert!(matches!(err, ExecError::Start { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_exit_code() {
        let executor = LocalExecutor::new("/bin/sh");
        let (cmd, _stdout, _stderr) = command("kill -9 $$", &[], b"");

        let code = executor.execute(cmd).await.unwrap();

        assert_eq!(code, 128 + 9);
    }
}
