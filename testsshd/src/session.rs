//! Per-session command handling.
//!
//! A delivered session is either a plain command, which exits 0 right away,
//! or an scp command, which is run as a subprocess with the session's input
//! piped into its stdin. On the scp path the [`FaultController`] is consulted
//! at three stages, in this order:
//!
//! 1. [`Stage::Session`]: before anything is prepared.
//! 2. [`Stage::Pipe`]: after the command and its stdin pipe are set up, before
//!    the process is started.
//! 3. [`Stage::Start`]: after the process is started, before any byte is
//!    forwarded.
//!
//! An injected failure closes the session without an exit status.

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use crate::fault::{FaultController, Stage};

/// Lifecycle controls of the remote session.
pub trait SessionControl: Send + Sync {
    /// Report `code` as the exit status, then send EOF and close.
    fn exit(&self, code: u32) -> impl Future<Output = ()> + Send;

    /// Close abruptly, without an exit status.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not an scp command; exited with 0.
    PlainExit,
    /// Failure injected at the given stage.
    FailedAt(Stage),
    /// The subprocess could not be started.
    StartFailed,
    /// The subprocess ran to completion after receiving `forwarded` bytes.
    /// `interrupted` is set when reading the session input or writing the
    /// subprocess stdin failed part way.
    Completed {
        exit_code: u32,
        forwarded: u64,
        interrupted: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stdin of {0} is not piped")]
    StdinUnavailable(String),
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Split a raw exec request into argv using shell-word rules, without a shell.
/// Unbalanced quoting falls back to plain whitespace splitting.
pub fn parse_command(raw: &str) -> Vec<String> {
    shell_words::split(raw)
        .unwrap_or_else(|_| raw.split_whitespace().map(str::to_string).collect())
}

/// Whether the first token names scp. Substring match, so `/usr/bin/scp`
/// and wrappers like `fake-scp` qualify.
pub fn is_scp(argv: &[String]) -> bool {
    argv.first().is_some_and(|program| program.contains("scp"))
}

/// Map a process exit status onto an SSH exit status.
pub fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return u32::try_from(code).unwrap_or(1);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    1
}

/// One delivered session, bound to the ordinal it was admitted with.
pub struct ScpSession<C> {
    ordinal: u64,
    argv: Vec<String>,
    faults: Arc<FaultController>,
    control: C,
}

impl<C: SessionControl> ScpSession<C> {
    pub fn new(ordinal: u64, argv: Vec<String>, faults: Arc<FaultController>, control: C) -> Self {
        Self {
            ordinal,
            argv,
            faults,
            control,
        }
    }

    /// Drive the session to completion, consuming `input` on the scp path.
    pub async fn run<R>(self, mut input: R) -> Outcome
    where
        R: AsyncRead + Unpin,
    {
        let ordinal = self.ordinal;

        if !is_scp(&self.argv) {
            debug!(ordinal, command = ?self.argv, "Not an scp command, exiting");
            self.control.exit(0).await;
            return Outcome::PlainExit;
        }

        if self.inject(Stage::Session) {
            self.control.close().await;
            return Outcome::FailedAt(Stage::Session);
        }

        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if self.inject(Stage::Pipe) {
            drop(command);
            self.control.close().await;
            return Outcome::FailedAt(Stage::Pipe);
        }

        let (mut child, stdin) = match self.start(command) {
            Ok(started) => started,
            Err(e) => {
                error!(ordinal, "{e}");
                self.control.close().await;
                return Outcome::StartFailed;
            }
        };
        info!(ordinal, command = ?self.argv, pid = ?child.id(), "Started scp subprocess");

        if self.inject(Stage::Start) {
            drop(stdin);
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!(ordinal, ?status, "Reaped scp subprocess"),
                    Err(e) => warn!(ordinal, "Failed to reap scp subprocess: {e}"),
                }
            });
            self.control.close().await;
            return Outcome::FailedAt(Stage::Start);
        }

        let (forwarded, interrupted) = forward(ordinal, &mut input, stdin).await;

        let code = match self.finish(&mut child).await {
            Ok(status) => exit_code(status),
            Err(e) => {
                error!(ordinal, "{e}");
                1
            }
        };
        info!(
            ordinal,
            exit_code = code,
            bytes = forwarded,
            interrupted,
            "scp subprocess finished"
        );

        self.control.exit(code).await;
        Outcome::Completed {
            exit_code: code,
            forwarded,
            interrupted,
        }
    }

    fn inject(&self, stage: Stage) -> bool {
        let fail = self.faults.should_fail(stage, self.ordinal);
        if fail {
            warn!(
                ordinal = self.ordinal,
                %stage,
                fail_after = self.faults.config().fail_after,
                "Injecting failure"
            );
        }
        fail
    }

    fn start(&self, mut command: Command) -> Result<(Child, ChildStdin), SessionError> {
        let program = &self.argv[0];
        let mut child = command.spawn().map_err(|source| SessionError::Start {
            program: program.clone(),
            source,
        })?;
        match child.stdin.take() {
            Some(stdin) => Ok((child, stdin)),
            None => {
                let _ = child.start_kill();
                Err(SessionError::StdinUnavailable(program.clone()))
            }
        }
    }

    async fn finish(&self, child: &mut Child) -> Result<ExitStatus, SessionError> {
        child.wait().await.map_err(|source| SessionError::Wait {
            program: self.argv[0].clone(),
            source,
        })
    }
}

const FORWARD_CHUNK: usize = 32 * 1024;

/// Copy `input` into the subprocess stdin chunk by chunk, then close the pipe.
/// Every chunk read is written before the next read, so bytes received before
/// an input error still reach the subprocess. Returns the byte count and
/// whether the copy stopped on an error.
async fn forward<R>(ordinal: u64, input: &mut R, mut stdin: ChildStdin) -> (u64, bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; FORWARD_CHUNK];
    let mut forwarded = 0u64;
    let result = loop {
        let n = match input.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = stdin.write_all(&buf[..n]).await {
            break Err(e);
        }
        forwarded += n as u64;
    };

    let interrupted = match result {
        Ok(()) => false,
        Err(e) => {
            error!(ordinal, forwarded, "Forwarding session input failed: {e}");
            true
        }
    };
    if let Err(e) = stdin.shutdown().await {
        debug!(ordinal, "Closing subprocess stdin failed: {e}");
    }
    (forwarded, interrupted)
}
