//! A running core process and the calls made to it.
//!
//! Lifecycle:
//! 1. Spawn the core with stdin, stdout and stderr piped
//! 2. Drain stderr in a background task for the whole lifetime
//! 3. Serve calls one at a time; the blocking message loop runs on the blocking pool
//! 4. On shutdown: `quit`, wait, SIGTERM, wait, SIGKILL, join the stderr reader

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::io::SyncIoBridge;
use tracing::Instrument;

use super::diagnostics::{Diagnostics, StderrBuffer};
use super::error::CoreError;
use super::protocol::{CallObserver, ExchangeError, Protocol, QUIT};
use super::tee::{TeeReader, TeeWriter};
use crate::codec::{Codec, StrCodec};
use crate::config::CoreConfig;
use crate::progress::{CancellationToken, Cancelled, ProgressTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Running,
    Quitting,
    Terminated,
    /// The core died or the response stream lost sync.
    Dead,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Quitting => "quitting",
            Self::Terminated => "terminated",
            Self::Dead => "dead",
        })
    }
}

struct Channels {
    requests: Box<dyn Write + Send>,
    responses: BufReader<Box<dyn Read + Send>>,
}

type CallOutput<T> = (Channels, Result<T, ExchangeError>);

/// Observer living on the blocking side of a call. Positions go back to the
/// caller's tracker over a channel; the token is checked at every message.
struct Relay {
    token: CancellationToken,
    positions: mpsc::UnboundedSender<u64>,
}

impl CallObserver for Relay {
    fn progress(&mut self, position: u64) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            return Err(Cancelled);
        }
        // the receiver only goes away together with the call
        let _ = self.positions.send(position);
        Ok(())
    }
}

pub struct Connection {
    config: CoreConfig,
    child: Child,
    protocol: Arc<Protocol>,
    /// Taken while a call is in flight.
    channels: Option<Channels>,
    stderr: StderrBuffer,
    stderr_reader: Option<JoinHandle<()>>,
    state: ConnectionState,
    span: tracing::Span,
}

impl Connection {
    pub async fn start(config: CoreConfig) -> Result<Self, CoreError> {
        let protocol = Protocol::new().map_err(|e| CoreError::Setup(e.to_string()))?;

        let transcript = match &config.transcript {
            Some(t) => {
                let open = |path: &std::path::Path| {
                    File::create(path).map_err(|e| {
                        CoreError::Setup(format!("cannot create transcript {}: {e}", path.display()))
                    })
                };
                Some((open(&t.requests)?, open(&t.responses)?))
            }
            None => None,
        };

        let args = config.args();
        tracing::info!(executable = %config.executable.display(), ?args, "Spawning core");
        let mut child = Command::new(&config.executable)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CoreError::Spawn {
                executable: config.executable.clone(),
                source,
            })?;

        let span = tracing::info_span!("core", pid = child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Setup("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Setup("stdout not captured".to_string()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::Setup("stderr not captured".to_string()))?;

        let stderr = StderrBuffer::new();
        let stderr_reader = stderr.spawn_reader(stderr_pipe);

        let mut requests: Box<dyn Write + Send> = Box::new(SyncIoBridge::new(stdin));
        let mut responses: Box<dyn Read + Send> = Box::new(SyncIoBridge::new(stdout));
        if let Some((req_file, resp_file)) = transcript {
            requests = Box::new(TeeWriter::new(requests, req_file));
            responses = Box::new(TeeReader::new(responses, resp_file));
        }

        let mut conn = Self {
            config,
            child,
            protocol: Arc::new(protocol),
            channels: Some(Channels {
                requests,
                responses: BufReader::new(responses),
            }),
            stderr,
            stderr_reader: Some(stderr_reader),
            state: ConnectionState::Starting,
            span,
        };
        conn.set_state(ConnectionState::Running);
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Everything the core wrote to stderr so far.
    pub fn stderr_contents(&self) -> String {
        self.stderr.contents()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(parent: &self.span, from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }

    /// Run `operation` on the core.
    ///
    /// Progress reported by the core moves `tracker`; cancelling the tracker's
    /// token aborts the call, first softly (at the next progress message) and,
    /// after the configured grace period, by killing the core.
    pub async fn call<Q, A>(
        &mut self,
        operation: &str,
        request_codec: &Q,
        request: &Q::Value,
        response_codec: A,
        tracker: &mut ProgressTracker,
    ) -> Result<A::Value, CoreError>
    where
        Q: Codec + ?Sized,
        A: Codec + 'static,
        A::Value: Send + 'static,
    {
        if self.state != ConnectionState::Running {
            return Err(CoreError::Unusable(self.state));
        }
        let payload = request_codec
            .encode_to_vec(request)
            .map_err(CoreError::Request)?;
        let Some(mut channels) = self.channels.take() else {
            return Err(CoreError::Unusable(self.state));
        };

        tracing::debug!(parent: &self.span, operation, bytes = payload.len(), "Calling core");

        let protocol = self.protocol.clone();
        let operation_name = operation.to_string();
        let token = tracker.token().clone();
        let (positions, mut progress) = mpsc::unbounded_channel();
        let mut observer = Relay {
            token: token.clone(),
            positions,
        };
        let call_span = tracing::debug_span!(parent: &self.span, "call", operation);

        // Until the call completes the response stream may be out of sync; a
        // call future dropped midway leaves the connection dead.
        self.state = ConnectionState::Dead;

        let mut task = tokio::task::spawn_blocking(move || {
            let _enter = call_span.enter();
            let result = {
                let mut sink = BufWriter::new(&mut channels.requests);
                protocol.exchange(
                    &mut sink,
                    &mut channels.responses,
                    &operation_name,
                    &payload,
                    &response_codec,
                    &mut observer,
                )
            };
            (channels, result)
        });

        let joined = loop {
            tokio::select! {
                joined = &mut task => break Some(joined),
                Some(position) = progress.recv() => {
                    // a cancelled token is handled by the branch below
                    let _ = tracker.set_position(position);
                }
                () = token.cancelled() => break self.abort(&mut task).await,
            }
        };
        while let Ok(position) = progress.try_recv() {
            let _ = tracker.set_position(position);
        }

        let span = self.span.clone();
        self.finish_call(joined, token.is_cancelled())
            .instrument(span)
            .await
    }

    /// Wait for a cancelled call to stop on its own, then kill the core.
    ///
    /// Returns `None` if even killing the core did not end the call; the
    /// blocking task is then abandoned.
    async fn abort<T>(&mut self, task: &mut JoinHandle<T>) -> Option<Result<T, JoinError>> {
        tracing::debug!(parent: &self.span, "Call cancelled, waiting for core to stop");
        if let Ok(joined) = timeout(self.config.abort_grace, &mut *task).await {
            return Some(joined);
        }

        tracing::warn!(parent: &self.span, "Core did not stop in time, killing it");
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(parent: &self.span, error = %e, "kill failed");
        }
        timeout(self.config.quit_timeout, task).await.ok()
    }

    async fn finish_call<T>(
        &mut self,
        joined: Option<Result<CallOutput<T>, JoinError>>,
        cancelled: bool,
    ) -> Result<T, CoreError> {
        let (channels, result) = match joined {
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Core call task failed");
                self.set_state(ConnectionState::Dead);
                return Err(CoreError::TaskFailed(e.to_string()));
            }
            None => {
                tracing::warn!("Abandoning cancelled call that did not terminate");
                self.set_state(ConnectionState::Dead);
                return Err(CoreError::Cancelled);
            }
        };
        self.channels = Some(channels);
        self.state = ConnectionState::Running;

        match result {
            Ok(value) => Ok(value),
            Err(ExchangeError::Remote(failure)) => {
                tracing::debug!(message = %failure.message, "Core reported failure");
                Err(CoreError::Failure(failure))
            }
            Err(ExchangeError::Cancelled(_)) => {
                self.set_state(ConnectionState::Dead);
                Err(CoreError::Cancelled)
            }
            Err(ExchangeError::Closed(_)) if cancelled => {
                self.set_state(ConnectionState::Dead);
                Err(CoreError::Cancelled)
            }
            Err(ExchangeError::Closed(e)) => {
                let diagnostics = self.death_note().await;
                tracing::warn!(error = %e, stderr = %diagnostics.stderr, "Core died");
                self.set_state(ConnectionState::Dead);
                Err(CoreError::Died { diagnostics })
            }
            Err(ExchangeError::Malformed(source)) => {
                let diagnostics = Diagnostics::new(self.stderr.contents());
                tracing::error!(error = %source, "Malformed response from core");
                self.set_state(ConnectionState::Dead);
                Err(CoreError::MalformedResponse {
                    source,
                    diagnostics,
                })
            }
        }
    }

    /// Stderr of a core that just died, read to the end if possible.
    async fn death_note(&mut self) -> Diagnostics {
        if let Some(handle) = self.stderr_reader.as_mut()
            && timeout(self.config.stderr_join_timeout, handle).await.is_ok()
        {
            self.stderr_reader = None;
        }
        Diagnostics::new(self.stderr.contents())
    }

    pub async fn echo(&mut self, text: &str) -> Result<String, CoreError> {
        self.call(
            "echo",
            &StrCodec,
            &text.to_string(),
            StrCodec,
            &mut ProgressTracker::detached(),
        )
        .await
    }

    /// Ask the core to die. Always ends in an error.
    pub async fn crash(&mut self) -> Result<String, CoreError> {
        self.call(
            "crash",
            &StrCodec,
            &"Crash test".to_string(),
            StrCodec,
            &mut ProgressTracker::detached(),
        )
        .await
    }

    /// Ask the core to report a failure. The connection stays usable.
    pub async fn fail(&mut self) -> Result<String, CoreError> {
        self.call(
            "fail",
            &StrCodec,
            &"Failure test".to_string(),
            StrCodec,
            &mut ProgressTracker::detached(),
        )
        .await
    }

    /// Stop the core. Bounded in time and safe to call more than once.
    pub async fn shutdown(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Terminated | ConnectionState::Quitting
        ) {
            return;
        }
        let span = self.span.clone();
        self.shutdown_inner().instrument(span).await;
    }

    async fn shutdown_inner(&mut self) {
        tracing::debug!("Core shutdown");
        let was_dead = self.state == ConnectionState::Dead;
        if !was_dead {
            self.set_state(ConnectionState::Quitting);
        }

        self.send_quit().await;

        let quit_timeout = self.config.quit_timeout;
        match timeout(quit_timeout, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "Core exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for core"),
            Err(_) => {
                tracing::warn!("Core won't quit, terminating");
                self.terminate();
                if timeout(quit_timeout, self.child.wait()).await.is_err() {
                    tracing::error!(
                        "Core does not respond to SIGTERM, killing it and not waiting anymore"
                    );
                    if let Err(e) = self.child.start_kill() {
                        tracing::debug!(error = %e, "kill failed");
                    }
                }
            }
        }

        if let Some(handle) = self.stderr_reader.take() {
            tracing::debug!("Waiting for stderr reader");
            if timeout(self.config.stderr_join_timeout, handle).await.is_err() {
                tracing::warn!("Stderr reader won't quit, leaking it");
            }
        }

        if !was_dead {
            self.set_state(ConnectionState::Terminated);
        }
    }

    /// Write `quit` and close stdin. A dead core makes this fail; that is fine.
    async fn send_quit(&mut self) {
        let Some(mut channels) = self.channels.take() else {
            return;
        };
        let protocol = self.protocol.clone();
        let write = tokio::task::spawn_blocking(move || {
            let result = protocol.write_request(&mut channels.requests, QUIT, &[]);
            drop(channels);
            result
        });
        match timeout(self.config.quit_timeout, write).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                tracing::debug!(error = %e, "Could not send quit, the core is probably dead already");
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Quit task failed"),
            Err(_) => tracing::warn!("Timed out sending quit"),
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id()
            && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        {
            tracing::debug!(error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "terminate failed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Running | ConnectionState::Dead
        ) {
            tracing::debug!(parent: &self.span, "Connection dropped without shutdown, killing core");
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(parent: &self.span, error = %e, "kill failed");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::codec::VarintCodec;

    /// A stand-in core: `/bin/sh -c <script>`.
    fn sh(script: &str) -> CoreConfig {
        CoreConfig::new("/bin/sh")
            .with_arg("-c")
            .with_arg(script)
            .with_quit_timeout(Duration::from_millis(500))
            .with_stderr_join_timeout(Duration::from_millis(500))
            .with_abort_grace(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn echo_answer_after_progress() {
        // Progress(1), Progress(2), AnswerFollows, "hi"
        let mut conn = Connection::start(sh(r"printf '\000\001\000\002\001\002hi'; cat >/dev/null"))
            .await
            .unwrap();
        let mut tracker = ProgressTracker::detached();
        let answer = conn
            .call("echo", &StrCodec, &"hi".to_string(), StrCodec, &mut tracker)
            .await
            .unwrap();
        assert_eq!(answer, "hi");
        assert_eq!(tracker.position(), 2);
        assert_eq!(conn.state(), ConnectionState::Running);
        conn.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn remote_failure_keeps_connection_usable() {
        // Error("boom", []), then Progress(7), AnswerFollows, 42
        let mut conn = Connection::start(sh(
            r"printf '\002\004boom\000'; printf '\000\007\001\052'; cat >/dev/null",
        ))
        .await
        .unwrap();

        let err = conn.fail().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(matches!(err, CoreError::Failure(_)));
        assert_eq!(conn.state(), ConnectionState::Running);

        let value = conn
            .call(
                "count",
                &VarintCodec,
                &1,
                VarintCodec,
                &mut ProgressTracker::detached(),
            )
            .await
            .unwrap();
        assert_eq!(value, 42);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn death_attaches_stderr() {
        let mut conn = Connection::start(sh(
            "echo \"thread 'main' panicked at src/rpc.rs:9:9:\" >&2; echo 'Crash test' >&2; exit 101",
        ))
        .await
        .unwrap();

        let err = conn.crash().await.unwrap_err();
        let CoreError::Died { diagnostics } = &err else {
            panic!("expected death, got {err:?}");
        };
        assert!(diagnostics.stderr.contains("Crash test"));
        insta::assert_snapshot!(err.to_string(), @r"
        core died: thread 'main' panicked at src/rpc.rs:9:9:
        Crash test
        ");
        assert_eq!(conn.state(), ConnectionState::Dead);

        let err = conn.echo("again").await.unwrap_err();
        assert!(matches!(err, CoreError::Unusable(ConnectionState::Dead)));
        conn.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Dead);
    }

    #[tokio::test]
    async fn malformed_response_kills_connection() {
        let mut conn = Connection::start(sh(r"printf '\011'; cat >/dev/null"))
            .await
            .unwrap();
        let err = conn.echo("x").await.unwrap_err();
        assert!(matches!(err, CoreError::MalformedResponse { .. }));
        assert_eq!(err.to_string(), "internal protocol error");
        assert_eq!(conn.state(), ConnectionState::Dead);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut conn = Connection::start(sh("cat >/dev/null")).await.unwrap();
        conn.shutdown().await;
        conn.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Terminated);

        let err = conn.echo("late").await.unwrap_err();
        assert!(matches!(err, CoreError::Unusable(ConnectionState::Terminated)));
    }

    #[tokio::test]
    async fn shutdown_after_core_already_exited() {
        let mut conn = Connection::start(sh("exit 0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        conn.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn shutdown_escalates_to_kill() {
        // ignores quit and SIGTERM
        let mut conn = Connection::start(sh("trap '' TERM; exec sleep 30"))
            .await
            .unwrap();
        let started = Instant::now();
        conn.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = Connection::start(CoreConfig::new("/nonexistent/prest-core"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancelled_call_kills_unresponsive_core() {
        let mut conn = Connection::start(sh("exec sleep 30")).await.unwrap();
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = conn
            .call("simulation", &StrCodec, &String::new(), StrCodec, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Dead);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_call_leaves_connection_dead() {
        let mut conn = Connection::start(sh("exec sleep 30")).await.unwrap();
        let token = CancellationToken::new();
        let notified = Arc::new(AtomicU64::new(0));
        let counter = notified.clone();
        let mut tracker = ProgressTracker::new(token.clone()).with_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let request = String::new();
        let call = conn.call("simulation", &StrCodec, &request, StrCodec, &mut tracker);
        let outcome = tokio::time::timeout(Duration::from_millis(100), call).await;
        assert!(outcome.is_err());
        assert_eq!(conn.state(), ConnectionState::Dead);

        let err = conn.echo("again").await.unwrap_err();
        assert!(matches!(err, CoreError::Unusable(ConnectionState::Dead)));

        // the caller's tracker keeps its token and callback
        tracker.set_work_size(4);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        token.cancel();
        assert!(tracker.is_cancelled());

        let started = Instant::now();
        conn.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn drop_after_core_was_reaped() {
        let mut conn = Connection::start(sh("exit 0")).await.unwrap();
        conn.child.wait().await.unwrap();
        // killing a reaped child fails; dropping must still be quiet
        drop(conn);
    }

    #[tokio::test]
    async fn transcript_records_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let requests = dir.path().join("requests.bin");
        let responses = dir.path().join("responses.bin");
        let config = sh(r"printf '\001\002ok'; cat >/dev/null").with_transcript(&requests, &responses);

        let mut conn = Connection::start(config).await.unwrap();
        assert_eq!(conn.echo("hi").await.unwrap(), "ok");
        conn.shutdown().await;

        assert!(std::fs::read(&requests).unwrap().starts_with(b"\x04echo\x02hi"));
        assert_eq!(std::fs::read(&responses).unwrap(), b"\x01\x02ok");
    }
}
