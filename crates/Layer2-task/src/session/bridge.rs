//! Terminal Bridge - runs an agent CLI attached to a PTY
//!
//! Per session:
//! - a blocking reader copies PTY output into a channel; one output task owns
//!   it, relays every chunk to the user and drives readiness detection
//! - a blocking writer owns the PTY writer; user input and the prompt
//!   injector both send through its channel
//! - an input task routes user keystrokes and escalates repeated Ctrl-C
//! - a resize task forwards `SIGWINCH` sizes to the PTY (unix)
//!
//! Teardown on cancellation or timeout: restore terminal, interrupt the
//! child, wait the grace period, kill.

use crate::provider::ProviderRegistry;
use crate::session::input::InputSource;
use crate::session::interrupt::{InterruptAction, InterruptEscalator, INTERRUPT_BYTE};
use crate::session::readiness::{InjectionPhase, InjectionState, PromptInjector, ReadinessDetector};
use crate::session::terminal::{terminal_size, TerminalGuard};
use crate::session::{AgentSession, SessionRequest, SessionOutcome};
use async_trait::async_trait;
use conduit_foundation::{Error, Result, SessionSettings};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, ExitStatus, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where relayed agent output goes
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

/// Time allowed for the last output to drain after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for a killed child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// PTY size used when the real terminal size is unknown
    pub rows: u16,
    pub cols: u16,
    /// Put the controlling terminal into raw mode during sessions
    pub raw_mode: bool,
    /// Forward terminal resizes to the PTY
    pub forward_resize: bool,
    /// Wait between interrupting the child and killing it
    pub grace_period: Duration,
    /// Wait between the last typed character and Enter
    pub submit_delay: Duration,
    /// Output bytes kept for readiness detection
    pub buffer_limit: usize,
}

impl BridgeConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            rows: settings.rows,
            cols: settings.cols,
            raw_mode: false,
            forward_resize: false,
            grace_period: settings.grace_period(),
            submit_delay: settings.submit_delay(),
            buffer_limit: settings.buffer_limit,
        }
    }

    /// Raw mode and resize forwarding, for a real controlling terminal
    pub fn interactive(mut self) -> Self {
        self.raw_mode = true;
        self.forward_resize = true;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

/// Terminal Bridge
pub struct TerminalBridge {
    providers: Arc<ProviderRegistry>,
    escalator: Arc<InterruptEscalator>,
    input: InputSource,
    output: OutputSink,
    config: BridgeConfig,
}

enum SessionEnd {
    Exited(std::result::Result<std::io::Result<ExitStatus>, tokio::task::JoinError>),
    Cancelled,
    TimedOut,
}

impl TerminalBridge {
    pub fn new(providers: Arc<ProviderRegistry>, input: InputSource, config: BridgeConfig) -> Self {
        Self {
            providers,
            escalator: Arc::new(InterruptEscalator::default()),
            input,
            output: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
            config,
        }
    }

    pub fn with_escalator(mut self, escalator: Arc<InterruptEscalator>) -> Self {
        self.escalator = escalator;
        self
    }

    /// Relay agent output somewhere other than stdout
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = Arc::new(Mutex::new(output));
        self
    }

    fn initial_size(&self) -> PtySize {
        let (rows, cols) = if self.config.raw_mode {
            terminal_size().unwrap_or((self.config.rows, self.config.cols))
        } else {
            (self.config.rows, self.config.cols)
        };
        PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[async_trait]
impl AgentSession for TerminalBridge {
    async fn run(
        &self,
        request: SessionRequest,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::WorkflowCancelled);
        }

        let descriptor = self.providers.get(&request.provider)?.clone();
        let command = descriptor.interactive_command(request.model.as_deref())?;
        let agent = request.agent_id.clone();
        info!(agent = %agent, provider = %descriptor.id, command = %command, "starting agent session");

        // Spawn the child on a fresh PTY
        let pair = native_pty_system()
            .openpty(self.initial_size())
            .map_err(|e| Error::SessionStart(format!("failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &request.working_dir {
            cmd.cwd(dir);
        }
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            Error::SessionStart(format!("failed to spawn '{}': {}", command.program, e))
        })?;
        // Our copy of the slave must go, or the reader never sees EOF
        drop(pair.slave);
        let mut killer = child.clone_killer();
        let master = pair.master;

        let (reader, writer) = match (master.try_clone_reader(), master.take_writer()) {
            (Ok(reader), Ok(writer)) => (reader, writer),
            (Err(e), _) | (_, Err(e)) => {
                let _ = killer.kill();
                return Err(Error::SessionStart(format!("failed to attach to PTY: {}", e)));
            }
        };
        let master: SharedMaster = Arc::new(Mutex::new(master));

        let guard = match TerminalGuard::acquire(self.config.raw_mode) {
            Ok(guard) => Arc::new(guard),
            Err(e) => {
                error!(agent = %agent, "{}", e);
                let _ = killer.kill();
                return Err(e);
            }
        };

        let started = Instant::now();
        let session = cancel.child_token();
        let state = Arc::new(InjectionState::new());

        // PTY writer: single owner, fed by input and injector
        let (pty_tx, pty_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::task::spawn_blocking(move || write_loop(writer, pty_rx));

        // PTY reader -> output task
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::task::spawn_blocking(move || read_loop(reader, out_tx));

        let injector = PromptInjector {
            settle_delay: descriptor.settle_delay,
            keystroke_delay: descriptor.keystroke_delay,
            submit_delay: self.config.submit_delay,
        };
        let mut output_task = tokio::spawn(output_loop(
            out_rx,
            Arc::clone(&self.output),
            ReadinessDetector::new(descriptor.readiness.clone(), self.config.buffer_limit),
            injector,
            request.prompt.clone(),
            Arc::clone(&state),
            pty_tx.clone(),
            session.clone(),
        ));

        let input_task = tokio::spawn(input_loop(
            self.input.clone(),
            Arc::clone(&self.escalator),
            pty_tx.clone(),
            Arc::clone(&guard),
            cancel.clone(),
            session.clone(),
        ));

        let resize_task = if self.config.forward_resize {
            Some(spawn_resize_forwarder(Arc::clone(&master), session.clone()))
        } else {
            None
        };

        let mut waiter = tokio::task::spawn_blocking(move || child.wait());

        let deadline = async {
            match request.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let end = tokio::select! {
            status = &mut waiter => SessionEnd::Exited(status),
            _ = cancel.cancelled() => SessionEnd::Cancelled,
            _ = &mut deadline => SessionEnd::TimedOut,
        };

        if !matches!(end, SessionEnd::Exited(_)) {
            guard.restore();
            let _ = pty_tx.send(vec![INTERRUPT_BYTE]);
            if tokio::time::timeout(self.config.grace_period, &mut waiter)
                .await
                .is_err()
            {
                warn!(agent = %agent, "agent still running after interrupt, killing");
                if let Err(e) = killer.kill() {
                    warn!(agent = %agent, "failed to kill agent: {}", e);
                }
                let _ = tokio::time::timeout(REAP_TIMEOUT, &mut waiter).await;
            }
        }

        // Let the remaining output reach the user, then stop helpers
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut output_task).await.is_err() {
            output_task.abort();
        }
        session.cancel();
        drop(pty_tx);
        let _ = input_task.await;
        if let Some(task) = resize_task {
            let _ = task.await;
        }
        guard.restore();
        drop(master);

        let duration = started.elapsed();
        let prompt_submitted = state.phase() == InjectionPhase::Done;

        match end {
            SessionEnd::Cancelled => {
                info!(agent = %agent, "session cancelled");
                Err(Error::WorkflowCancelled)
            }
            SessionEnd::TimedOut => {
                warn!(agent = %agent, ?duration, "session timed out");
                Err(Error::Timeout(format!(
                    "agent '{}' exceeded {:?}",
                    agent,
                    request.timeout.unwrap_or_default()
                )))
            }
            SessionEnd::Exited(Err(e)) => Err(Error::agent(&agent, format!("wait failed: {}", e))),
            SessionEnd::Exited(Ok(Err(e))) => Err(Error::agent(&agent, format!("wait failed: {}", e))),
            SessionEnd::Exited(Ok(Ok(status))) => {
                let exit_code = status.exit_code();
                info!(agent = %agent, exit_code, ?duration, "agent session ended");
                if status.success() {
                    Ok(SessionOutcome {
                        exit_code,
                        duration,
                        prompt_submitted,
                    })
                } else {
                    Err(Error::agent(&agent, format!("exited with code {}", exit_code)))
                }
            }
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            debug!("PTY write failed: {}", e);
            break;
        }
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the child side closes
            Err(_) => break,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn output_loop(
    mut rx: mpsc::Receiver<Vec<u8>>,
    sink: OutputSink,
    mut detector: ReadinessDetector,
    injector: PromptInjector,
    prompt: String,
    state: Arc<InjectionState>,
    pty_tx: mpsc::UnboundedSender<Vec<u8>>,
    session: CancellationToken,
) {
    let prompt = Arc::new(prompt);
    while let Some(chunk) = rx.recv().await {
        {
            let mut out = sink.lock();
            if let Err(e) = out.write_all(&chunk).and_then(|_| out.flush()) {
                debug!("output relay failed: {}", e);
            }
        }

        if !prompt.is_empty() && detector.observe(&chunk, &state) {
            let injector = injector.clone();
            let prompt = Arc::clone(&prompt);
            let state = Arc::clone(&state);
            let tx = pty_tx.clone();
            let session = session.clone();
            tokio::spawn(async move {
                injector.inject(&prompt, &tx, &state, &session).await;
            });
        }
    }
}

async fn input_loop(
    input: InputSource,
    escalator: Arc<InterruptEscalator>,
    pty_tx: mpsc::UnboundedSender<Vec<u8>>,
    guard: Arc<TerminalGuard>,
    run: CancellationToken,
    session: CancellationToken,
) {
    let mut rx = tokio::select! {
        _ = session.cancelled() => return,
        rx = input.acquire() => rx,
    };

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            chunk = rx.recv() => {
                let Some(bytes) = chunk else { break };
                if route_input(&bytes, &escalator, &pty_tx) == InterruptAction::Abort {
                    guard.restore();
                    if !run.is_cancelled() {
                        info!("repeated interrupt, cancelling workflow");
                        run.cancel();
                    }
                    break;
                }
            }
        }
    }
}

/// Forward user bytes to the PTY, counting interrupts on the way
fn route_input(
    bytes: &[u8],
    escalator: &InterruptEscalator,
    pty_tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> InterruptAction {
    let mut start = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if byte != INTERRUPT_BYTE {
            continue;
        }
        if i > start {
            let _ = pty_tx.send(bytes[start..i].to_vec());
        }
        start = i + 1;
        match escalator.register() {
            InterruptAction::Forward => {
                let _ = pty_tx.send(vec![INTERRUPT_BYTE]);
            }
            InterruptAction::Abort => return InterruptAction::Abort,
        }
    }
    if start < bytes.len() {
        let _ = pty_tx.send(bytes[start..].to_vec());
    }
    InterruptAction::Forward
}

#[cfg(unix)]
fn spawn_resize_forwarder(master: SharedMaster, session: CancellationToken) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut winch = match signal(SignalKind::window_change()) {
            Ok(winch) => winch,
            Err(e) => {
                warn!("failed to register SIGWINCH handler: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                received = winch.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if let Some((rows, cols)) = terminal_size() {
                        let size = PtySize { rows, cols, pixel_width: 0, pixel_height: 0 };
                        if let Err(e) = master.lock().resize(size) {
                            debug!("PTY resize failed: {}", e);
                        }
                    }
                }
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_resize_forwarder(_master: SharedMaster, session: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { session.cancelled().await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_route_input_forwards_plain_bytes() {
        let escalator = InterruptEscalator::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(route_input(b"ls -la\r", &escalator, &tx), InterruptAction::Forward);
        assert_eq!(rx.try_recv().unwrap(), b"ls -la\r".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_input_splits_on_interrupt() {
        let escalator = InterruptEscalator::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(route_input(b"ab\x03cd", &escalator, &tx), InterruptAction::Forward);
        assert_eq!(rx.try_recv().unwrap(), b"ab".to_vec());
        assert_eq!(rx.try_recv().unwrap(), vec![INTERRUPT_BYTE]);
        assert_eq!(rx.try_recv().unwrap(), b"cd".to_vec());
        assert_eq!(escalator.count(), 1);
    }

    #[test]
    fn test_route_input_aborts_on_third_interrupt() {
        let escalator = InterruptEscalator::new(Duration::from_secs(5), 3);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(route_input(b"\x03\x03\x03", &escalator, &tx), InterruptAction::Abort);
        // the first two reach the agent, the third does not
        assert_eq!(rx.try_recv().unwrap(), vec![INTERRUPT_BYTE]);
        assert_eq!(rx.try_recv().unwrap(), vec![INTERRUPT_BYTE]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_config_from_settings() {
        let config = BridgeConfig::default();
        assert!(!config.raw_mode);
        assert_eq!(config.grace_period, Duration::from_millis(500));

        let interactive = config.interactive();
        assert!(interactive.raw_mode && interactive.forward_resize);
    }
}
