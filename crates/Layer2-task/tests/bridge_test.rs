//! Terminal bridge integration tests against small shell "agents"
//!
//! `cargo test -p conduit-task --test bridge_test`

#![cfg(unix)]

use conduit_foundation::Error;
use conduit_task::session::ReadinessRule;
use conduit_task::{
    AgentSession, BatchInvocation, BridgeConfig, CommandResolver, CommandSpec, InputSource,
    ProviderDescriptor, ProviderRegistry, SessionRequest, TerminalBridge,
};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).to_string()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn shell_agent(id: &str, script: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        id: id.to_string(),
        command: CommandResolver::Fixed(CommandSpec::new("sh").arg("-c").arg(script)),
        model_flag: None,
        batch: BatchInvocation::Command(CommandSpec::new("echo")),
        readiness: ReadinessRule::glyphs(&["ready>"]),
        settle_delay: Duration::ZERO,
        keystroke_delay: Duration::ZERO,
    }
}

struct Harness {
    bridge: TerminalBridge,
    output: Captured,
    input: mpsc::Sender<Vec<u8>>,
}

fn harness() -> Harness {
    let mut registry = ProviderRegistry::new();
    registry.register(shell_agent("echo", "printf 'ready> '; read line; echo got:$line"));
    registry.register(shell_agent("sleeper", "printf 'ready> '; exec sleep 30"));
    registry.register(shell_agent("stubborn", "trap '' INT; printf 'ready> '; exec sleep 30"));
    registry.register(shell_agent("broken", "exit 3"));

    let (input, source) = InputSource::channel(16);
    let output = Captured::default();
    let config = BridgeConfig {
        grace_period: Duration::from_millis(200),
        submit_delay: Duration::from_millis(10),
        ..BridgeConfig::default()
    };
    let bridge = TerminalBridge::new(Arc::new(registry), source, config)
        .with_output(Box::new(output.clone()));

    Harness {
        bridge,
        output,
        input,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prompt_is_injected_once_ready() {
    let h = harness();
    let request = SessionRequest::new("a1", "echo", "hello").with_timeout(Duration::from_secs(10));

    let outcome = h.bridge.run(request, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.prompt_submitted);
    assert!(h.output.text().contains("got:hello"), "output: {}", h.output.text());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_exit_is_agent_error() {
    let h = harness();
    let err = h
        .bridge
        .run(SessionRequest::new("a1", "broken", ""), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentExecution { .. }), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_provider_is_config_error() {
    let h = harness();
    let err = h
        .bridge
        .run(SessionRequest::new("a1", "nope", "x"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_tears_down_session() {
    let h = harness();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = h
        .bridge
        .run(SessionRequest::new("a1", "sleeper", ""), cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancellation());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_kills_agent() {
    let h = harness();
    let request = SessionRequest::new("a1", "stubborn", "").with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let err = h.bridge.run(request, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_triple_interrupt_cancels_run() {
    let h = harness();
    let cancel = CancellationToken::new();
    let input = h.input.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = input.send(vec![0x03, 0x03, 0x03]).await;
    });

    let err = h
        .bridge
        .run(SessionRequest::new("a1", "stubborn", ""), cancel.clone())
        .await
        .unwrap_err();

    assert!(err.is_cancellation(), "{:?}", err);
    assert!(cancel.is_cancelled());
}
