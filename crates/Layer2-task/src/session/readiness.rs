//! Readiness detection and prompt injection
//!
//! The output task owns a [`ReadinessDetector`] and feeds it every PTY chunk.
//! The first time the provider's input prompt is seen the shared
//! [`InjectionState`] moves `NotReady -> Injecting`, and a [`PromptInjector`]
//! types the prompt. The transition happens at most once per session.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pattern test for "the agent's input prompt has rendered"
#[derive(Debug, Clone)]
pub struct ReadinessRule {
    patterns: Vec<String>,
    strip_ansi: bool,
}

impl ReadinessRule {
    /// Match any of `patterns` against the raw output
    pub fn glyphs(patterns: &[&str]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            strip_ansi: false,
        }
    }

    /// Match any of `patterns` after removing ANSI escape sequences
    pub fn stripped_glyphs(patterns: &[&str]) -> Self {
        Self {
            strip_ansi: true,
            ..Self::glyphs(patterns)
        }
    }

    pub fn matches(&self, output: &str) -> bool {
        if self.strip_ansi {
            let clean = strip_ansi_escapes::strip_str(output);
            self.patterns.iter().any(|p| clean.contains(p.as_str()))
        } else {
            self.patterns.iter().any(|p| output.contains(p.as_str()))
        }
    }
}

/// Injection progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPhase {
    NotReady,
    Injecting,
    Done,
}

/// Atomic holder of the [`InjectionPhase`]
#[derive(Debug)]
pub struct InjectionState(AtomicU8);

const NOT_READY: u8 = 0;
const INJECTING: u8 = 1;
const DONE: u8 = 2;

impl InjectionState {
    pub fn new() -> Self {
        Self(AtomicU8::new(NOT_READY))
    }

    pub fn phase(&self) -> InjectionPhase {
        match self.0.load(Ordering::SeqCst) {
            NOT_READY => InjectionPhase::NotReady,
            INJECTING => InjectionPhase::Injecting,
            _ => InjectionPhase::Done,
        }
    }

    /// `NotReady -> Injecting`; false if the session already left `NotReady`
    pub fn begin_injection(&self) -> bool {
        self.0
            .compare_exchange(NOT_READY, INJECTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.0.store(DONE, Ordering::SeqCst);
    }
}

impl Default for InjectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates PTY output until the readiness rule fires
pub struct ReadinessDetector {
    rule: ReadinessRule,
    buffer: String,
    limit: usize,
}

impl ReadinessDetector {
    pub fn new(rule: ReadinessRule, limit: usize) -> Self {
        Self {
            rule,
            buffer: String::new(),
            limit: limit.max(64),
        }
    }

    /// Feed one chunk. Returns true exactly once: when the prompt is first seen
    /// and `state` was still `NotReady`.
    pub fn observe(&mut self, chunk: &[u8], state: &InjectionState) -> bool {
        if state.phase() != InjectionPhase::NotReady {
            return false;
        }

        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        if self.buffer.len() > self.limit {
            let mut start = self.buffer.len() - self.limit;
            while !self.buffer.is_char_boundary(start) {
                start += 1;
            }
            self.buffer.drain(..start);
        }

        if self.rule.matches(&self.buffer) && state.begin_injection() {
            debug!(buffered = self.buffer.len(), "agent input prompt detected");
            self.buffer.clear();
            return true;
        }
        false
    }
}

/// Types a prompt into the PTY like a person would
#[derive(Debug, Clone)]
pub struct PromptInjector {
    pub settle_delay: Duration,
    pub keystroke_delay: Duration,
    pub submit_delay: Duration,
}

impl PromptInjector {
    /// Write `prompt` one character at a time, then Enter. Marks `state`
    /// done on every exit path. Returns false when cancelled or the PTY
    /// writer went away before the prompt was submitted.
    pub async fn inject(
        &self,
        prompt: &str,
        tx: &mpsc::UnboundedSender<Vec<u8>>,
        state: &InjectionState,
        cancel: &CancellationToken,
    ) -> bool {
        let submitted = self.type_prompt(prompt, tx, cancel).await;
        state.finish();
        submitted
    }

    async fn type_prompt(
        &self,
        prompt: &str,
        tx: &mpsc::UnboundedSender<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> bool {
        if !pause(self.settle_delay, cancel).await {
            return false;
        }

        let mut buf = [0u8; 4];
        for ch in prompt.chars() {
            if tx.send(ch.encode_utf8(&mut buf).as_bytes().to_vec()).is_err() {
                return false;
            }
            if !pause(self.keystroke_delay, cancel).await {
                return false;
            }
        }

        if !pause(self.submit_delay, cancel).await {
            return false;
        }
        let submitted = tx.send(b"\r".to_vec()).is_ok();
        debug!(chars = prompt.chars().count(), submitted, "prompt injected");
        submitted
    }
}

/// Sleep unless cancelled first
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
