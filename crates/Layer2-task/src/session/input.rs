//! User input source
//!
//! Stdin is read by exactly one thread for the whole process. Sessions (and
//! the variable prompter between sessions) borrow the receiving end, so two
//! consumers never race for the same keystrokes.

use std::io::Read;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Shared receiver of raw input chunks
#[derive(Debug, Clone)]
pub struct InputSource {
    rx: Arc<Mutex<InputReader>>,
}

/// Exclusive view of the input. Bytes left over after a line read are
/// handed out before anything new from the channel.
#[derive(Debug)]
pub struct InputReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl InputReader {
    /// Next chunk of raw input; `None` once the input is closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if !self.pending.is_empty() {
            return Some(std::mem::take(&mut self.pending));
        }
        self.rx.recv().await
    }
}

impl InputSource {
    /// Pump the process stdin on a dedicated thread
    pub fn stdin() -> Self {
        let (tx, source) = Self::channel(64);
        let pump = std::thread::Builder::new()
            .name("conduit-stdin".to_string())
            .spawn(move || {
                let mut stdin = std::io::stdin();
                let mut buf = [0u8; 1024];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                debug!("stdin pump finished");
            });
        if let Err(e) = pump {
            warn!("failed to start stdin pump: {}", e);
        }
        source
    }

    /// Input fed through a channel (tests, embedding)
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                rx: Arc::new(Mutex::new(InputReader {
                    rx,
                    pending: Vec::new(),
                })),
            },
        )
    }

    /// Exclusive access for the lifetime of the guard
    pub async fn acquire(&self) -> OwnedMutexGuard<InputReader> {
        Arc::clone(&self.rx).lock_owned().await
    }

    /// Read one line (cooked mode), without the line terminator.
    /// `None` once the input is closed and nothing is left.
    pub async fn read_line(&self) -> Option<String> {
        let mut reader = self.acquire().await;
        let mut line = Vec::new();
        loop {
            match reader.recv().await {
                Some(chunk) => {
                    line.extend_from_slice(&chunk);
                    if let Some(end) = line.iter().position(|&b| b == b'\n') {
                        reader.pending = line.split_off(end + 1);
                        break;
                    }
                }
                None if line.is_empty() => return None,
                None => break,
            }
        }
        let text = String::from_utf8_lossy(&line);
        Some(text.trim_end_matches(['\r', '\n']).to_string())
    }
}
