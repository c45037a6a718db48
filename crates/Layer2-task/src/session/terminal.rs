//! Controlling terminal mode

use conduit_foundation::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Raw mode for the duration of one session. Restored at most once, either
/// explicitly (interrupt abort, teardown) or on drop.
#[derive(Debug)]
pub struct TerminalGuard {
    raw: bool,
    restored: AtomicBool,
}

impl TerminalGuard {
    /// Enter raw mode when `raw` is set; otherwise a no-op guard
    pub fn acquire(raw: bool) -> Result<Self> {
        if raw {
            crossterm::terminal::enable_raw_mode()
                .map_err(|e| Error::TerminalMode(format!("failed to enable raw mode: {}", e)))?;
            debug!("terminal switched to raw mode");
        }
        Ok(Self {
            raw,
            restored: AtomicBool::new(false),
        })
    }

    /// Restore the terminal. Returns false if it was already restored.
    pub fn restore(&self) -> bool {
        if self.restored.swap(true, Ordering::SeqCst) {
            return false;
        }
        if !self.raw {
            return true;
        }

        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!("failed to restore terminal mode: {}, falling back to stty sane", e);
            let status = std::process::Command::new("stty")
                .arg("sane")
                .stdin(std::process::Stdio::inherit())
                .status();
            if let Err(e) = status {
                warn!("stty sane failed: {}", e);
            }
        } else {
            debug!("terminal restored");
        }
        true
    }

    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Current size of the real terminal as (rows, cols)
pub fn terminal_size() -> Option<(u16, u16)> {
    crossterm::terminal::size().ok().map(|(cols, rows)| (rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_only_once() {
        let guard = TerminalGuard::acquire(false).unwrap();
        assert!(!guard.is_restored());
        assert!(guard.restore());
        assert!(!guard.restore());
        assert!(guard.is_restored());
    }
}
