//! Local terminal handling for interactive shells.

use crate::error::AppResult;
use crossterm::terminal;
use std::io::IsTerminal;
use std::time::Duration;

/// Raw mode on the local terminal, restored on drop.
///
/// Does nothing when stdin is not a terminal.
pub struct RawMode {
    enabled: bool,
}

impl RawMode {
    pub fn enable() -> AppResult<Self> {
        if !std::io::stdin().is_terminal() {
            return Ok(Self { enabled: false });
        }
        terminal::enable_raw_mode()?;
        Ok(Self { enabled: true })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.enabled {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Last size sent to the remote pty; only changes go out.
#[derive(Debug, Default)]
pub struct SizeTracker {
    last: Option<(u16, u16)>,
}

impl SizeTracker {
    /// `(cols, rows)` to send, or `None` when unchanged or degenerate
    pub fn update(&mut self, cols: u16, rows: u16) -> Option<(u32, u32)> {
        if cols == 0 || rows == 0 || self.last == Some((cols, rows)) {
            return None;
        }
        self.last = Some((cols, rows));
        Some((u32::from(cols), u32::from(rows)))
    }
}

/// Push the current size, then every change, to `apply`. Never returns.
///
/// Changes arrive via SIGWINCH on unix and by polling elsewhere.
pub async fn forward_resizes<F: FnMut(u32, u32)>(mut apply: F) {
    let mut tracker = SizeTracker::default();
    let mut push = move || {
        if let Some((cols, rows)) = terminal::size().ok().and_then(|(c, r)| tracker.update(c, r)) {
            tracing::debug!("Local terminal is {}x{}", cols, rows);
            apply(cols, rows);
        }
    };
    push();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut winch) = signal(SignalKind::window_change()) {
            while winch.recv().await.is_some() {
                push();
            }
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        push();
    }
}
