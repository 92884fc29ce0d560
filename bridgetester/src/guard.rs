//! Terminal state guard for RAII cleanup of the visual/graph display
//! modes: restores the terminal on `Drop` so a panic mid-run never leaves
//! the user's shell in raw/alternate-screen mode.

use crossterm::{
    execute,
    terminal::{disable_raw_mode, LeaveAlternateScreen},
};

pub struct TerminalGuard;

impl TerminalGuard {
    pub fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(std::io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
    }
}
