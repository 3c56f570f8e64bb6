use std::io;

use nix::libc;
use nix::sys::termios::{self, SetArg, Termios};

/// Puts stdin in raw mode and restores the saved settings on drop.
pub struct RawModeGuard {
    original: Option<Termios>,
}

impl RawModeGuard {
    /// Stays inert when stdin is not a terminal
    pub fn enter() -> Self {
        let stdin = io::stdin();
        let original = termios::tcgetattr(&stdin).ok();
        if let Some(ref original) = original {
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
                tracing::warn!(error = %e, "failed to enter raw mode");
            }
        }
        Self { original }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(ref original) = self.original {
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSANOW, original);
        }
    }
}

/// Current terminal size as (rows, cols)
pub fn terminal_size() -> io::Result<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    if ws.ws_row == 0 || ws.ws_col == 0 {
        return Err(io::Error::other("terminal reported a zero size"));
    }
    Ok((ws.ws_row, ws.ws_col))
}
