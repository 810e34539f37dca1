//! Terminal window size

use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::libc;
use serde::{Deserialize, Serialize};

/// Character grid of a terminal, plus the pixel size some programs query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub pixel_width: u16,
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Whether both character dimensions are set
    ///
    /// Terminals that have never been sized report 0x0.
    pub fn is_set(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }

    /// Size of the terminal behind `fd`, `None` if it is not a terminal
    pub fn query(fd: RawFd) -> Option<Self> {
        // SAFETY: winsize is plain old data
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ writes one winsize through the pointer
        if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } == -1 {
            return None;
        }
        Some(Self::from(ws))
    }

    /// Size of the terminal the current process runs in
    ///
    /// The first sized terminal among stdin, stdout and stderr wins.
    pub fn controlling() -> Option<Self> {
        [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
            .into_iter()
            .filter_map(Self::query)
            .find(Self::is_set)
    }

    /// Set this size on the terminal behind `fd`
    ///
    /// On a pseudo-terminal master the kernel signals the slave's foreground
    /// process group with SIGWINCH.
    pub(crate) fn apply(&self, fd: RawFd) -> nix::Result<()> {
        let ws = libc::winsize::from(*self);
        // SAFETY: TIOCSWINSZ reads one winsize through the pointer
        Errno::result(unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) }).map(drop)
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            cols: ws.ws_col,
            rows: ws.ws_row,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

impl From<WindowSize> for libc::winsize {
    fn from(size: WindowSize) -> Self {
        libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.pixel_width,
            ws_ypixel: size.pixel_height,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn test_default_is_80x24() {
        let size = WindowSize::default();
        assert_eq!(size.to_string(), "80x24");
        assert!(size.is_set());
    }

    #[test]
    fn test_unset_window_size() {
        assert!(!WindowSize::new(0, 0).is_set());
        assert!(!WindowSize::new(80, 0).is_set());
    }

    #[test]
    fn test_pixels_survive_winsize_conversion() {
        let size = WindowSize {
            cols: 120,
            rows: 40,
            pixel_width: 960,
            pixel_height: 640,
        };
        let ws = libc::winsize::from(size);
        assert_eq!((ws.ws_col, ws.ws_row), (120, 40));
        assert_eq!(WindowSize::from(ws), size);
    }

    #[test]
    fn test_query_on_non_terminal() {
        let file = tempfile::tempfile().unwrap();
        assert_eq!(WindowSize::query(file.as_raw_fd()), None);
        assert_eq!(
            WindowSize::new(10, 10).apply(file.as_raw_fd()),
            Err(Errno::ENOTTY)
        );
    }

    #[test]
    fn test_pixels_default_in_json() {
        let size: WindowSize = serde_json::from_str(r#"{ "cols": 100, "rows": 30 }"#).unwrap();
        assert_eq!(size, WindowSize::new(100, 30));
    }
}
