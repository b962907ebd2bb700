//! Event definitions for the application event loop.
//!
//! This module defines the `Event` enum which encapsulates everything that
//! drives the presentation loop: terminal input, poller findings and
//! shutdown requests from the operating system.

use crossterm::event::KeyEvent;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// The poller found a `Running` entry whose process is gone.
    ProcessLost { id: usize, pid: u32 },
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// SIGINT or SIGTERM was delivered to the supervisor itself.
    Shutdown,
}
