//! Server events delivered to the embedding application.

use std::net::SocketAddr;

/// Events emitted by the RFB server over the channel returned by
/// [`crate::RfbServer::new`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A viewer completed the handshake and entered the running state.
    ClientConnected {
        /// Unique client identifier.
        id: usize,
        /// Client's socket address, if known (outbound repeater
        /// connections report the repeater address).
        address: Option<SocketAddr>,
    },

    /// A viewer disconnected or was disconnected.
    ClientDisconnected {
        /// Unique client identifier.
        id: usize,
        /// Human-readable disconnect reason ("closed by peer",
        /// an I/O error string, "server shutdown", ...).
        reason: String,
    },

    /// Pointer movement or button event from a viewer.
    PointerEvent {
        /// Client identifier.
        client_id: usize,
        /// X coordinate in framebuffer space.
        x: u16,
        /// Y coordinate in framebuffer space.
        y: u16,
        /// Button mask (bit 0 = left, bit 1 = middle, bit 2 = right).
        button_mask: u8,
    },

    /// Key press or release event from a viewer.
    KeyEvent {
        /// Client identifier.
        client_id: usize,
        /// Key symbol (X11 keysym).
        keysym: u32,
        /// True if pressed, false if released.
        down: bool,
    },

    /// Clipboard text received from a viewer.
    CutText {
        /// Client identifier.
        client_id: usize,
        /// Clipboard text content.
        text: String,
    },
}
