// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # rfbserve
//!
//! An embeddable asynchronous RFB (VNC) server engine.
//!
//! The crate exposes a screen's pixel buffer to remote viewers over the
//! RFB protocol (3.3/3.7/3.8), streams incremental updates through the
//! classic encoding family and forwards pointer, keyboard and clipboard
//! input back to the embedding application.
//!
//! ## Features
//!
//! - **Encodings**: Raw, CopyRect, RRE, CoRRE, Hextile, Zlib, ZlibHex,
//!   ZRLE, ZYWRLE, Tight (JPEG via optional libjpeg-turbo), TightPng
//! - **Pixel formats**: 8/16/32-bit true colour, either endianness
//! - **Persistent compression**: per-session deflate dictionaries
//!   survive across updates as the protocol requires
//! - **Connections**: inbound listener, reverse connections, UltraVNC
//!   repeater rendezvous
//! - **Async**: one tokio task per session; the embedder owns the runtime
//!
//! ## Quick start
//!
//! ```no_run
//! use rfbserve::{RfbServer, ServerConfig, ServerEvent};
//!
//! #[tokio::main]
//! async fn main() -> rfbserve::Result<()> {
//!     rfbserve::init();
//!
//!     let config = ServerConfig {
//!         desktop_name: "demo".into(),
//!         ..ServerConfig::default()
//!     };
//!     let (server, mut events) = RfbServer::new(1280, 720, config);
//!     server.start().await?;
//!
//!     // Push frames: server.update_framebuffer(&pixels, 1280, 720).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let ServerEvent::PointerEvent { x, y, .. } = event {
//!             println!("pointer at {x},{y}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The embedder writes canonical R,G,B,X pixels into the shared
//! [`Framebuffer`] and marks regions dirty; each client session drains
//! its own dirty accumulator at its own pace, translates pixels to the
//! negotiated format, picks an encoding and writes to its socket.
//! CopyRect records always precede the pixel rectangles of a flush.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod framebuffer;
pub mod protocol;
pub mod server;

// Internal modules
mod auth;
mod connector;
mod session;
mod translate;
pub mod encoding;
pub mod jpeg;

// Re-exports
pub use error::{HandshakeError, Result, RfbError};
pub use events::ServerEvent;
pub use framebuffer::{Framebuffer, Rect};
pub use protocol::{PixelFormat, ProtocolVersion};
pub use server::{RfbServer, ServerConfig};

#[cfg(feature = "turbojpeg")]
pub use jpeg::TurboJpegEncoder;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;

/// One-time process-wide setup (logging). Idempotent; safe to call from
/// every embedder entry point.
pub fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}
