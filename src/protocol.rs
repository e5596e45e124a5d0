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

//! RFB protocol constants and wire structures.
//!
//! Everything in this module is plain data: message type numbers, encoding
//! numbers, the pixel format descriptor and the fixed-size framing helpers
//! used to build `ServerInit` and `FramebufferUpdate` messages. The protocol
//! follows RFC 6143 plus the community extensions this server implements
//! (ZlibHex, TightPng, ContinuousUpdates, the quality/compression
//! pseudo-encodings).
//!
//! # Protocol phases
//!
//! 1. **Version** - both sides exchange a 12-byte version string
//! 2. **Security** - authentication negotiation and execution
//! 3. **Initialization** - ClientInit / ServerInit exchange
//! 4. **Running** - input events in, framebuffer updates out

use crate::error::HandshakeError;
use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// Maximum framebuffer update buffer size in bytes (32 KB).
///
/// Updates larger than this are flushed to the socket in chunks while the
/// rectangle stream is being assembled.
pub const UPDATE_BUF_SIZE: usize = 32768;

/// RFB protocol versions this server can speak.
///
/// The version is negotiated per session: the server advertises its
/// configured maximum and the effective version is the lower of the two
/// sides, with the RFB convention that unknown 3.x minors above 8 clamp to
/// 3.8 and minors 4-6 fall back to 3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// RFB 3.3: the server dictates a single security type as a u32.
    V33,
    /// RFB 3.7: security type list, no SecurityResult for type None.
    V37,
    /// RFB 3.8: security type list, SecurityResult always sent, failure
    /// reason strings.
    V38,
}

impl ProtocolVersion {
    /// The exact 12-byte version string for this version.
    #[must_use]
    pub fn wire_string(self) -> &'static str {
        match self {
            Self::V33 => "RFB 003.003\n",
            Self::V37 => "RFB 003.007\n",
            Self::V38 => "RFB 003.008\n",
        }
    }

    /// Parses a client version string and resolves the session version
    /// against `server_max`.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::ProtocolMismatch`] for malformed strings,
    /// non-3.x majors, and minors below 3.
    pub fn negotiate(client: &[u8; 12], server_max: Self) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(client)
            .ok()
            .filter(|t| t.is_ascii())
            .ok_or_else(|| HandshakeError::ProtocolMismatch("non-ASCII version string".into()))?;
        if !text.starts_with("RFB ") || text.as_bytes()[11] != b'\n' || text.as_bytes()[7] != b'.' {
            return Err(HandshakeError::ProtocolMismatch(format!(
                "malformed version string {text:?}"
            )));
        }
        let major: u16 = text[4..7]
            .parse()
            .map_err(|_| HandshakeError::ProtocolMismatch("bad major version".into()))?;
        let minor: u16 = text[8..11]
            .parse()
            .map_err(|_| HandshakeError::ProtocolMismatch("bad minor version".into()))?;

        if major != 3 || minor < 3 {
            return Err(HandshakeError::ProtocolMismatch(format!(
                "unsupported version {major}.{minor}"
            )));
        }

        // 3.4-3.6 were never standardized; treat them as 3.3 like every
        // other server. Anything above 3.8 clamps to 3.8.
        let client_version = match minor {
            3..=6 => Self::V33,
            7 => Self::V37,
            _ => Self::V38,
        };
        Ok(client_version.min(server_max))
    }
}

// Client-to-Server message types

/// Message type: client requests a change of pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: client announces its supported encodings, ordered by
/// preference. Pseudo-encodings for quality and compression levels arrive
/// through the same list.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: client requests a framebuffer update, incremental or full.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: keyboard event (keysym plus press/release state).
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: pointer position and button state.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: clipboard data from the client.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

/// Message type: client enables or disables continuous updates
/// (`ContinuousUpdates` extension, advertised via pseudo-encoding -313).
pub const CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES: u8 = 150;

// Server-to-Client message types

/// Message type: framebuffer update containing one or more rectangles.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: bell notification.
#[allow(dead_code)]
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: clipboard data from the server.
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

/// Message type: server confirms the `ContinuousUpdates` extension or the
/// end of a continuous-updates phase.
pub const SERVER_MSG_END_OF_CONTINUOUS_UPDATES: u8 = 150;

// Encoding types

/// Raw pixel data. Mandatory for every client, used as the final fallback.
pub const ENCODING_RAW: i32 = 0;

/// Copy an already-decoded rectangle client-side. Never chosen by the
/// dispatch logic; emitted only from the per-session copy queue.
pub const ENCODING_COPYRECT: i32 = 1;

/// Rise-and-Run-length Encoding.
pub const ENCODING_RRE: i32 = 2;

/// Compact RRE with one-byte subrectangle coordinates (tiles <= 255x255).
pub const ENCODING_CORRE: i32 = 4;

/// Hextile: 16x16 tiles with per-tile subencoding flags.
pub const ENCODING_HEXTILE: i32 = 5;

/// Zlib: deflated raw pixel stream with a persistent dictionary.
pub const ENCODING_ZLIB: i32 = 6;

/// Tight: palette/mono/solid/JPEG/zlib with four persistent streams.
pub const ENCODING_TIGHT: i32 = 7;

/// ZlibHex: Hextile framing with deflated tile payloads.
pub const ENCODING_ZLIBHEX: i32 = 8;

/// ZRLE: 64x64 tiles, CPIXEL palettes and run lengths, one deflate stream.
pub const ENCODING_ZRLE: i32 = 16;

/// ZYWRLE: ZRLE preceded by a lossy wavelet transform on canonical pixels.
pub const ENCODING_ZYWRLE: i32 = 17;

/// TightPng: Tight dispatch with the photographic path replaced by PNG.
/// Advertised by clients as pseudo-encoding -260.
pub const ENCODING_TIGHTPNG: i32 = -260;

// Pseudo-encodings

/// Rich cursor shape updates. Accepted from clients, never transmitted.
#[allow(dead_code)]
pub const ENCODING_CURSOR: i32 = -239;

/// Desktop size change notification. Accepted from clients, never
/// transmitted.
#[allow(dead_code)]
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

/// JPEG quality level 0 (lowest quality, highest compression).
pub const ENCODING_QUALITY_LEVEL_0: i32 = -32;

/// JPEG quality level 9 (highest quality).
pub const ENCODING_QUALITY_LEVEL_9: i32 = -23;

/// Compression level 0 (fastest).
pub const ENCODING_COMPRESS_LEVEL_0: i32 = -256;

/// Compression level 9 (densest).
pub const ENCODING_COMPRESS_LEVEL_9: i32 = -247;

/// `ContinuousUpdates` extension marker.
pub const ENCODING_CONTINUOUS_UPDATES: i32 = -313;

// Hextile subencoding flags

/// Hextile: tile is raw pixel data.
pub const HEXTILE_RAW: u8 = 1 << 0;

/// Hextile: a new background colour follows.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 1 << 1;

/// Hextile: a new foreground colour follows.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 1 << 2;

/// Hextile: the tile carries subrectangles.
pub const HEXTILE_ANY_SUBRECTS: u8 = 1 << 3;

/// Hextile: each subrectangle carries its own colour.
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 1 << 4;

// ZlibHex subencoding flags (extend the Hextile set)

/// ZlibHex: raw tile pixels, deflated through the raw stream.
pub const ZLIBHEX_ZLIB_RAW: u8 = 1 << 5;

/// ZlibHex: hextile tile body, deflated through the hex stream.
pub const ZLIBHEX_ZLIB_HEX: u8 = 1 << 6;

/// Tight/TightPng: PNG payload subencoding nibble.
pub const TIGHT_PNG: u8 = 0x0A;

// Security types

/// Security type: no authentication.
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security type: classic VNC challenge-response authentication.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

/// SecurityResult: handshake succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;

/// SecurityResult: handshake failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Describes how pixel values are laid out on the wire for one client.
///
/// The invariants from RFC 6143 apply: channel maxima are `2^n - 1`, shifts
/// place the channels without overlap, and `depth <= bits_per_pixel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel on the wire: 8, 16 or 32.
    pub bits_per_pixel: u8,
    /// Number of useful bits in a pixel value.
    pub depth: u8,
    /// Non-zero if multi-byte pixels are sent big-endian.
    pub big_endian_flag: u8,
    /// Non-zero for true-colour formats. Colour-mapped output is not
    /// supported; see [`PixelFormat::is_valid`].
    pub true_colour_flag: u8,
    /// Maximum red value (`2^n - 1`).
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Left shift of the red channel within the pixel value.
    pub red_shift: u8,
    /// Left shift of the green channel.
    pub green_shift: u8,
    /// Left shift of the blue channel.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The server's canonical format: 32 bpp, depth 24, little-endian
    /// true colour with R in the low byte (R,G,B,X byte order).
    #[must_use]
    pub fn rgbx32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    /// True if this format is byte-identical to the server's canonical
    /// layout, enabling the translation fast path.
    #[must_use]
    pub fn matches_canonical(&self) -> bool {
        self.bits_per_pixel == 32
            && self.big_endian_flag == 0
            && self.true_colour_flag != 0
            && self.red_max == 255
            && self.green_max == 255
            && self.blue_max == 255
            && self.red_shift == 0
            && self.green_shift == 8
            && self.blue_shift == 16
    }

    /// Number of bytes each translated pixel occupies.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel / 8)
    }

    /// Validates the format for use as a session output format.
    ///
    /// Only true-colour output is produced; a colour-mapped request is
    /// reported invalid and the caller keeps the current format, forcing
    /// the client to fall back to `SetPixelFormat` with true colour.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }
        if self.true_colour_flag == 0 {
            return false;
        }

        let bits = |max: u16| -> u32 {
            if max == 0 {
                0
            } else {
                16 - max.leading_zeros()
            }
        };
        // Maxima must be of the form 2^n - 1.
        for max in [self.red_max, self.green_max, self.blue_max] {
            if max == 0 || (u32::from(max) + 1).count_ones() != 1 {
                return false;
            }
        }
        if bits(self.red_max) + bits(self.green_max) + bits(self.blue_max)
            > u32::from(self.depth)
        {
            return false;
        }
        // Channels must fit inside the pixel and not overlap.
        let span = |shift: u8, max: u16| -> Option<u32> {
            if shift >= 32 || u64::from(max) << shift > u64::from(u32::MAX) {
                return None;
            }
            Some(u32::from(max) << shift)
        };
        let (Some(r), Some(g), Some(b)) = (
            span(self.red_shift, self.red_max),
            span(self.green_shift, self.green_max),
            span(self.blue_shift, self.blue_max),
        ) else {
            return false;
        };
        if r & g != 0 || r & b != 0 || g & b != 0 {
            return false;
        }
        let combined = r | g | b;
        if self.bits_per_pixel < 32 && combined >= (1u32 << self.bits_per_pixel) {
            return false;
        }
        true
    }

    /// Serializes the 16-byte wire form (including 3 bytes of padding).
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    /// Reads a 16-byte wire-form pixel format.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if fewer than 16 bytes are available.
    pub fn from_bytes(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short PixelFormat",
            ));
        }
        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// `ServerInit` message: framebuffer geometry, server pixel format and
/// desktop name, sent once after the security handshake.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub width: u16,
    /// Framebuffer height in pixels.
    pub height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name shown in the viewer's title bar.
    pub name: String,
}

impl ServerInit {
    /// Serializes the message: width, height, 16-byte pixel format,
    /// u32 name length, name bytes.
    #[allow(clippy::cast_possible_truncation)] // name length is bounded well below u32::MAX
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        self.pixel_format.write_to(buf);
        let name = self.name.as_bytes();
        buf.put_u32(name.len() as u32);
        buf.put_slice(name);
    }
}

/// Rectangle header inside a `FramebufferUpdate` message.
#[derive(Debug, Clone, Copy)]
pub struct RectHeader {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Rectangle width in pixels.
    pub width: u16,
    /// Rectangle height in pixels.
    pub height: u16,
    /// Encoding number of the payload that follows.
    pub encoding: i32,
}

impl RectHeader {
    /// Writes the 12-byte header: x, y, width, height, encoding.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_matching_38() {
        let v = ProtocolVersion::negotiate(b"RFB 003.008\n", ProtocolVersion::V38).unwrap();
        assert_eq!(v, ProtocolVersion::V38);
    }

    #[test]
    fn negotiate_clamps_to_server_max() {
        let v = ProtocolVersion::negotiate(b"RFB 003.008\n", ProtocolVersion::V33).unwrap();
        assert_eq!(v, ProtocolVersion::V33);
    }

    #[test]
    fn negotiate_treats_unknown_minors_per_convention() {
        let v = ProtocolVersion::negotiate(b"RFB 003.005\n", ProtocolVersion::V38).unwrap();
        assert_eq!(v, ProtocolVersion::V33);
        let v = ProtocolVersion::negotiate(b"RFB 003.889\n", ProtocolVersion::V38).unwrap();
        assert_eq!(v, ProtocolVersion::V38);
    }

    #[test]
    fn negotiate_rejects_old_and_garbage() {
        assert!(ProtocolVersion::negotiate(b"RFB 002.000\n", ProtocolVersion::V38).is_err());
        assert!(ProtocolVersion::negotiate(b"HTTP/1.1 200", ProtocolVersion::V38).is_err());
    }

    #[test]
    fn pixel_format_roundtrip() {
        let pf = PixelFormat::rgbx32();
        let mut buf = BytesMut::new();
        pf.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let parsed = PixelFormat::from_bytes(&mut buf).unwrap();
        assert_eq!(parsed, PixelFormat::rgbx32());
    }

    #[test]
    fn validation_rejects_colour_map_and_overlap() {
        let mut pf = PixelFormat::rgbx32();
        pf.true_colour_flag = 0;
        assert!(!pf.is_valid());

        let mut pf = PixelFormat::rgbx32();
        pf.green_shift = 4; // overlaps red
        assert!(!pf.is_valid());

        let mut pf = PixelFormat::rgbx32();
        pf.bits_per_pixel = 24;
        assert!(!pf.is_valid());
    }

    #[test]
    fn validation_accepts_rgb565() {
        let pf = PixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        };
        assert!(pf.is_valid());
    }
}
