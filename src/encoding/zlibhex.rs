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

//! ZlibHex encoding: Hextile tile structure with deflated payloads.
//!
//! Per the extension, tile subencoding bytes travel uncompressed while the
//! pixel payloads go through two persistent deflate streams: raw tiles
//! through the "raw" stream (flag bit 5), everything else through the
//! "hex" stream (flag bit 6). Each compressed payload is prefixed with a
//! u16 length.

use super::common::{canonical_pixels, extract_tile};
use super::hextile::{encode_tile, TileState};
use super::{deflate_sync, EncodeContext};
use crate::protocol::{HEXTILE_RAW, ZLIBHEX_ZLIB_HEX, ZLIBHEX_ZLIB_RAW};
use bytes::{BufMut, BytesMut};
use flate2::Compress;
use std::io;

/// Encodes one rectangle as ZlibHex through the session's two persistent
/// streams.
///
/// # Errors
///
/// Propagates deflate failures; the caller falls back towards Raw.
#[allow(clippy::cast_possible_truncation)] // tile payloads are < 64KB by construction
pub fn encode_zlibhex(
    data: &[u8],
    width: u16,
    height: u16,
    ctx: &EncodeContext,
    raw_stream: &mut Compress,
    hex_stream: &mut Compress,
) -> io::Result<Vec<u8>> {
    let pixels = canonical_pixels(data);
    let mut buf = BytesMut::new();
    let mut state = TileState::default();

    for tile_y in (0..usize::from(height)).step_by(16) {
        for tile_x in (0..usize::from(width)).step_by(16) {
            let tw = 16.min(usize::from(width) - tile_x);
            let th = 16.min(usize::from(height) - tile_y);
            let tile = extract_tile(&pixels, width.into(), tile_x, tile_y, tw, th);
            let (flags, body) = encode_tile(&tile, tw, th, &ctx.format, &mut state);

            if flags & HEXTILE_RAW != 0 {
                let compressed = deflate_sync(raw_stream, &body)?;
                buf.put_u8(ZLIBHEX_ZLIB_RAW);
                buf.put_u16(compressed.len() as u16);
                buf.extend_from_slice(&compressed);
            } else if body.is_empty() {
                // Solid tile reusing the previous background: flags only.
                buf.put_u8(flags);
            } else {
                let compressed = deflate_sync(hex_stream, &body)?;
                buf.put_u8(flags | ZLIBHEX_ZLIB_HEX);
                buf.put_u16(compressed.len() as u16);
                buf.extend_from_slice(&compressed);
            }
        }
    }
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PixelFormat, HEXTILE_BACKGROUND_SPECIFIED};
    use flate2::{Compression, Decompress, FlushDecompress};

    #[test]
    fn tiles_are_framed_and_decodable() {
        let ctx = EncodeContext {
            format: PixelFormat::rgbx32(),
            quality_level: 5,
            compress_level: 5,
        };
        let mut raw_stream = Compress::new(Compression::new(5), true);
        let mut hex_stream = Compress::new(Compression::new(5), true);

        // One solid 16x16 tile.
        let data = vec![0x10u8; 16 * 16 * 4];
        let out = encode_zlibhex(&data, 16, 16, &ctx, &mut raw_stream, &mut hex_stream).unwrap();

        let flags = out[0];
        assert_ne!(flags & ZLIBHEX_ZLIB_HEX, 0);
        assert_ne!(flags & HEXTILE_BACKGROUND_SPECIFIED, 0);
        let len = u16::from_be_bytes([out[1], out[2]]) as usize;
        assert_eq!(len, out.len() - 3);

        // The hex-stream payload inflates to the background pixel.
        let mut inflater = Decompress::new(true);
        let mut body = vec![0u8; 64];
        inflater
            .decompress(&out[3..], &mut body, FlushDecompress::Sync)
            .unwrap();
        assert_eq!(&body[..4], &[0x10, 0x10, 0x10, 0x00]);
    }
}
