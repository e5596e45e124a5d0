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

//! Tight encoding.
//!
//! Per-rectangle dispatch: solid fill for one colour, a 1-bit bitmap for
//! two, an indexed palette for 3-16, and for everything else either JPEG
//! (quality 1-9) or deflated full-colour pixels (quality 0 or >= 10, the
//! lossless regime). Palette and full-colour payloads flow through three
//! persistent zlib streams (0 = full colour, 1 = mono, 2 = indexed) whose
//! dictionaries survive across rectangles; the low nibble of the control
//! byte carries stream-reset notifications after a pixel format change.
//!
//! TightPng shares this dispatch with the photographic path swapped for a
//! PNG payload.

use super::common::{
    build_palette, canonical_pixels, canonical_rgb, put_compact_length, solid_color,
};
use super::{deflate_sync, EncodeContext};
use crate::protocol::{PixelFormat, TIGHT_PNG};
use crate::translate;
use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression};
use std::collections::HashMap;
use std::io;

/// TightVNC quality level 0-9 mapped to libjpeg quality. The 41/42 step
/// between levels 2 and 3 is historical and kept verbatim for
/// compatibility with existing viewers.
pub(crate) const JPEG_QUALITY_MAP: [u8; 10] = [15, 29, 41, 42, 62, 77, 79, 86, 92, 100];

// Control-byte nibbles (shifted left by 4 on the wire).
const TIGHT_EXPLICIT_FILTER: u8 = 0x04;
const TIGHT_FILL: u8 = 0x08;
const TIGHT_JPEG: u8 = 0x09;

const TIGHT_FILTER_PALETTE: u8 = 0x01;

/// Stream id for full-colour payloads.
pub const STREAM_FULL_COLOR: u8 = 0;
/// Stream id for mono bitmap payloads.
pub const STREAM_MONO: u8 = 1;
/// Stream id for indexed palette payloads.
pub const STREAM_INDEXED: u8 = 2;

/// Payloads below this size are sent uncompressed with no length field.
const MIN_TO_COMPRESS: usize = 12;

/// The three persistent deflate streams of one session's Tight encoder,
/// plus the pending reset mask announced to the decoder after a stream
/// recreation.
pub struct TightStreams {
    streams: [Option<Compress>; 4],
    levels: [u8; 4],
    pending_reset: u8,
}

impl Default for TightStreams {
    fn default() -> Self {
        Self::new()
    }
}

impl TightStreams {
    /// Creates the manager with all streams uninitialized.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: [None, None, None, None],
            levels: [0; 4],
            pending_reset: 0,
        }
    }

    /// Drops all stream state. The next rectangle announces the reset to
    /// the decoder through the control-byte low nibble.
    pub fn reset(&mut self) {
        for slot in &mut self.streams {
            *slot = None;
        }
        self.pending_reset = 0x0F;
    }

    fn take_reset_mask(&mut self) -> u8 {
        std::mem::take(&mut self.pending_reset)
    }

    /// Deflates `input` through stream `id`, initializing it lazily at
    /// `level`. A level change after initialization keeps the original
    /// level: recreating the stream would drop the dictionary mid-session
    /// and corrupt the client's decoder state.
    fn compress(&mut self, id: u8, level: u8, input: &[u8]) -> io::Result<Vec<u8>> {
        let slot = usize::from(id);
        if self.streams[slot].is_none() {
            self.streams[slot] = Some(Compress::new(Compression::new(u32::from(level)), true));
            self.levels[slot] = level;
        }
        deflate_sync(self.streams[slot].as_mut().unwrap(), input)
    }
}

/// A pixel in Tight's palette form: 3 bytes for 32 bpp depth-24 clients
/// (the "Pack24" rule), the full translated pixel otherwise.
fn put_tight_pixel(buf: &mut BytesMut, format: &PixelFormat, px: u32) {
    let (r, g, b) = canonical_rgb(px);
    let value = translate::pack_rgb(r, g, b, format);
    if format.bits_per_pixel == 32 && format.depth <= 24 {
        let bytes = if format.big_endian_flag != 0 {
            [(value >> 16) as u8, (value >> 8) as u8, value as u8]
        } else {
            [value as u8, (value >> 8) as u8, (value >> 16) as u8]
        };
        buf.extend_from_slice(&bytes);
    } else {
        translate::put_packed(buf, value, format);
    }
}

/// Encodes one rectangle as Tight (or TightPng when `png` is set).
pub fn encode_tight(
    data: &[u8],
    width: u16,
    height: u16,
    ctx: &EncodeContext,
    streams: &mut TightStreams,
    png: bool,
) -> BytesMut {
    let reset_mask = streams.take_reset_mask();
    let pixels = canonical_pixels(data);

    if let Some(color) = solid_color(&pixels) {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8((TIGHT_FILL << 4) | reset_mask);
        put_tight_pixel(&mut buf, &ctx.format, color);
        return buf;
    }

    if let Some(palette) = build_palette(&pixels, 16) {
        if palette.len() == 2 {
            return encode_mono(&pixels, width, height, &palette, ctx, streams, reset_mask);
        }
        if palette.len() <= 16 && palette.len() < pixels.len() / 4 {
            return encode_indexed(&pixels, &palette, ctx, streams, reset_mask);
        }
    }

    if png {
        return encode_png(data, width, height, ctx, streams, reset_mask);
    }
    if ctx.quality_level == 0 || ctx.quality_level >= 10 {
        encode_full_color(&pixels, ctx, streams, reset_mask)
    } else {
        encode_jpeg(data, width, height, ctx, streams, reset_mask)
    }
}

/// Mono rectangle: two palette entries and a deflated 1-bit bitmap
/// (stream 1). Control byte 0x50, filter 0x01.
#[allow(clippy::too_many_arguments)]
fn encode_mono(
    pixels: &[u32],
    width: u16,
    height: u16,
    palette: &[u32],
    ctx: &EncodeContext,
    streams: &mut TightStreams,
    reset_mask: u8,
) -> BytesMut {
    // Background is the more frequent colour; build_palette already
    // ordered by frequency.
    let (bg, fg) = (palette[0], palette[1]);
    let bitmap = mono_bitmap(pixels, width, height, bg);

    let mut buf = BytesMut::new();
    buf.put_u8(((STREAM_MONO | TIGHT_EXPLICIT_FILTER) << 4) | reset_mask);
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8(1); // palette size - 1
    put_tight_pixel(&mut buf, &ctx.format, bg);
    put_tight_pixel(&mut buf, &ctx.format, fg);

    if bitmap.len() >= MIN_TO_COMPRESS {
        match streams.compress(STREAM_MONO, ctx.compress_level, &bitmap) {
            Ok(compressed) => {
                put_compact_length(&mut buf, compressed.len());
                buf.put_slice(&compressed);
            }
            Err(e) => {
                log::warn!("tight mono stream failed ({e}), sending bitmap uncompressed");
                put_compact_length(&mut buf, bitmap.len());
                buf.put_slice(&bitmap);
            }
        }
    } else {
        buf.put_slice(&bitmap);
    }
    buf
}

/// MSB-first 1-bit bitmap, rows padded to byte boundaries. Zero bits are
/// background.
fn mono_bitmap(pixels: &[u32], width: u16, height: u16, bg: u32) -> Vec<u8> {
    let w = usize::from(width);
    let h = usize::from(height);
    let stride = w.div_ceil(8);
    let mut bitmap = vec![0u8; stride * h];

    for y in 0..h {
        for x in 0..w {
            if pixels[y * w + x] != bg {
                bitmap[y * stride + x / 8] |= 0x80 >> (x % 8);
            }
        }
    }
    bitmap
}

/// Indexed palette rectangle: 3-16 colours, one index byte per pixel,
/// deflated through stream 2. Control byte 0x60, filter 0x01.
#[allow(clippy::cast_possible_truncation)] // palette size <= 16
fn encode_indexed(
    pixels: &[u32],
    palette: &[u32],
    ctx: &EncodeContext,
    streams: &mut TightStreams,
    reset_mask: u8,
) -> BytesMut {
    let index: HashMap<u32, u8> = palette
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i as u8))
        .collect();
    let indices: Vec<u8> = pixels.iter().map(|px| index[px]).collect();

    let mut buf = BytesMut::new();
    buf.put_u8(((STREAM_INDEXED | TIGHT_EXPLICIT_FILTER) << 4) | reset_mask);
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8((palette.len() - 1) as u8);
    for &color in palette {
        put_tight_pixel(&mut buf, &ctx.format, color);
    }

    if indices.len() >= MIN_TO_COMPRESS {
        match streams.compress(STREAM_INDEXED, ctx.compress_level, &indices) {
            Ok(compressed) => {
                put_compact_length(&mut buf, compressed.len());
                buf.put_slice(&compressed);
            }
            Err(e) => {
                log::warn!("tight indexed stream failed ({e}), sending indices uncompressed");
                put_compact_length(&mut buf, indices.len());
                buf.put_slice(&indices);
            }
        }
    } else {
        buf.put_slice(&indices);
    }
    buf
}

/// Full-colour rectangle: Tight pixels deflated through stream 0.
/// Control byte 0x00, no filter.
fn encode_full_color(
    pixels: &[u32],
    ctx: &EncodeContext,
    streams: &mut TightStreams,
    reset_mask: u8,
) -> BytesMut {
    let mut raw = BytesMut::with_capacity(pixels.len() * 3);
    for &px in pixels {
        put_tight_pixel(&mut raw, &ctx.format, px);
    }

    let mut buf = BytesMut::new();
    buf.put_u8((STREAM_FULL_COLOR << 4) | reset_mask);

    if raw.len() >= MIN_TO_COMPRESS {
        match streams.compress(STREAM_FULL_COLOR, ctx.compress_level, &raw) {
            Ok(compressed) => {
                put_compact_length(&mut buf, compressed.len());
                buf.put_slice(&compressed);
            }
            Err(e) => {
                log::warn!("tight full-colour stream failed ({e}), sending pixels uncompressed");
                put_compact_length(&mut buf, raw.len());
                buf.put_slice(&raw);
            }
        }
    } else {
        buf.put_slice(&raw);
    }
    buf
}

/// JPEG rectangle: canonical pixels handed to libjpeg-turbo at 4:2:2
/// subsampling with the mapped quality. Control byte 0x90. A JPEG failure
/// (or a build without the `turbojpeg` feature) degrades to the lossless
/// full-colour path, never to Raw.
fn encode_jpeg(
    data: &[u8],
    width: u16,
    height: u16,
    ctx: &EncodeContext,
    streams: &mut TightStreams,
    reset_mask: u8,
) -> BytesMut {
    #[cfg(feature = "turbojpeg")]
    {
        use crate::jpeg::TurboJpegEncoder;

        let mut rgb = Vec::with_capacity(usize::from(width) * usize::from(height) * 3);
        for px in data.chunks_exact(4) {
            rgb.extend_from_slice(&px[..3]);
        }
        let quality = JPEG_QUALITY_MAP[usize::from(ctx.quality_level.min(9))];

        let jpeg = TurboJpegEncoder::new()
            .and_then(|mut enc| enc.compress_rgb(&rgb, width, height, quality));
        match jpeg {
            Ok(payload) => {
                let mut buf = BytesMut::with_capacity(4 + payload.len());
                buf.put_u8((TIGHT_JPEG << 4) | reset_mask);
                put_compact_length(&mut buf, payload.len());
                buf.put_slice(&payload);
                return buf;
            }
            Err(e) => {
                log::error!("JPEG compression failed ({e}), using full-colour zlib");
            }
        }
    }
    #[cfg(not(feature = "turbojpeg"))]
    {
        let _ = (width, height);
        log::warn!(
            "turbojpeg feature disabled, quality {} request served as full-colour zlib",
            ctx.quality_level
        );
    }
    let pixels = canonical_pixels(data);
    encode_full_color(&pixels, ctx, streams, reset_mask)
}

/// PNG rectangle for TightPng: canonical pixels as an RGB PNG.
/// Subencoding nibble 0x0A. A PNG failure degrades to the full-colour
/// zlib path so the client never receives a truncated payload.
fn encode_png(
    data: &[u8],
    width: u16,
    height: u16,
    ctx: &EncodeContext,
    streams: &mut TightStreams,
    reset_mask: u8,
) -> BytesMut {
    use png::{BitDepth, ColorType, Encoder};

    let mut rgb = Vec::with_capacity(usize::from(width) * usize::from(height) * 3);
    for px in data.chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
    }

    let mut payload = Vec::new();
    let ok = {
        let mut encoder = Encoder::new(&mut payload, u32::from(width), u32::from(height));
        encoder.set_color(ColorType::Rgb);
        encoder.set_depth(BitDepth::Eight);
        encoder.set_compression(match ctx.compress_level {
            0..=2 => png::Compression::Fast,
            3..=6 => png::Compression::Default,
            _ => png::Compression::Best,
        });
        encoder
            .write_header()
            .and_then(|mut writer| writer.write_image_data(&rgb))
            .is_ok()
    };

    if !ok {
        log::error!("PNG encoding failed, using full-colour zlib");
        let pixels = canonical_pixels(data);
        return encode_full_color(&pixels, ctx, streams, reset_mask);
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u8((TIGHT_PNG << 4) | reset_mask);
    put_compact_length(&mut buf, payload.len());
    buf.put_slice(&payload);
    buf
}
