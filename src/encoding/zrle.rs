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

//! ZRLE (Zlib Run-Length Encoding).
//!
//! The rectangle is cut into 64x64 tiles; each tile picks the densest of
//! solid / packed palette / palette RLE / plain RLE / raw CPIXEL, and the
//! concatenated tile stream is deflated through the session's persistent
//! ZRLE stream, framed with a 4-byte big-endian length.
//!
//! ZYWRLE reuses the tile machine below on wavelet-transformed pixels.

use super::common::{
    build_palette, canonical_pixels, cpixel_size, extract_tile, put_cpixel, solid_color,
};
use super::{deflate_sync, EncodeContext};
use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};
use flate2::Compress;
use std::collections::HashMap;
use std::io;

const TILE_SIZE: usize = 64;

/// Counts RLE runs and single pixels in scanline order.
fn analyze_runs(pixels: &[u32]) -> (usize, usize) {
    let mut runs = 0;
    let mut singles = 0;
    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        let mut len = 1;
        while i + len < pixels.len() && pixels[i + len] == color {
            len += 1;
        }
        if len == 1 {
            singles += 1;
        } else {
            runs += 1;
        }
        i += len;
    }
    (runs, singles)
}

/// RFC 6143 run length: `run - 1` as a sum of bytes where every byte but
/// the last is 255.
fn put_run_length(buf: &mut BytesMut, run: usize) {
    let mut remaining = run - 1;
    while remaining >= 255 {
        buf.put_u8(255);
        remaining -= 255;
    }
    buf.put_u8(remaining as u8);
}

/// Encodes one tile, choosing the densest sub-encoding.
#[allow(clippy::cast_possible_truncation)] // palette indices and sizes fit u8
fn encode_tile(buf: &mut BytesMut, pixels: &[u32], w: usize, h: usize, format: &PixelFormat) {
    if let Some(color) = solid_color(pixels) {
        buf.put_u8(1);
        put_cpixel(buf, format, color);
        return;
    }

    let cp = cpixel_size(format);
    let (runs, singles) = analyze_runs(pixels);
    let palette = build_palette(pixels, 127);

    // Raw is the baseline; every candidate must beat the current best.
    let mut best = w * h * cp;
    let mut use_rle = false;
    let mut use_palette = false;

    let plain_rle = (cp + 1) * (runs + singles);
    if plain_rle < best {
        best = plain_rle;
        use_rle = true;
    }

    if let Some(palette) = &palette {
        let size = palette.len();
        let palette_rle = cp * size + 2 * runs + singles;
        if palette_rle < best {
            best = palette_rle;
            use_rle = true;
            use_palette = true;
        }
        if size <= 16 {
            let bits = packed_bits(size);
            let packed = cp * size + h * (w * bits + 7) / 8;
            if packed < best {
                use_rle = false;
                use_palette = true;
            }
        }
    }

    match (use_palette, use_rle) {
        (false, false) => {
            // Raw CPIXELs.
            buf.put_u8(0);
            for &px in pixels {
                put_cpixel(buf, format, px);
            }
        }
        (false, true) => {
            // Plain RLE.
            buf.put_u8(128);
            let mut i = 0;
            while i < pixels.len() {
                let color = pixels[i];
                let mut len = 1;
                while i + len < pixels.len() && pixels[i + len] == color {
                    len += 1;
                }
                put_cpixel(buf, format, color);
                put_run_length(buf, len);
                i += len;
            }
        }
        (true, false) => {
            let palette = palette.unwrap();
            encode_packed_palette(buf, pixels, w, h, &palette, format);
        }
        (true, true) => {
            let palette = palette.unwrap();
            encode_palette_rle(buf, pixels, &palette, format);
        }
    }
}

fn packed_bits(palette_size: usize) -> usize {
    match palette_size {
        0..=2 => 1,
        3..=4 => 2,
        _ => 4,
    }
}

/// Packed palette: indices at 1/2/4 bits per pixel, most significant bits
/// first, every row padded to a byte boundary.
#[allow(clippy::cast_possible_truncation)]
fn encode_packed_palette(
    buf: &mut BytesMut,
    pixels: &[u32],
    w: usize,
    h: usize,
    palette: &[u32],
    format: &PixelFormat,
) {
    buf.put_u8(palette.len() as u8);
    for &color in palette {
        put_cpixel(buf, format, color);
    }
    let index: HashMap<u32, u8> = palette
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i as u8))
        .collect();
    let bits = packed_bits(palette.len());

    for row in 0..h {
        let mut byte = 0u8;
        let mut used = 0;
        for &px in &pixels[row * w..(row + 1) * w] {
            byte |= index[&px] << (8 - used - bits);
            used += bits;
            if used == 8 {
                buf.put_u8(byte);
                byte = 0;
                used = 0;
            }
        }
        if used > 0 {
            buf.put_u8(byte);
        }
    }
}

/// Palette RLE: single pixels as bare indices, runs as `index | 128`
/// followed by the run length.
#[allow(clippy::cast_possible_truncation)]
fn encode_palette_rle(buf: &mut BytesMut, pixels: &[u32], palette: &[u32], format: &PixelFormat) {
    buf.put_u8(128 | palette.len() as u8);
    for &color in palette {
        put_cpixel(buf, format, color);
    }
    let index: HashMap<u32, u8> = palette
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i as u8))
        .collect();

    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        let mut len = 1;
        while i + len < pixels.len() && pixels[i + len] == color {
            len += 1;
        }
        if len == 1 {
            buf.put_u8(index[&color]);
        } else {
            buf.put_u8(index[&color] | 128);
            put_run_length(buf, len);
        }
        i += len;
    }
}

/// Produces the uncompressed tile stream for a rectangle. Shared with
/// ZYWRLE, which feeds wavelet-transformed pixels through the same tiles.
#[must_use]
pub(crate) fn encode_tiles(data: &[u8], width: u16, height: u16, format: &PixelFormat) -> BytesMut {
    let pixels = canonical_pixels(data);
    let mut buf = BytesMut::new();
    for y in (0..usize::from(height)).step_by(TILE_SIZE) {
        for x in (0..usize::from(width)).step_by(TILE_SIZE) {
            let tw = TILE_SIZE.min(usize::from(width) - x);
            let th = TILE_SIZE.min(usize::from(height) - y);
            let tile = extract_tile(&pixels, width.into(), x, y, tw, th);
            encode_tile(&mut buf, &tile, tw, th, format);
        }
    }
    buf
}

/// Encodes one rectangle as ZRLE through the session's persistent stream.
///
/// # Errors
///
/// Propagates deflate failures; the caller falls back towards Raw.
#[allow(clippy::cast_possible_truncation)] // compressed length < 2^32
pub fn encode_zrle(
    data: &[u8],
    width: u16,
    height: u16,
    ctx: &EncodeContext,
    compressor: &mut Compress,
) -> io::Result<Vec<u8>> {
    let tiles = encode_tiles(data, width, height, &ctx.format);
    let compressed = deflate_sync(compressor, &tiles)?;

    let mut out = BytesMut::with_capacity(4 + compressed.len());
    out.put_u32(compressed.len() as u32);
    out.extend_from_slice(&compressed);
    Ok(out.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    /// Reference decoder for the tile sub-encodings this module emits,
    /// assuming 3-byte CPIXELs (canonical 32 bpp depth-24 clients).
    fn decode_tiles(mut buf: &[u8], width: usize, height: usize) -> Vec<u32> {
        let mut out = vec![0u32; width * height];
        let mut ty = 0;
        while ty < height {
            let th = TILE_SIZE.min(height - ty);
            let mut tx = 0;
            while tx < width {
                let tw = TILE_SIZE.min(width - tx);
                let tile = decode_tile(&mut buf, tw, th);
                for row in 0..th {
                    for col in 0..tw {
                        out[(ty + row) * width + (tx + col)] = tile[row * tw + col];
                    }
                }
                tx += tw;
            }
            ty += th;
        }
        assert!(buf.is_empty(), "trailing bytes after tile stream");
        out
    }

    fn get_cpixel(buf: &mut &[u8]) -> u32 {
        let px = u32::from(buf[0]) | (u32::from(buf[1]) << 8) | (u32::from(buf[2]) << 16);
        buf.advance(3);
        px
    }

    fn get_run_length(buf: &mut &[u8]) -> usize {
        let mut len = 1usize;
        loop {
            let byte = buf[0];
            buf.advance(1);
            len += usize::from(byte);
            if byte != 255 {
                return len;
            }
        }
    }

    fn decode_tile(buf: &mut &[u8], w: usize, h: usize) -> Vec<u32> {
        let sub = buf[0];
        buf.advance(1);
        match sub {
            0 => (0..w * h).map(|_| get_cpixel(buf)).collect(),
            1 => {
                let color = get_cpixel(buf);
                vec![color; w * h]
            }
            2..=16 => {
                let palette: Vec<u32> = (0..sub).map(|_| get_cpixel(buf)).collect();
                let bits = packed_bits(palette.len());
                let mut out = Vec::with_capacity(w * h);
                for _ in 0..h {
                    let mut row = Vec::with_capacity(w);
                    let mut used = 0;
                    let mut byte = 0u8;
                    for _ in 0..w {
                        if used == 0 {
                            byte = buf[0];
                            buf.advance(1);
                            used = 8;
                        }
                        let idx = (byte >> (used - bits)) & ((1 << bits) - 1) as u8;
                        used -= bits;
                        row.push(palette[idx as usize]);
                    }
                    out.extend(row);
                }
                out
            }
            128 => {
                let mut out = Vec::with_capacity(w * h);
                while out.len() < w * h {
                    let color = get_cpixel(buf);
                    let len = get_run_length(buf);
                    out.extend(std::iter::repeat(color).take(len));
                }
                assert_eq!(out.len(), w * h);
                out
            }
            _ => {
                let size = usize::from(sub & 127);
                let palette: Vec<u32> = (0..size).map(|_| get_cpixel(buf)).collect();
                let mut out = Vec::with_capacity(w * h);
                while out.len() < w * h {
                    let byte = buf[0];
                    buf.advance(1);
                    let color = palette[usize::from(byte & 127)];
                    if byte & 128 != 0 {
                        let len = get_run_length(buf);
                        out.extend(std::iter::repeat(color).take(len));
                    } else {
                        out.push(color);
                    }
                }
                assert_eq!(out.len(), w * h);
                out
            }
        }
    }

    fn rgba(pixels: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pixels.len() * 4);
        for &px in pixels {
            out.extend_from_slice(&[px as u8, (px >> 8) as u8, (px >> 16) as u8, 0xFF]);
        }
        out
    }

    fn roundtrip(pixels: &[u32], width: usize, height: usize) {
        let data = rgba(pixels);
        let tiles = encode_tiles(
            &data,
            width as u16,
            height as u16,
            &PixelFormat::rgbx32(),
        );
        assert_eq!(decode_tiles(&tiles, width, height), pixels);
    }

    #[test]
    fn solid_rectangle() {
        roundtrip(&vec![0x0012_3456u32; 80 * 70], 80, 70);
    }

    #[test]
    fn two_color_checkerboard() {
        let (w, h) = (66usize, 66usize);
        let pixels: Vec<u32> = (0..w * h)
            .map(|i| if (i / w + i % w) % 2 == 0 { 0x00FF_FFFF } else { 0 })
            .collect();
        roundtrip(&pixels, w, h);
    }

    #[test]
    fn few_color_blocks_use_palette() {
        let (w, h) = (64usize, 64usize);
        let pixels: Vec<u32> = (0..w * h).map(|i| ((i / 97) % 7) as u32 * 0x0020_1008).collect();
        roundtrip(&pixels, w, h);
    }

    #[test]
    fn long_runs_survive_length_encoding() {
        // Runs far beyond 255 pixels exercise the multi-byte run form.
        let (w, h) = (64usize, 40usize);
        let mut pixels = vec![0x0000_00FFu32; w * h];
        for px in pixels.iter_mut().skip(w * h - 5) {
            *px = 0x0000_FF00;
        }
        roundtrip(&pixels, w, h);
    }

    #[test]
    fn photographic_noise_falls_back_to_raw() {
        let (w, h) = (64usize, 8usize);
        let pixels: Vec<u32> = (0..w * h)
            .map(|i| {
                let i = i as u32;
                (i.wrapping_mul(2_654_435_761)) & 0x00FF_FFFF
            })
            .collect();
        roundtrip(&pixels, w, h);
    }
}
