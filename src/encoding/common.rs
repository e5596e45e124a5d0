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

//! Helpers shared across the encoding family: canonical pixel views,
//! client-format pixel emission, CPIXEL packing, palette detection,
//! subrectangle extraction, tile iteration and the Tight compact-length
//! form.

use crate::protocol::PixelFormat;
use crate::translate;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// A subrectangle found by [`find_subrects`] (RRE/CoRRE/Hextile).
#[derive(Debug)]
pub struct Subrect {
    /// Canonical colour of the subrectangle (0x00BBGGRR).
    pub color: u32,
    /// X offset inside the enclosing rectangle.
    pub x: u16,
    /// Y offset inside the enclosing rectangle.
    pub y: u16,
    /// Width in pixels.
    pub w: u16,
    /// Height in pixels.
    pub h: u16,
}

/// Collapses canonical R,G,B,X bytes into one u32 per pixel
/// (R in bits 0-7, G in 8-15, B in 16-23; the padding byte is dropped).
#[must_use]
pub fn canonical_pixels(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|px| u32::from(px[0]) | (u32::from(px[1]) << 8) | (u32::from(px[2]) << 16))
        .collect()
}

/// Splits a canonical pixel back into 8-bit R,G,B.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn canonical_rgb(px: u32) -> (u8, u8, u8) {
    (px as u8, (px >> 8) as u8, (px >> 16) as u8)
}

/// Emits one canonical pixel in the client's full pixel format
/// (`bits_per_pixel / 8` bytes, client byte order).
pub fn put_pixel(buf: &mut BytesMut, format: &PixelFormat, px: u32) {
    let (r, g, b) = canonical_rgb(px);
    let value = translate::pack_rgb(r, g, b, format);
    translate::put_packed(buf, value, format);
}

/// CPIXEL width for a format: 3 bytes when a 32 bpp true-colour pixel with
/// depth <= 24 fits its channels in the low three bytes, otherwise the full
/// pixel width.
#[must_use]
pub fn cpixel_size(format: &PixelFormat) -> usize {
    if format.bits_per_pixel == 32
        && format.depth <= 24
        && format.red_shift <= 16
        && format.green_shift <= 16
        && format.blue_shift <= 16
    {
        3
    } else {
        format.bytes_per_pixel()
    }
}

/// Emits one canonical pixel in CPIXEL form: the always-zero byte of a
/// 32 bpp depth-24 pixel is dropped, everything else is sent whole.
pub fn put_cpixel(buf: &mut BytesMut, format: &PixelFormat, px: u32) {
    if cpixel_size(format) != 3 {
        put_pixel(buf, format, px);
        return;
    }
    let (r, g, b) = canonical_rgb(px);
    let value = translate::pack_rgb(r, g, b, format);
    let bytes = if format.big_endian_flag != 0 {
        [(value >> 16) as u8, (value >> 8) as u8, value as u8]
    } else {
        [value as u8, (value >> 8) as u8, (value >> 16) as u8]
    };
    buf.extend_from_slice(&bytes);
}

/// The most frequent colour in a pixel slice. Empty input yields 0.
#[must_use]
pub fn dominant_color(pixels: &[u32]) -> u32 {
    if pixels.is_empty() {
        return 0;
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &px in pixels {
        *counts.entry(px).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map_or(pixels[0], |(color, _)| color)
}

/// Returns the single colour of the slice, or `None` if it is not solid.
#[must_use]
pub fn solid_color(pixels: &[u32]) -> Option<u32> {
    let first = *pixels.first()?;
    pixels.iter().all(|&px| px == first).then_some(first)
}

/// Collects the distinct colours of a slice, most frequent first, giving
/// up as soon as more than `max` are seen (palette detection must abort
/// early on photographic content).
#[must_use]
pub fn build_palette(pixels: &[u32], max: usize) -> Option<Vec<u32>> {
    let mut counts: HashMap<u32, usize> = HashMap::with_capacity(max + 1);
    for &px in pixels {
        *counts.entry(px).or_insert(0) += 1;
        if counts.len() > max {
            return None;
        }
    }
    let mut palette: Vec<(u32, usize)> = counts.into_iter().collect();
    // Sort by frequency, then value, so the palette order is stable.
    palette.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    Some(palette.into_iter().map(|(color, _)| color).collect())
}

/// Greedy subrectangle extraction over the non-background pixels.
/// For each unmarked pixel the larger of the best horizontal-first and
/// vertical-first rectangles of its colour is taken.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // tile dimensions are u16-sized by construction
pub fn find_subrects(pixels: &[u32], width: usize, height: usize, bg: u32) -> Vec<Subrect> {
    let mut subrects = Vec::new();
    let mut taken = vec![false; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if taken[idx] || pixels[idx] == bg {
                continue;
            }
            let color = pixels[idx];

            // Horizontal-first: widest run, then grow downwards.
            let mut run_w = 0;
            for tx in x..width {
                if taken[y * width + tx] || pixels[y * width + tx] != color {
                    break;
                }
                run_w = tx - x + 1;
            }
            let mut run_h = 1;
            'down: for ty in (y + 1)..height {
                for tx in x..(x + run_w) {
                    if taken[ty * width + tx] || pixels[ty * width + tx] != color {
                        break 'down;
                    }
                }
                run_h = ty - y + 1;
            }

            // Vertical-first: tallest run, then grow rightwards.
            let mut col_h = 0;
            for ty in y..height {
                if taken[ty * width + x] || pixels[ty * width + x] != color {
                    break;
                }
                col_h = ty - y + 1;
            }
            let mut col_w = 1;
            'right: for tx in (x + 1)..width {
                for ty in y..(y + col_h) {
                    if taken[ty * width + tx] || pixels[ty * width + tx] != color {
                        break 'right;
                    }
                }
                col_w = tx - x + 1;
            }

            let (w, h) = if col_w * col_h > run_w * run_h {
                (col_w, col_h)
            } else {
                (run_w, run_h)
            };

            for dy in 0..h {
                for dx in 0..w {
                    taken[(y + dy) * width + (x + dx)] = true;
                }
            }
            subrects.push(Subrect {
                color,
                x: x as u16,
                y: y as u16,
                w: w as u16,
                h: h as u16,
            });
        }
    }
    subrects
}

/// Copies a tile out of a row-major pixel array.
#[must_use]
pub fn extract_tile(
    pixels: &[u32],
    stride: usize,
    x: usize,
    y: usize,
    w: usize,
    h: usize,
) -> Vec<u32> {
    let mut tile = Vec::with_capacity(w * h);
    for row in 0..h {
        let start = (y + row) * stride + x;
        tile.extend_from_slice(&pixels[start..start + w]);
    }
    tile
}

/// Tight compact length: 7 bits per byte, low bits first, high bit set
/// while more bytes follow (1-3 bytes, values up to 2^22 - 1).
#[allow(clippy::cast_possible_truncation)]
pub fn put_compact_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else if len < 16384 {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 7) as u8);
    } else {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((((len >> 7) & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 14) as u8);
    }
}
