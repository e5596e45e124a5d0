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

//! Hextile encoding: 16x16 tiles, each with its own subencoding flags.
//!
//! Tile classification: one colour -> solid (background possibly reused
//! from the previous tile), two colours -> monochrome subrectangles,
//! more -> coloured subrectangles when they beat the raw tile size, raw
//! otherwise. The tile encoder is shared with ZlibHex, which wraps the
//! same tiles in deflated framing.

use super::common::{
    canonical_pixels, dominant_color, extract_tile, find_subrects, put_pixel, solid_color,
};
use super::{EncodeContext, Encoder};
use crate::protocol::{
    PixelFormat, HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED,
    HEXTILE_FOREGROUND_SPECIFIED, HEXTILE_RAW, HEXTILE_SUBRECTS_COLOURED,
};
use bytes::{BufMut, BytesMut};

/// Background/foreground carried across consecutive tiles so solid runs
/// cost a single flag byte.
#[derive(Default)]
pub(crate) struct TileState {
    last_bg: Option<u32>,
    last_fg: Option<u32>,
}

/// Encodes one tile (<= 16x16). Returns the subencoding byte and the tile
/// body; the body of a raw tile is the translated pixel data.
#[allow(clippy::cast_possible_truncation)] // tile coords and subrect counts fit u8 here
pub(crate) fn encode_tile(
    pixels: &[u32],
    w: usize,
    h: usize,
    format: &PixelFormat,
    state: &mut TileState,
) -> (u8, BytesMut) {
    let mut body = BytesMut::new();

    if let Some(color) = solid_color(pixels) {
        let mut flags = 0u8;
        if state.last_bg != Some(color) {
            flags |= HEXTILE_BACKGROUND_SPECIFIED;
            put_pixel(&mut body, format, color);
            state.last_bg = Some(color);
        }
        return (flags, body);
    }

    let bg = dominant_color(pixels);
    let subrects = find_subrects(pixels, w, h, bg);
    let two_colors = subrects.iter().all(|sr| sr.color == subrects[0].color);
    let fg = if two_colors { subrects[0].color } else { 0 };

    let px_size = format.bytes_per_pixel();
    let raw_size = w * h * px_size;
    let bg_cost = if state.last_bg == Some(bg) { 0 } else { px_size };
    let fg_cost = if two_colors && state.last_fg != Some(fg) {
        px_size
    } else {
        0
    };
    let body_cost = subrects.len() * if two_colors { 2 } else { px_size + 2 };
    let encoded_size = bg_cost + fg_cost + 1 + body_cost;

    if subrects.is_empty() || subrects.len() > 255 || encoded_size >= raw_size {
        for &px in pixels {
            put_pixel(&mut body, format, px);
        }
        // A raw tile invalidates the carried colours.
        state.last_bg = None;
        state.last_fg = None;
        return (HEXTILE_RAW, body);
    }

    let mut flags = HEXTILE_ANY_SUBRECTS;
    if state.last_bg != Some(bg) {
        flags |= HEXTILE_BACKGROUND_SPECIFIED;
        put_pixel(&mut body, format, bg);
        state.last_bg = Some(bg);
    }

    if two_colors {
        if state.last_fg != Some(fg) {
            flags |= HEXTILE_FOREGROUND_SPECIFIED;
            put_pixel(&mut body, format, fg);
            state.last_fg = Some(fg);
        }
        body.put_u8(subrects.len() as u8);
        for sr in subrects {
            body.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
            body.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
        }
    } else {
        flags |= HEXTILE_SUBRECTS_COLOURED;
        state.last_fg = None;
        body.put_u8(subrects.len() as u8);
        for sr in subrects {
            put_pixel(&mut body, format, sr.color);
            body.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
            body.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
        }
    }
    (flags, body)
}

/// Hextile encoder: row-major 16x16 tile iteration.
pub struct HextileEncoding;

impl Encoder for HextileEncoding {
    fn encode(&self, data: &[u8], width: u16, height: u16, ctx: &EncodeContext) -> BytesMut {
        let pixels = canonical_pixels(data);
        let mut buf = BytesMut::new();
        let mut state = TileState::default();

        for tile_y in (0..usize::from(height)).step_by(16) {
            for tile_x in (0..usize::from(width)).step_by(16) {
                let tw = 16.min(usize::from(width) - tile_x);
                let th = 16.min(usize::from(height) - tile_y);
                let tile = extract_tile(&pixels, width.into(), tile_x, tile_y, tw, th);
                let (flags, body) = encode_tile(&tile, tw, th, &ctx.format, &mut state);
                buf.put_u8(flags);
                buf.extend_from_slice(&body);
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PixelFormat;

    fn ctx() -> EncodeContext {
        EncodeContext {
            format: PixelFormat::rgbx32(),
            quality_level: 5,
            compress_level: 5,
        }
    }

    fn rgba(pixels: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pixels.len() * 4);
        for &px in pixels {
            out.extend_from_slice(&[px as u8, (px >> 8) as u8, (px >> 16) as u8, 0xFF]);
        }
        out
    }

    #[test]
    fn solid_run_reuses_background() {
        // Two 16x16 tiles of the same colour: first tile specifies the
        // background, second tile is a single zero flag byte.
        let data = rgba(&vec![0x0012_3456u32; 32 * 16]);
        let out = HextileEncoding.encode(&data, 32, 16, &ctx());
        assert_eq!(out[0], HEXTILE_BACKGROUND_SPECIFIED);
        assert_eq!(out.len(), 1 + 4 + 1);
        assert_eq!(out[5], 0);
    }

    #[test]
    fn two_color_tile_uses_mono_subrects() {
        let mut pixels = vec![0x0000_0000u32; 16 * 16];
        pixels[0] = 0x00FF_FFFF;
        pixels[1] = 0x00FF_FFFF;
        let data = rgba(&pixels);
        let out = HextileEncoding.encode(&data, 16, 16, &ctx());
        let flags = out[0];
        assert_ne!(flags & HEXTILE_ANY_SUBRECTS, 0);
        assert_ne!(flags & HEXTILE_FOREGROUND_SPECIFIED, 0);
        assert_eq!(flags & HEXTILE_SUBRECTS_COLOURED, 0);
        // bg pixel + fg pixel + count + one packed subrect
        assert_eq!(out.len(), 1 + 4 + 4 + 1 + 2);
        // Subrect at (0,0), 2x1: positions 0x00, size (2-1)<<4 | 0.
        assert_eq!(&out[10..12], &[0x00, 0x10]);
    }

    #[test]
    fn noisy_tile_falls_back_to_raw() {
        let pixels: Vec<u32> = (0..256u32).map(|i| i * 0x0001_0203).collect();
        let data = rgba(&pixels);
        let out = HextileEncoding.encode(&data, 16, 16, &ctx());
        assert_eq!(out[0], HEXTILE_RAW);
        assert_eq!(out.len(), 1 + 256 * 4);
    }
}
