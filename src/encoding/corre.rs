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

//! CoRRE: RRE with one-byte subrectangle coordinates.
//!
//! Valid only for rectangles up to 255x255; the session splits larger
//! regions into CoRRE-sized tiles before dispatching here.

use super::common::{canonical_pixels, dominant_color, find_subrects, put_pixel};
use super::{EncodeContext, Encoder};
use bytes::{BufMut, BytesMut};

/// CoRRE encoder. Payload: `[nSubrects: u32] [bg pixel]
/// (pixel, x: u8, y: u8, w: u8, h: u8)*`.
pub struct CorreEncoding;

impl Encoder for CorreEncoding {
    #[allow(clippy::cast_possible_truncation)] // coords < 256 by tiling contract
    fn encode(&self, data: &[u8], width: u16, height: u16, ctx: &EncodeContext) -> BytesMut {
        debug_assert!(width <= 255 && height <= 255, "CoRRE tile too large");

        let pixels = canonical_pixels(data);
        let bg = dominant_color(&pixels);
        let subrects = find_subrects(&pixels, width.into(), height.into(), bg);

        let px_size = ctx.format.bytes_per_pixel();
        let mut buf = BytesMut::with_capacity(4 + px_size + subrects.len() * (px_size + 4));
        buf.put_u32(subrects.len() as u32);
        put_pixel(&mut buf, &ctx.format, bg);
        for sr in subrects {
            put_pixel(&mut buf, &ctx.format, sr.color);
            buf.put_u8(sr.x as u8);
            buf.put_u8(sr.y as u8);
            buf.put_u8(sr.w as u8);
            buf.put_u8(sr.h as u8);
        }
        buf
    }
}
