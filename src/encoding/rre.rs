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

//! RRE (Rise-and-Run-length Encoding).
//!
//! A rectangle becomes a background colour plus a list of coloured
//! subrectangles. Payload: `[nSubrects: u32] [bg pixel] (pixel, x: u16,
//! y: u16, w: u16, h: u16)*`.

use super::common::{canonical_pixels, dominant_color, find_subrects, put_pixel};
use super::{EncodeContext, Encoder};
use bytes::{BufMut, BytesMut};

/// RRE encoder. The background is the dominant colour of the rectangle.
pub struct RreEncoding;

impl Encoder for RreEncoding {
    #[allow(clippy::cast_possible_truncation)] // subrect count bounded by pixel count
    fn encode(&self, data: &[u8], width: u16, height: u16, ctx: &EncodeContext) -> BytesMut {
        let pixels = canonical_pixels(data);
        let bg = dominant_color(&pixels);
        let subrects = find_subrects(&pixels, width.into(), height.into(), bg);

        let px_size = ctx.format.bytes_per_pixel();
        let mut buf = BytesMut::with_capacity(4 + px_size + subrects.len() * (px_size + 8));
        buf.put_u32(subrects.len() as u32);
        put_pixel(&mut buf, &ctx.format, bg);
        for sr in subrects {
            put_pixel(&mut buf, &ctx.format, sr.color);
            buf.put_u16(sr.x);
            buf.put_u16(sr.y);
            buf.put_u16(sr.w);
            buf.put_u16(sr.h);
        }
        buf
    }
}
