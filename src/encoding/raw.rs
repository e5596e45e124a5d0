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

//! Raw encoding: translated pixels, verbatim.
//!
//! The mandatory encoding and the terminal fallback when every other
//! encoder fails. For Raw, translation *is* the encoding.

use super::{EncodeContext, Encoder};
use crate::translate;
use bytes::BytesMut;

/// Emits `width * height` translated pixels in client byte order.
pub struct RawEncoding;

impl Encoder for RawEncoding {
    fn encode(&self, data: &[u8], _width: u16, _height: u16, ctx: &EncodeContext) -> BytesMut {
        translate::translate_pixels(data, &ctx.format)
    }
}
