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

//! TightPng encoding (pseudo-encoding -260).
//!
//! Identical dispatch to Tight - solid fill, mono and indexed palettes
//! keep their wire form and their persistent streams - but the
//! photographic path carries a PNG payload (subencoding 0x0A) instead of
//! JPEG. Browser viewers such as noVNC decode the PNG natively.

use super::tight::{encode_tight, TightStreams};
use super::EncodeContext;
use bytes::BytesMut;

/// Encodes one rectangle as TightPng through the session's Tight streams.
pub fn encode_tightpng(
    data: &[u8],
    width: u16,
    height: u16,
    ctx: &EncodeContext,
    streams: &mut TightStreams,
) -> BytesMut {
    encode_tight(data, width, height, ctx, streams, true)
}
