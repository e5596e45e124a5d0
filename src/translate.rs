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

//! Pixel translation from the canonical framebuffer format to a client's
//! negotiated [`PixelFormat`].
//!
//! The framebuffer always stores 32-bit R,G,B,X pixels. Every encoder
//! operates on translated output (ZYWRLE translates after its wavelet
//! transform, but still through this module), so this is the single place
//! where channel scaling, shifting and endianness are decided.
//!
//! Translation is direct per-pixel computation rather than lookup tables;
//! the optimizer turns the inner loop into a handful of shifts and the code
//! stays independent of the table layout for every (server, client) pair.

use crate::protocol::PixelFormat;
use bytes::BytesMut;

/// Translates canonical R,G,B,X pixel data into the client's format.
///
/// `src` length must be a multiple of 4. The output holds
/// `src.len() / 4 * format.bytes_per_pixel()` bytes.
///
/// The canonical fast path still rewrites the padding byte to zero so that
/// capture alpha never leaks onto the wire.
pub fn translate_pixels(src: &[u8], format: &PixelFormat) -> BytesMut {
    debug_assert_eq!(src.len() % 4, 0, "canonical pixels are 4 bytes each");

    let mut dst = BytesMut::with_capacity(src.len() / 4 * format.bytes_per_pixel());
    if format.matches_canonical() {
        for px in src.chunks_exact(4) {
            dst.extend_from_slice(&[px[0], px[1], px[2], 0]);
        }
        return dst;
    }

    for px in src.chunks_exact(4) {
        let value = pack_rgb(px[0], px[1], px[2], format);
        put_packed(&mut dst, value, format);
    }
    dst
}

/// Packs 8-bit R,G,B components into a client pixel value.
#[must_use]
pub fn pack_rgb(r: u8, g: u8, b: u8, format: &PixelFormat) -> u32 {
    (u32::from(downscale(r, format.red_max)) << format.red_shift)
        | (u32::from(downscale(g, format.green_max)) << format.green_shift)
        | (u32::from(downscale(b, format.blue_max)) << format.blue_shift)
}

/// Appends a packed pixel value honouring the client's width and byte order.
pub fn put_packed(dst: &mut BytesMut, value: u32, format: &PixelFormat) {
    match format.bits_per_pixel {
        8 => dst.extend_from_slice(&[value as u8]),
        16 => {
            let bytes = if format.big_endian_flag != 0 {
                (value as u16).to_be_bytes()
            } else {
                (value as u16).to_le_bytes()
            };
            dst.extend_from_slice(&bytes);
        }
        _ => {
            let bytes = if format.big_endian_flag != 0 {
                value.to_be_bytes()
            } else {
                value.to_le_bytes()
            };
            dst.extend_from_slice(&bytes);
        }
    }
}

/// Recovers 8-bit R,G,B components from a packed client pixel value.
/// Exact inverse of [`pack_rgb`] up to channel-width precision loss.
#[must_use]
pub fn unpack_rgb(value: u32, format: &PixelFormat) -> (u8, u8, u8) {
    let r = (value >> format.red_shift) & u32::from(format.red_max);
    let g = (value >> format.green_shift) & u32::from(format.green_max);
    let b = (value >> format.blue_shift) & u32::from(format.blue_max);
    (
        upscale(r, format.red_max),
        upscale(g, format.green_max),
        upscale(b, format.blue_max),
    )
}

/// Scales an 8-bit component down to the client's channel width.
#[inline]
fn downscale(value: u8, max: u16) -> u16 {
    if max == 255 {
        return u16::from(value);
    }
    if max == 0 {
        return 0;
    }
    ((u32::from(value) * u32::from(max)) / 255) as u16
}

/// Scales a client-width component back up to 8 bits.
#[inline]
#[allow(clippy::cast_possible_truncation)] // value <= max <= u16::MAX, result fits u8
fn upscale(value: u32, max: u16) -> u8 {
    if max == 255 {
        return value as u8;
    }
    if max == 0 {
        return 0;
    }
    ((u64::from(value) * 255) / u64::from(max)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb565() -> PixelFormat {
        PixelFormat {
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
        }
    }

    fn bgr233() -> PixelFormat {
        PixelFormat {
            bits_per_pixel: 8,
            depth: 8,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    #[test]
    fn canonical_fast_path_strips_alpha() {
        let src = [255u8, 0, 0, 255, 0, 255, 0, 128];
        let out = translate_pixels(&src, &PixelFormat::rgbx32());
        assert_eq!(&out[..], &[255, 0, 0, 0, 0, 255, 0, 0]);
    }

    #[test]
    fn pure_red_to_rgb565() {
        let out = translate_pixels(&[255, 0, 0, 0], &rgb565());
        assert_eq!(out.len(), 2);
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 0xF800);
    }

    #[test]
    fn big_endian_16bpp_swaps_bytes() {
        let mut pf = rgb565();
        pf.big_endian_flag = 1;
        let out = translate_pixels(&[255, 0, 0, 0], &pf);
        assert_eq!(u16::from_be_bytes([out[0], out[1]]), 0xF800);
    }

    #[test]
    fn roundtrip_within_channel_precision() {
        // For every format, translating then unpacking must reproduce the
        // original value up to the bits the channel can hold.
        for pf in [PixelFormat::rgbx32(), rgb565(), bgr233()] {
            for &(r, g, b) in &[(0u8, 0u8, 0u8), (255, 255, 255), (255, 128, 64), (17, 201, 99)] {
                let packed = pack_rgb(r, g, b, &pf);
                let (r2, g2, b2) = unpack_rgb(packed, &pf);
                let tol = |max: u16| -> i32 {
                    if max == 255 {
                        0
                    } else {
                        (255 / i32::from(max)) + 1
                    }
                };
                assert!((i32::from(r) - i32::from(r2)).abs() <= tol(pf.red_max));
                assert!((i32::from(g) - i32::from(g2)).abs() <= tol(pf.green_max));
                assert!((i32::from(b) - i32::from(b2)).abs() <= tol(pf.blue_max));
            }
        }
    }

    #[test]
    fn full_scale_components_are_exact() {
        for pf in [rgb565(), bgr233()] {
            let packed = pack_rgb(255, 255, 255, &pf);
            assert_eq!(unpack_rgb(packed, &pf), (255, 255, 255));
            let packed = pack_rgb(0, 0, 0, &pf);
            assert_eq!(unpack_rgb(packed, &pf), (0, 0, 0));
        }
    }
}
