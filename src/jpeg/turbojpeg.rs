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

//! Minimal FFI bridge to libjpeg-turbo's TurboJPEG API.
//!
//! One compress call per rectangle; all pixel buffers stay on the Rust
//! side and the TurboJPEG output buffer is copied out and freed before
//! returning. No handle outlives its [`TurboJpegEncoder`].

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uchar, c_ulong};

/// RGB pixel format (3 bytes per pixel, R first).
pub const TJPF_RGB: c_int = 0;

/// 4:2:2 chrominance subsampling, the Tight encoder's fixed choice.
pub const TJSAMP_422: c_int = 1;

type TjHandle = *mut c_void;

#[link(name = "turbojpeg")]
extern "C" {
    fn tjInitCompress() -> TjHandle;
    fn tjDestroy(handle: TjHandle) -> c_int;
    fn tjCompress2(
        handle: TjHandle,
        src_buf: *const c_uchar,
        width: c_int,
        pitch: c_int,
        height: c_int,
        pixel_format: c_int,
        jpeg_buf: *mut *mut c_uchar,
        jpeg_size: *mut c_ulong,
        jpeg_subsamp: c_int,
        jpeg_qual: c_int,
        flags: c_int,
    ) -> c_int;
    fn tjFree(buffer: *mut c_uchar);
    fn tjGetErrorStr2(handle: TjHandle) -> *const c_char;
}

/// Safe wrapper around a TurboJPEG compression handle.
pub struct TurboJpegEncoder {
    handle: TjHandle,
}

impl TurboJpegEncoder {
    /// Initializes a compression handle.
    ///
    /// # Errors
    ///
    /// Returns an error string when libjpeg-turbo cannot allocate one.
    pub fn new() -> Result<Self, String> {
        let handle = unsafe { tjInitCompress() };
        if handle.is_null() {
            return Err("tjInitCompress returned null".to_string());
        }
        Ok(Self { handle })
    }

    /// Compresses a packed RGB image (3 bytes per pixel) at the given
    /// quality (1-100) with 4:2:2 subsampling.
    ///
    /// # Errors
    ///
    /// Returns the TurboJPEG error string on failure; the caller falls
    /// back to the lossless Tight path.
    pub fn compress_rgb(
        &mut self,
        rgb: &[u8],
        width: u16,
        height: u16,
        quality: u8,
    ) -> Result<Vec<u8>, String> {
        let expected = usize::from(width) * usize::from(height) * 3;
        if rgb.len() != expected {
            return Err(format!(
                "RGB buffer is {} bytes, expected {expected}",
                rgb.len()
            ));
        }

        let mut jpeg_buf: *mut c_uchar = std::ptr::null_mut();
        let mut jpeg_size: c_ulong = 0;

        let rc = unsafe {
            tjCompress2(
                self.handle,
                rgb.as_ptr(),
                c_int::from(width),
                0, // pitch 0 = width * pixel size
                c_int::from(height),
                TJPF_RGB,
                &mut jpeg_buf,
                &mut jpeg_size,
                TJSAMP_422,
                c_int::from(quality),
                0,
            )
        };

        if rc != 0 {
            return Err(self.error_string());
        }
        if jpeg_buf.is_null() {
            return Err("tjCompress2 returned a null buffer".to_string());
        }

        let jpeg = unsafe { std::slice::from_raw_parts(jpeg_buf, jpeg_size as usize).to_vec() };
        unsafe { tjFree(jpeg_buf) };
        Ok(jpeg)
    }

    fn error_string(&self) -> String {
        unsafe {
            let msg = tjGetErrorStr2(self.handle);
            if msg.is_null() {
                return "unknown TurboJPEG error".to_string();
            }
            std::ffi::CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

impl Drop for TurboJpegEncoder {
    fn drop(&mut self) {
        unsafe {
            tjDestroy(self.handle);
        }
    }
}

unsafe impl Send for TurboJpegEncoder {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_a_small_image() {
        let mut encoder = TurboJpegEncoder::new().unwrap();
        let rgb = vec![200u8; 8 * 8 * 3];
        let jpeg = encoder.compress_rgb(&rgb, 8, 8, 90).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let mut encoder = TurboJpegEncoder::new().unwrap();
        assert!(encoder.compress_rgb(&[0u8; 10], 8, 8, 90).is_err());
    }
}
