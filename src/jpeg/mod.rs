//! JPEG support for the Tight photographic path.
//!
//! The bridge to libjpeg-turbo is optional; without the `turbojpeg`
//! feature, Tight serves quality 1-9 requests through its lossless
//! full-colour path instead.

#[cfg(feature = "turbojpeg")]
pub mod turbojpeg;

#[cfg(feature = "turbojpeg")]
pub use turbojpeg::TurboJpegEncoder;
