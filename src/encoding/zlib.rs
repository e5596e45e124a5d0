//! Zlib encoding: the translated pixel stream of a rectangle, deflated
//! through a per-session persistent stream and framed with a 4-byte
//! big-endian length.

use super::{deflate_sync, EncodeContext};
use crate::translate;
use bytes::{BufMut, BytesMut};
use flate2::Compress;
use std::io;

/// Encodes one rectangle through the session's persistent Zlib stream.
///
/// The dictionary carries across rectangles (sync flush, never reset), so
/// the same `compressor` must be used for every rectangle of a connection
/// until the pixel format changes.
///
/// # Errors
///
/// Propagates deflate failures; the caller falls back towards Raw.
#[allow(clippy::cast_possible_truncation)] // compressed length < 2^32 by UPDATE sizing
pub fn encode_zlib(
    data: &[u8],
    ctx: &EncodeContext,
    compressor: &mut Compress,
) -> io::Result<Vec<u8>> {
    let translated = translate::translate_pixels(data, &ctx.format);
    let compressed = deflate_sync(compressor, &translated)?;

    let mut out = BytesMut::with_capacity(4 + compressed.len());
    out.put_u32(compressed.len() as u32);
    out.extend_from_slice(&compressed);
    Ok(out.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PixelFormat;
    use flate2::{Compression, Decompress, FlushDecompress};

    #[test]
    fn stream_survives_across_rectangles() {
        let ctx = EncodeContext {
            format: PixelFormat::rgbx32(),
            quality_level: 5,
            compress_level: 5,
        };
        let mut compressor = Compress::new(Compression::new(5), true);
        let mut decompressor = Decompress::new(true);

        let frame = vec![0x42u8; 64 * 64 * 4];
        for _ in 0..3 {
            let encoded = encode_zlib(&frame, &ctx, &mut compressor).unwrap();
            let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
            assert_eq!(len, encoded.len() - 4);

            let mut out = vec![0u8; 64 * 64 * 4 + 64];
            let before = decompressor.total_out();
            decompressor
                .decompress(&encoded[4..], &mut out, FlushDecompress::Sync)
                .unwrap();
            let produced = (decompressor.total_out() - before) as usize;
            assert_eq!(produced, 64 * 64 * 4);
            // Translated pixels have the padding byte zeroed.
            assert!(out[..produced]
                .chunks_exact(4)
                .all(|px| px == [0x42, 0x42, 0x42, 0x00]));
        }
    }
}
