//! Framebuffer encoding implementations.
//!
//! One module per wire encoding, plus shared primitives in [`common`].
//! Stateless encoders implement the [`Encoder`] trait and are created
//! through [`encoder_for`]; encodings that keep persistent zlib state
//! (Zlib, ZlibHex, ZRLE, ZYWRLE, Tight) are free functions that borrow the
//! session's stream objects, because a deflate dictionary must survive
//! across rectangles for the lifetime of a connection.
//!
//! Every encoder receives canonical R,G,B,X pixels plus the client's
//! negotiated [`PixelFormat`](crate::protocol::PixelFormat); colour values
//! cross the wire in the client's layout.

use crate::protocol::{
    PixelFormat, ENCODING_CORRE, ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE,
};
use bytes::BytesMut;
use flate2::{Compress, FlushCompress, Status};
use std::io;

pub mod common;
pub mod corre;
pub mod hextile;
pub mod raw;
pub mod rre;
pub mod tight;
pub mod tightpng;
pub mod zlib;
pub mod zlibhex;
pub mod zrle;
pub mod zywrle;

pub use corre::CorreEncoding;
pub use hextile::HextileEncoding;
pub use raw::RawEncoding;
pub use rre::RreEncoding;

/// Per-rectangle encoding parameters snapshotted from the session.
#[derive(Debug, Clone)]
pub struct EncodeContext {
    /// The client's negotiated pixel format.
    pub format: PixelFormat,
    /// TightVNC quality level 0-9 (default 5). Values >= 10 disable JPEG.
    pub quality_level: u8,
    /// Zlib compression level 0-9 (default 5).
    pub compress_level: u8,
}

/// Interface shared by the stateless encodings.
pub trait Encoder {
    /// Encodes one rectangle of canonical R,G,B,X pixels into the
    /// encoding's wire payload (rectangle header excluded).
    fn encode(&self, data: &[u8], width: u16, height: u16, ctx: &EncodeContext) -> BytesMut;
}

/// Returns the stateless encoder for `encoding`, or `None` for encodings
/// that need session stream state (those are dispatched directly by the
/// session update path).
#[must_use]
pub fn encoder_for(encoding: i32) -> Option<Box<dyn Encoder>> {
    match encoding {
        ENCODING_RAW => Some(Box::new(RawEncoding)),
        ENCODING_RRE => Some(Box::new(RreEncoding)),
        ENCODING_CORRE => Some(Box::new(CorreEncoding)),
        ENCODING_HEXTILE => Some(Box::new(HextileEncoding)),
        _ => None,
    }
}

/// Runs `input` through a persistent deflate stream with `Z_SYNC_FLUSH`,
/// returning only the bytes this call produced. The stream dictionary is
/// left intact for the next rectangle, which is what keeps the Zlib-family
/// encodings decodable across updates.
pub(crate) fn deflate_sync(stream: &mut Compress, input: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() / 2 + 64);
    let mut chunk = vec![0u8; 64 * 1024];
    let start_in = stream.total_in();

    loop {
        let consumed = (stream.total_in() - start_in) as usize;
        let before_out = stream.total_out();
        let status = stream
            .compress(&input[consumed..], &mut chunk, FlushCompress::Sync)
            .map_err(io::Error::other)?;
        let produced = (stream.total_out() - before_out) as usize;
        output.extend_from_slice(&chunk[..produced]);

        match status {
            Status::Ok | Status::StreamEnd => {
                let consumed = (stream.total_in() - start_in) as usize;
                // The sync flush is complete once all input is taken and
                // the output buffer was not filled to the brim.
                if consumed >= input.len() && produced < chunk.len() {
                    break;
                }
            }
            Status::BufError => {
                return Err(io::Error::other("deflate buffer error"));
            }
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, Decompress, FlushDecompress};

    pub(crate) fn inflate_all(stream: &mut Decompress, input: &[u8], expected: usize) -> Vec<u8> {
        let mut out = vec![0u8; expected + 64];
        let before = stream.total_out();
        stream
            .decompress(input, &mut out, FlushDecompress::Sync)
            .unwrap();
        let produced = (stream.total_out() - before) as usize;
        out.truncate(produced);
        out
    }

    #[test]
    fn deflate_sync_keeps_dictionary_across_calls() {
        let mut enc = Compress::new(Compression::new(5), true);
        let mut dec = Decompress::new(true);

        let first = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let second = b"the quick brown fox jumps over the lazy dog".repeat(20);

        let c1 = deflate_sync(&mut enc, &first).unwrap();
        let c2 = deflate_sync(&mut enc, &second).unwrap();
        // The second block compresses far better thanks to the dictionary.
        assert!(c2.len() < c1.len());

        assert_eq!(inflate_all(&mut dec, &c1, first.len()), first);
        assert_eq!(inflate_all(&mut dec, &c2, second.len()), second);
    }
}
