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

//! Shared pixel store with dirty-region tracking.
//!
//! The framebuffer holds the canonical 32-bit R,G,B,X pixel buffer
//! (stride = width * 4). The embedder is the sole writer; client sessions
//! only read. Dirty regions are pushed into per-session accumulators
//! registered as [`DirtySink`]s, because each client drains its updates at
//! its own pace - a single global dirty region would either starve slow
//! clients or never clear.
//!
//! Dimensions are published through atomics so lock-free `width()` /
//! `height()` reads always observe a consistent pair; code that touches
//! pixel bytes takes the buffer lock and re-reads the dimensions under it,
//! which keeps `stride * height <= buffer.len()` across resize boundaries.

use crate::error::{Result, RfbError};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// A rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl Rect {
    /// Creates a rectangle.
    #[must_use]
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True if the rectangle covers no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn right(&self) -> u32 {
        u32::from(self.x) + u32::from(self.width)
    }

    fn bottom(&self) -> u32 {
        u32::from(self.y) + u32::from(self.height)
    }

    /// True if the two rectangles share at least one pixel.
    #[must_use]
    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && u32::from(self.x) < other.right()
            && u32::from(other.x) < self.right()
            && u32::from(self.y) < other.bottom()
            && u32::from(other.y) < self.bottom()
    }

    /// Intersection of two rectangles, or `None` when disjoint.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // intersection coords fit the operands
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        if !self.overlaps(other) {
            return None;
        }
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(Rect::new(
            x,
            y,
            (right - u32::from(x)) as u16,
            (bottom - u32::from(y)) as u16,
        ))
    }

    /// Smallest rectangle covering both operands.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounding box coords fit the operands
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, (right - u32::from(x)) as u16, (bottom - u32::from(y)) as u16)
    }

    /// The rectangle moved by (dx, dy), clipped against the u16 coordinate
    /// space (pixels shifted past an edge are dropped).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn translated(&self, dx: i16, dy: i16) -> Rect {
        let x = i32::from(self.x) + i32::from(dx);
        let y = i32::from(self.y) + i32::from(dy);
        let clip = |pos: i32, len: u16| -> (u16, u16) {
            if pos < 0 {
                let cut = (-pos) as u16;
                (0, len.saturating_sub(cut))
            } else if pos > i32::from(u16::MAX) {
                (u16::MAX, 0)
            } else {
                (pos as u16, len)
            }
        };
        let (x, w) = clip(x, self.width);
        let (y, h) = clip(y, self.height);
        Rect::new(x, y, w, h)
    }

    /// Clips the rectangle to a `width` x `height` surface.
    #[must_use]
    pub fn clipped_to(&self, width: u16, height: u16) -> Rect {
        self.intersect(&Rect::new(0, 0, width, height))
            .unwrap_or(Rect::new(0, 0, 0, 0))
    }
}

/// Unions `rect` into an accumulator list, merging with any entry it
/// touches so the list stays short under a stream of small marks.
pub(crate) fn accumulate(list: &mut Vec<Rect>, rect: Rect) {
    if rect.is_empty() {
        return;
    }
    let mut merged = rect;
    let mut changed = true;
    while changed {
        changed = false;
        let mut i = 0;
        while i < list.len() {
            if list[i].overlaps(&merged) {
                merged = merged.union(&list.swap_remove(i));
                changed = true;
            } else {
                i += 1;
            }
        }
    }
    list.push(merged);
}

/// Handle through which the framebuffer pushes dirty rectangles into one
/// session's accumulator. Holds a weak reference so a departed session
/// never keeps the sink alive.
pub struct DirtySink {
    regions: Weak<RwLock<Vec<Rect>>>,
}

impl DirtySink {
    /// Wraps a session's dirty accumulator.
    #[must_use]
    pub fn new(regions: Weak<RwLock<Vec<Rect>>>) -> Self {
        Self { regions }
    }
}

struct Inner {
    width: AtomicU16,
    height: AtomicU16,
    /// Resize generation. Sessions compare against their last-seen value
    /// and recreate their compression streams when it moves.
    generation: AtomicU64,
    pixels: RwLock<Vec<u8>>,
    sinks: RwLock<Vec<DirtySink>>,
}

/// The shared framebuffer. Cheap to clone; all clones refer to the same
/// pixel store.
#[derive(Clone)]
pub struct Framebuffer {
    inner: Arc<Inner>,
}

impl Framebuffer {
    /// Creates a framebuffer filled with opaque black.
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                width: AtomicU16::new(width),
                height: AtomicU16::new(height),
                generation: AtomicU64::new(0),
                pixels: RwLock::new(black_buffer(width, height)),
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Current width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.inner.width.load(Ordering::Acquire)
    }

    /// Current height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.inner.height.load(Ordering::Acquire)
    }

    /// Resize generation counter; bumped by every successful [`resize`].
    ///
    /// [`resize`]: Framebuffer::resize
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Registers a session's dirty accumulator to receive region marks.
    pub async fn register_sink(&self, sink: DirtySink) {
        self.inner.sinks.write().await.push(sink);
    }

    /// Replaces the whole frame. `data` must be exactly
    /// `width * height * 4` bytes of canonical R,G,B,X pixels. The buffer
    /// is published before the dirty mark so readers that observe the mark
    /// see the pixels that motivated it.
    ///
    /// # Errors
    ///
    /// [`RfbError::InvalidOperation`] if the length does not match the
    /// current geometry.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        {
            let mut pixels = self.inner.pixels.write().await;
            let expected = stride(self.width()) * usize::from(self.height());
            if data.len() != expected {
                return Err(RfbError::InvalidOperation(format!(
                    "frame is {} bytes, expected {expected}",
                    data.len()
                )));
            }
            pixels[..expected].copy_from_slice(data);
        }
        self.mark_dirty(Rect::new(0, 0, self.width(), self.height()))
            .await;
        Ok(())
    }

    /// Unions `rect` (clipped to the surface) into every registered
    /// session accumulator. Dead sinks are pruned on the way.
    pub async fn mark_dirty(&self, rect: Rect) {
        let rect = rect.clipped_to(self.width(), self.height());
        if rect.is_empty() {
            return;
        }
        let mut sinks = self.inner.sinks.write().await;
        let mut i = 0;
        while i < sinks.len() {
            if let Some(regions) = sinks[i].regions.upgrade() {
                accumulate(&mut *regions.write().await, rect);
                i += 1;
            } else {
                sinks.swap_remove(i);
            }
        }
    }

    /// Copies out a rectangle of canonical pixels, row by row.
    ///
    /// # Errors
    ///
    /// [`RfbError::InvalidOperation`] if the rectangle reaches outside the
    /// current geometry.
    pub async fn read_rect(&self, rect: Rect) -> Result<Vec<u8>> {
        let pixels = self.inner.pixels.read().await;
        let (w, h) = (self.width(), self.height());
        if rect.right() > u32::from(w) || rect.bottom() > u32::from(h) {
            return Err(RfbError::InvalidOperation(format!(
                "rect {}x{}+{}+{} outside {w}x{h}",
                rect.width, rect.height, rect.x, rect.y
            )));
        }
        let row_bytes = usize::from(rect.width) * 4;
        let mut out = Vec::with_capacity(row_bytes * usize::from(rect.height));
        for row in 0..usize::from(rect.height) {
            let start = (usize::from(rect.y) + row) * stride(w) + usize::from(rect.x) * 4;
            out.extend_from_slice(&pixels[start..start + row_bytes]);
        }
        Ok(out)
    }

    /// Resizes the framebuffer in place.
    ///
    /// The top-left `min(old, new)` sub-image is preserved at the origin,
    /// the remainder is filled with opaque black, the full surface is
    /// marked dirty for every session and the resize generation is bumped
    /// so sessions reset their compression streams. On allocation failure
    /// the old geometry and contents are untouched.
    ///
    /// # Errors
    ///
    /// [`RfbError::Resize`] when the new buffer cannot be allocated.
    pub async fn resize(&self, new_width: u16, new_height: u16) -> Result<()> {
        {
            let mut pixels = self.inner.pixels.write().await;
            let (old_width, old_height) = (self.width(), self.height());

            let new_len = stride(new_width) * usize::from(new_height);
            let mut fresh = Vec::new();
            if fresh.try_reserve_exact(new_len).is_err() {
                return Err(RfbError::Resize(format!(
                    "allocation of {new_len} bytes failed"
                )));
            }
            fresh.resize(new_len, 0);
            for px in fresh.chunks_exact_mut(4) {
                px[3] = 0xFF;
            }

            let keep_w = usize::from(old_width.min(new_width)) * 4;
            let keep_h = usize::from(old_height.min(new_height));
            for row in 0..keep_h {
                let src = row * stride(old_width);
                let dst = row * stride(new_width);
                fresh[dst..dst + keep_w].copy_from_slice(&pixels[src..src + keep_w]);
            }

            *pixels = fresh;
            // Publish the new geometry while still holding the buffer lock
            // so no reader pairs old dimensions with the new buffer.
            self.inner.width.store(new_width, Ordering::Release);
            self.inner.height.store(new_height, Ordering::Release);
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.mark_dirty(Rect::new(0, 0, new_width, new_height)).await;
        Ok(())
    }

    /// Overlap-safe block copy: moves the pixels of `src` (clipped) to
    /// `src + (dx, dy)` (clipped). Row traversal order follows the sign of
    /// `dy`; each row move is a `copy_within`, so horizontal overlap is
    /// safe in both directions.
    ///
    /// # Errors
    ///
    /// [`RfbError::InvalidOperation`] when the clipped copy is empty.
    pub async fn copy_region(&self, src: Rect, dx: i16, dy: i16) -> Result<()> {
        let mut pixels = self.inner.pixels.write().await;
        let (w, h) = (self.width(), self.height());

        // Clip the destination, then derive the matching source so both
        // stay inside the surface.
        let dst = src.translated(dx, dy).clipped_to(w, h);
        let src = dst.translated(-dx, -dy).clipped_to(w, h);
        let dst = src.translated(dx, dy);
        if src.is_empty() || dst.is_empty() {
            return Err(RfbError::InvalidOperation(
                "copy region outside framebuffer".into(),
            ));
        }

        let row_bytes = usize::from(src.width) * 4;
        let copy_row = |pixels: &mut Vec<u8>, row: usize| {
            let from = (usize::from(src.y) + row) * stride(w) + usize::from(src.x) * 4;
            let to = (usize::from(dst.y) + row) * stride(w) + usize::from(dst.x) * 4;
            pixels.copy_within(from..from + row_bytes, to);
        };
        if dy > 0 {
            for row in (0..usize::from(src.height)).rev() {
                copy_row(&mut pixels, row);
            }
        } else {
            for row in 0..usize::from(src.height) {
                copy_row(&mut pixels, row);
            }
        }
        Ok(())
    }
}

fn stride(width: u16) -> usize {
    usize::from(width) * 4
}

fn black_buffer(width: u16, height: u16) -> Vec<u8> {
    let mut buf = vec![0u8; stride(width) * usize::from(height)];
    for px in buf.chunks_exact_mut(4) {
        px[3] = 0xFF;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0u8; usize::from(width) * usize::from(height) * 4];
        for y in 0..usize::from(height) {
            for x in 0..usize::from(width) {
                let off = (y * usize::from(width) + x) * 4;
                data[off] = (x % 251) as u8;
                data[off + 1] = (y % 251) as u8;
                data[off + 2] = ((x * y) % 251) as u8;
                data[off + 3] = 0xFF;
            }
        }
        data
    }

    #[test]
    fn rect_algebra() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 100, 100);
        assert!(a.overlaps(&b));
        assert_eq!(a.intersect(&b), Some(Rect::new(50, 50, 50, 50)));
        assert_eq!(a.union(&b), Rect::new(0, 0, 150, 150));
        assert!(!a.overlaps(&Rect::new(100, 0, 10, 10)));
        assert_eq!(Rect::new(10, 10, 20, 20).translated(-15, 5), Rect::new(0, 15, 15, 20));
    }

    #[test]
    fn accumulate_merges_overlapping() {
        let mut list = vec![Rect::new(0, 0, 10, 10), Rect::new(100, 100, 10, 10)];
        accumulate(&mut list, Rect::new(5, 5, 10, 10));
        assert_eq!(list.len(), 2);
        assert!(list.contains(&Rect::new(0, 0, 15, 15)));
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let fb = Framebuffer::new(8, 4);
        let frame = checker(8, 4);
        fb.write(&frame).await.unwrap();
        let rect = fb.read_rect(Rect::new(2, 1, 3, 2)).await.unwrap();
        assert_eq!(rect.len(), 3 * 2 * 4);
        assert_eq!(&rect[0..4], &frame[(8 + 2) * 4..(8 + 2) * 4 + 4]);
    }

    #[tokio::test]
    async fn write_rejects_wrong_length() {
        let fb = Framebuffer::new(4, 4);
        assert!(fb.write(&[0u8; 7]).await.is_err());
    }

    #[tokio::test]
    async fn resize_preserves_top_left_and_black_fills() {
        let fb = Framebuffer::new(8, 6);
        let frame = checker(8, 6);
        fb.write(&frame).await.unwrap();

        fb.resize(10, 8).await.unwrap();
        assert_eq!((fb.width(), fb.height()), (10, 8));
        assert_eq!(fb.generation(), 1);

        let kept = fb.read_rect(Rect::new(0, 0, 8, 6)).await.unwrap();
        for y in 0..6usize {
            let src = &frame[y * 8 * 4..y * 8 * 4 + 8 * 4];
            let dst = &kept[y * 8 * 4..y * 8 * 4 + 8 * 4];
            assert_eq!(src, dst, "row {y} changed across resize");
        }
        let edge = fb.read_rect(Rect::new(8, 0, 2, 8)).await.unwrap();
        for px in edge.chunks_exact(4) {
            assert_eq!(px, &[0, 0, 0, 0xFF]);
        }
    }

    #[tokio::test]
    async fn resize_smaller_keeps_sub_image() {
        let fb = Framebuffer::new(8, 8);
        let frame = checker(8, 8);
        fb.write(&frame).await.unwrap();
        fb.resize(4, 4).await.unwrap();
        let kept = fb.read_rect(Rect::new(0, 0, 4, 4)).await.unwrap();
        for y in 0..4usize {
            assert_eq!(&kept[y * 16..y * 16 + 16], &frame[y * 32..y * 32 + 16]);
        }
    }

    /// Every overlap direction must match a copy through a scratch buffer.
    #[tokio::test]
    async fn overlapping_copies_match_reference() {
        for &(dx, dy) in &[(2i16, 0i16), (-2, 0), (0, 2), (0, -2), (3, 3), (-3, -3), (3, -3)] {
            let fb = Framebuffer::new(16, 16);
            let frame = checker(16, 16);
            fb.write(&frame).await.unwrap();

            let src = Rect::new(4, 4, 8, 8);
            fb.copy_region(src, dx, dy).await.unwrap();

            // Reference: copy via a detached buffer.
            let mut expect = frame.clone();
            let mut scratch = vec![0u8; 8 * 8 * 4];
            for y in 0..8usize {
                let from = (4 + y) * 16 * 4 + 4 * 4;
                scratch[y * 32..y * 32 + 32].copy_from_slice(&frame[from..from + 32]);
            }
            for y in 0..8usize {
                let ty = (4 + y) as i32 + i32::from(dy);
                let tx = 4 + i32::from(dx);
                let to = (ty as usize) * 16 * 4 + (tx as usize) * 4;
                expect[to..to + 32].copy_from_slice(&scratch[y * 32..y * 32 + 32]);
            }

            let got = fb.read_rect(Rect::new(0, 0, 16, 16)).await.unwrap();
            assert_eq!(got, expect, "copy mismatch for offset ({dx},{dy})");
        }
    }

    #[tokio::test]
    async fn dirty_marks_reach_registered_sinks() {
        let fb = Framebuffer::new(32, 32);
        let acc = Arc::new(RwLock::new(Vec::new()));
        fb.register_sink(DirtySink::new(Arc::downgrade(&acc))).await;

        fb.mark_dirty(Rect::new(1, 2, 3, 4)).await;
        fb.mark_dirty(Rect::new(2, 3, 3, 4)).await;
        let regions = acc.read().await;
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0], Rect::new(1, 2, 4, 5));
    }
}
