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

//! Per-client session: handshake, message loop and update scheduling.
//!
//! Each session runs on its own task and owns its transport halves and
//! encoder state (the persistent deflate streams) exclusively. State the
//! server needs to reach from outside - the writer, the dirty and copy
//! queues, the negotiated format - lives in [`SessionShared`] behind its
//! own locks, so scheduling a copy or broadcasting cut text never touches
//! the session task.
//!
//! # Update discipline
//!
//! At most one `FramebufferUpdate` is in flight at a time (the whole
//! message is assembled and written under the send lock). Within a flush,
//! every queued CopyRect precedes the first pixel rectangle. Updates are
//! deferred ~5 ms after the first dirty mark and paced to ~30 FPS.

use crate::auth::VncAuthenticator;
use crate::encoding::{
    self, encoder_for, tight, tightpng, zlib, zlibhex, zrle, zywrle, EncodeContext, Encoder,
};
use crate::error::{HandshakeError, Result, RfbError};
use crate::events::ServerEvent;
use crate::framebuffer::{Framebuffer, Rect};
use crate::protocol::{
    PixelFormat, ProtocolVersion, RectHeader, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT,
    CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES, CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST,
    CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT, CLIENT_MSG_SET_ENCODINGS,
    CLIENT_MSG_SET_PIXEL_FORMAT, ENCODING_COMPRESS_LEVEL_0, ENCODING_COMPRESS_LEVEL_9,
    ENCODING_CONTINUOUS_UPDATES, ENCODING_COPYRECT, ENCODING_CORRE, ENCODING_HEXTILE,
    ENCODING_QUALITY_LEVEL_0, ENCODING_QUALITY_LEVEL_9, ENCODING_RAW, ENCODING_RRE,
    ENCODING_TIGHT, ENCODING_TIGHTPNG, ENCODING_ZLIB, ENCODING_ZLIBHEX, ENCODING_ZRLE,
    ENCODING_ZYWRLE, SECURITY_RESULT_FAILED, SECURITY_RESULT_OK, SECURITY_TYPE_NONE,
    SECURITY_TYPE_VNC_AUTH, SERVER_MSG_END_OF_CONTINUOUS_UPDATES, SERVER_MSG_FRAMEBUFFER_UPDATE,
    SERVER_MSG_SERVER_CUT_TEXT, UPDATE_BUF_SIZE,
};
use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;

/// Time budget for the whole handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deferral window after the first dirty mark of an update cycle.
const DEFER_UPDATE: Duration = Duration::from_millis(5);

/// Per-session update pacing (~30 FPS).
const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(33);

/// Upper bound on rectangles per `FramebufferUpdate` message.
const MAX_RECTS_PER_UPDATE: usize = 50;

/// Clipboard size cap; larger ClientCutText closes the session.
const MAX_CUT_TEXT: usize = 10 * 1024 * 1024;

/// Drain budget for the final write when a session closes.
pub(crate) const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Server-side encoding preference, best first, applied to the set the
/// client advertised. CopyRect is excluded: it is emitted only from the
/// copy queue.
const ENCODING_PRIORITY: [i32; 10] = [
    ENCODING_TIGHT,
    ENCODING_TIGHTPNG,
    ENCODING_ZRLE,
    ENCODING_ZYWRLE,
    ENCODING_ZLIBHEX,
    ENCODING_ZLIB,
    ENCODING_HEXTILE,
    ENCODING_CORRE,
    ENCODING_RRE,
    ENCODING_RAW,
];

type BoxedReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// One queued CopyRect: `src` moves by (dx, dy).
#[derive(Debug, Clone, Copy)]
pub(crate) struct CopyEntry {
    src: Rect,
    dx: i16,
    dy: i16,
}

impl CopyEntry {
    fn dest(&self) -> Rect {
        self.src.translated(self.dx, self.dy)
    }
}

/// Handshake parameters handed to [`RfbSession::establish`].
#[derive(Clone)]
pub(crate) struct HandshakeConfig {
    pub desktop_name: String,
    pub password: Option<String>,
    pub max_version: ProtocolVersion,
}

/// Session state reachable from the server: the writer, the queues and
/// the per-client wire configuration.
pub(crate) struct SessionShared {
    pub id: usize,
    pub peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
    /// Serializes whole server messages onto the socket.
    send_lock: Mutex<()>,
    format: RwLock<PixelFormat>,
    encodings: RwLock<Vec<i32>>,
    quality_level: AtomicU8,
    compress_level: AtomicU8,
    update_requested: AtomicBool,
    requested_region: RwLock<Option<Rect>>,
    /// Per-session dirty accumulator, fed by the framebuffer.
    pub dirty: Arc<RwLock<Vec<Rect>>>,
    copies: RwLock<Vec<CopyEntry>>,
    supports_continuous: AtomicBool,
    continuous_enabled: AtomicBool,
    continuous_region: RwLock<Option<Rect>>,
    pub running: AtomicBool,
}

impl SessionShared {
    /// Queues a copy of `src` by (dx, dy). A pending entry with a
    /// different offset whose destination overlaps the new destination is
    /// demoted to the dirty list, since the client would otherwise apply
    /// the copies in the wrong order.
    pub async fn schedule_copy(&self, src: Rect, dx: i16, dy: i16) {
        let dest = src.translated(dx, dy);
        if dest.is_empty() {
            return;
        }
        let mut copies = self.copies.write().await;
        let mut dirty = self.dirty.write().await;
        let mut kept = Vec::with_capacity(copies.len() + 1);
        for entry in copies.drain(..) {
            if (entry.dx, entry.dy) != (dx, dy) && entry.dest().overlaps(&dest) {
                crate::framebuffer::accumulate(&mut dirty, entry.dest());
            } else {
                kept.push(entry);
            }
        }
        kept.push(CopyEntry { src, dx, dy });
        *copies = kept;
    }

    /// Sends a `ServerCutText` message.
    #[allow(clippy::cast_possible_truncation)] // text length bounded by MAX_CUT_TEXT
    pub async fn send_cut_text(&self, text: &str) -> Result<()> {
        let mut msg = BytesMut::with_capacity(8 + text.len());
        msg.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        msg.put_bytes(0, 3);
        msg.put_u32(text.len() as u32);
        msg.put_slice(text.as_bytes());

        let _send = self.send_lock.lock().await;
        self.writer.lock().await.write_all(&msg).await?;
        Ok(())
    }

    /// Asks the session to stop and closes the write half, draining any
    /// in-flight write within [`CLOSE_DRAIN_TIMEOUT`].
    pub async fn close(&self) {
        self.running.store(false, Ordering::Release);
        if let Ok(mut writer) = timeout(CLOSE_DRAIN_TIMEOUT, self.writer.lock()).await {
            let _ = timeout(CLOSE_DRAIN_TIMEOUT, writer.shutdown()).await;
        }
    }

    async fn send_end_of_continuous_updates(&self) -> Result<()> {
        let _send = self.send_lock.lock().await;
        self.writer
            .lock()
            .await
            .write_all(&[SERVER_MSG_END_OF_CONTINUOUS_UPDATES])
            .await?;
        Ok(())
    }
}

/// A running client session. Owned by its task; everything here is
/// accessed without locks.
pub(crate) struct RfbSession {
    shared: Arc<SessionShared>,
    reader: BoxedReader,
    framebuffer: Framebuffer,
    events: mpsc::UnboundedSender<ServerEvent>,
    /// Framebuffer resize generation seen last; a change resets streams.
    last_generation: u64,
    last_update: Instant,
    defer_started: Option<Instant>,
    zlib_stream: Option<Compress>,
    zlibhex_raw: Option<Compress>,
    zlibhex_hex: Option<Compress>,
    zrle_stream: Option<Compress>,
    zywrle_stream: Option<Compress>,
    tight_streams: tight::TightStreams,
}

impl RfbSession {
    /// Performs the full handshake on `stream` and returns the running
    /// session. The handshake is bounded by [`HANDSHAKE_TIMEOUT`].
    pub async fn establish<S>(
        id: usize,
        stream: S,
        peer: Option<SocketAddr>,
        framebuffer: Framebuffer,
        config: HandshakeConfig,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let mut stream = stream;
        let version = match timeout(
            HANDSHAKE_TIMEOUT,
            handshake(&mut stream, &framebuffer, &config),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(HandshakeError::Timeout.into()),
        };

        #[cfg(feature = "debug-logging")]
        log::info!("client {id} handshake complete at {version:?}");
        let _ = version;

        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(SessionShared {
            id,
            peer,
            writer: Mutex::new(Box::new(writer) as BoxedWriter),
            send_lock: Mutex::new(()),
            format: RwLock::new(PixelFormat::rgbx32()),
            encodings: RwLock::new(vec![ENCODING_RAW]),
            quality_level: AtomicU8::new(5),
            compress_level: AtomicU8::new(5),
            update_requested: AtomicBool::new(false),
            requested_region: RwLock::new(None),
            dirty: Arc::new(RwLock::new(Vec::new())),
            copies: RwLock::new(Vec::new()),
            supports_continuous: AtomicBool::new(false),
            continuous_enabled: AtomicBool::new(false),
            continuous_region: RwLock::new(None),
            running: AtomicBool::new(true),
        });

        let last_generation = framebuffer.generation();
        Ok(Self {
            shared,
            reader: Box::new(reader),
            framebuffer,
            events,
            last_generation,
            last_update: Instant::now(),
            defer_started: None,
            zlib_stream: None,
            zlibhex_raw: None,
            zlibhex_hex: None,
            zrle_stream: None,
            zywrle_stream: None,
            tight_streams: tight::TightStreams::new(),
        })
    }

    /// The server-visible half of this session.
    pub fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    /// Runs the message loop until the peer disconnects, the server asks
    /// the session to stop, or a protocol violation occurs.
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        let mut ticker = tokio::time::interval(Duration::from_millis(16));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                return Ok(());
            }
            tokio::select! {
                read = self.reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    self.process_messages(&mut buf).await?;
                }
                _ = ticker.tick() => {
                    self.maybe_send_update().await?;
                }
            }
        }
    }

    /// Consumes every complete message in `buf`; partial messages stay
    /// buffered until more bytes arrive.
    #[allow(clippy::too_many_lines)] // one arm per protocol message
    async fn process_messages(&mut self, buf: &mut BytesMut) -> Result<()> {
        while !buf.is_empty() {
            match buf[0] {
                CLIENT_MSG_SET_PIXEL_FORMAT => {
                    if buf.len() < 20 {
                        break;
                    }
                    buf.advance(4); // type + padding
                    let requested = PixelFormat::from_bytes(buf)?;
                    if !requested.is_valid() {
                        if requested.true_colour_flag == 0 {
                            // Colour-mapped output is unsupported; keep
                            // the current true-colour format and let the
                            // client re-negotiate.
                            log::warn!(
                                "client {} requested colour-mapped output, keeping true colour",
                                self.shared.id
                            );
                            continue;
                        }
                        return Err(RfbError::ProtocolViolation(format!(
                            "invalid pixel format ({}bpp depth {})",
                            requested.bits_per_pixel, requested.depth
                        )));
                    }
                    *self.shared.format.write().await = requested;
                    // The byte stream semantics change with the format:
                    // every persistent stream restarts, ZYWRLE's included.
                    self.reset_streams();
                }
                CLIENT_MSG_SET_ENCODINGS => {
                    if buf.len() < 4 {
                        break;
                    }
                    let count = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
                    if buf.len() < 4 + count * 4 {
                        break;
                    }
                    buf.advance(4);
                    self.apply_encodings(buf, count).await?;
                }
                CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                    if buf.len() < 10 {
                        break;
                    }
                    buf.advance(1);
                    let incremental = buf.get_u8() != 0;
                    let rect = Rect::new(buf.get_u16(), buf.get_u16(), buf.get_u16(), buf.get_u16());

                    *self.shared.requested_region.write().await = Some(rect);
                    self.shared.update_requested.store(true, Ordering::Release);

                    if !incremental {
                        // A full refresh overrides whatever was tracked.
                        let mut dirty = self.shared.dirty.write().await;
                        dirty.clear();
                        dirty.push(rect);
                    }
                    if self.defer_started.is_none()
                        && !self.shared.dirty.read().await.is_empty()
                    {
                        self.defer_started = Some(Instant::now());
                    }
                }
                CLIENT_MSG_KEY_EVENT => {
                    if buf.len() < 8 {
                        break;
                    }
                    buf.advance(1);
                    let down = buf.get_u8() != 0;
                    buf.advance(2);
                    let keysym = buf.get_u32();
                    let _ = self.events.send(ServerEvent::KeyEvent {
                        client_id: self.shared.id,
                        keysym,
                        down,
                    });
                }
                CLIENT_MSG_POINTER_EVENT => {
                    if buf.len() < 6 {
                        break;
                    }
                    buf.advance(1);
                    let button_mask = buf.get_u8();
                    let x = buf.get_u16();
                    let y = buf.get_u16();
                    let _ = self.events.send(ServerEvent::PointerEvent {
                        client_id: self.shared.id,
                        x,
                        y,
                        button_mask,
                    });
                }
                CLIENT_MSG_CLIENT_CUT_TEXT => {
                    if buf.len() < 8 {
                        break;
                    }
                    let length =
                        u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                    if length > MAX_CUT_TEXT {
                        return Err(RfbError::ProtocolViolation(format!(
                            "cut text of {length} bytes exceeds limit"
                        )));
                    }
                    if buf.len() < 8 + length {
                        break;
                    }
                    buf.advance(8);
                    let bytes = buf.split_to(length);
                    let text = decode_cut_text(&bytes);
                    let _ = self.events.send(ServerEvent::CutText {
                        client_id: self.shared.id,
                        text,
                    });
                }
                CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES => {
                    if buf.len() < 10 {
                        break;
                    }
                    buf.advance(1);
                    let enable = buf.get_u8() != 0;
                    let rect = Rect::new(buf.get_u16(), buf.get_u16(), buf.get_u16(), buf.get_u16());
                    if enable {
                        *self.shared.continuous_region.write().await = Some(rect);
                        self.shared.continuous_enabled.store(true, Ordering::Release);
                    } else {
                        *self.shared.continuous_region.write().await = None;
                        self.shared.continuous_enabled.store(false, Ordering::Release);
                        self.shared.send_end_of_continuous_updates().await?;
                    }
                }
                unknown => {
                    log::warn!(
                        "client {} sent unknown message type {unknown}, closing",
                        self.shared.id
                    );
                    return Err(RfbError::ProtocolViolation(format!(
                        "unknown message type {unknown}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Installs a SetEncodings list: the preference vector plus the
    /// first-seen quality and compression pseudo-encodings.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // pseudo-encoding offsets are 0-9
    async fn apply_encodings(&mut self, buf: &mut BytesMut, count: usize) -> Result<()> {
        let mut list = Vec::with_capacity(count);
        let mut quality: Option<u8> = None;
        let mut compression: Option<u8> = None;
        let mut announce_continuous = false;

        for _ in 0..count {
            let encoding = buf.get_i32();
            list.push(encoding);

            if (ENCODING_QUALITY_LEVEL_0..=ENCODING_QUALITY_LEVEL_9).contains(&encoding)
                && quality.is_none()
            {
                quality = Some((encoding - ENCODING_QUALITY_LEVEL_0) as u8);
            }
            if (ENCODING_COMPRESS_LEVEL_0..=ENCODING_COMPRESS_LEVEL_9).contains(&encoding)
                && compression.is_none()
            {
                compression = Some((encoding - ENCODING_COMPRESS_LEVEL_0) as u8);
            }
            if encoding == ENCODING_CONTINUOUS_UPDATES
                && !self.shared.supports_continuous.swap(true, Ordering::AcqRel)
            {
                announce_continuous = true;
            }
        }

        if let Some(level) = quality {
            self.shared.quality_level.store(level, Ordering::Release);
        }
        if let Some(level) = compression {
            self.shared.compress_level.store(level, Ordering::Release);
        }
        *self.shared.encodings.write().await = list;

        if announce_continuous {
            self.shared.send_end_of_continuous_updates().await?;
        }
        Ok(())
    }

    /// Recreates every persistent compression stream. Required after a
    /// pixel format change or a framebuffer resize.
    fn reset_streams(&mut self) {
        self.zlib_stream = None;
        self.zlibhex_raw = None;
        self.zlibhex_hex = None;
        self.zrle_stream = None;
        self.zywrle_stream = None;
        self.tight_streams.reset();
    }

    /// Sends an update if one is due: an update request (or continuous
    /// updates) is outstanding, there is intersecting work, the deferral
    /// window has elapsed and the frame pacing allows it.
    async fn maybe_send_update(&mut self) -> Result<()> {
        let continuous = self.shared.continuous_enabled.load(Ordering::Acquire);
        if !continuous && !self.shared.update_requested.load(Ordering::Acquire) {
            return Ok(());
        }

        let generation = self.framebuffer.generation();
        if generation != self.last_generation {
            self.last_generation = generation;
            self.reset_streams();
        }

        {
            let dirty = self.shared.dirty.read().await;
            let copies = self.shared.copies.read().await;
            if dirty.is_empty() && copies.is_empty() {
                return Ok(());
            }
        }

        match self.defer_started {
            None => {
                self.defer_started = Some(Instant::now());
                return Ok(());
            }
            Some(started) => {
                if started.elapsed() < DEFER_UPDATE
                    || self.last_update.elapsed() < MIN_UPDATE_INTERVAL
                {
                    return Ok(());
                }
            }
        }

        let sent = self.send_update(continuous).await?;
        if sent {
            if !continuous {
                self.shared.update_requested.store(false, Ordering::Release);
            }
            self.defer_started = None;
            self.last_update = Instant::now();
        }
        Ok(())
    }

    /// Assembles and writes one `FramebufferUpdate`. Returns false when
    /// nothing intersected the requested region.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    async fn send_update(&mut self, continuous: bool) -> Result<bool> {
        let request = if continuous {
            self.shared.continuous_region.read().await.unwrap_or(Rect::new(
                0,
                0,
                self.framebuffer.width(),
                self.framebuffer.height(),
            ))
        } else {
            match *self.shared.requested_region.read().await {
                Some(rect) => rect,
                None => return Ok(false),
            }
        };

        let (fb_w, fb_h) = (self.framebuffer.width(), self.framebuffer.height());

        // CopyRect records first. Every queued copy intersecting the
        // request is emitted in this flush.
        let copy_rects: Vec<(Rect, u16, u16)> = {
            let mut copies = self.shared.copies.write().await;
            let mut out = Vec::new();
            copies.retain(|entry| {
                let dest = entry.dest().clipped_to(fb_w, fb_h);
                if let Some(clip) = dest.intersect(&request) {
                    let src = clip.translated(-entry.dx, -entry.dy);
                    out.push((clip, src.x, src.y));
                    false
                } else {
                    true
                }
            });
            out
        };

        // Then the dirty regions, bounded by the per-message rect budget.
        let regions: Vec<Rect> = {
            let mut dirty = self.shared.dirty.write().await;
            let budget = MAX_RECTS_PER_UPDATE.saturating_sub(copy_rects.len());
            let mut out = Vec::new();
            dirty.retain(|region| {
                if out.len() >= budget {
                    return true;
                }
                if let Some(clip) = region.intersect(&request) {
                    out.push(clip.clipped_to(fb_w, fb_h));
                    false
                } else {
                    true
                }
            });
            out
        };

        if copy_rects.is_empty() && regions.is_empty() {
            return Ok(false);
        }

        let ctx = EncodeContext {
            format: self.shared.format.read().await.clone(),
            quality_level: self.shared.quality_level.load(Ordering::Acquire),
            compress_level: self.shared.compress_level.load(Ordering::Acquire),
        };
        let chosen = self.select_encoding().await;

        // Pre-encode all pixel rectangles so the rectangle count in the
        // message header is exact.
        let mut encoded: Vec<(RectHeader, BytesMut)> = Vec::new();
        for region in &regions {
            if region.is_empty() {
                continue;
            }
            if chosen == ENCODING_CORRE && (region.width > 255 || region.height > 255) {
                // CoRRE coordinates are single bytes: tile the region.
                let mut y = 0;
                while y < region.height {
                    let th = 255.min(region.height - y);
                    let mut x = 0;
                    while x < region.width {
                        let tw = 255.min(region.width - x);
                        let tile = Rect::new(region.x + x, region.y + y, tw, th);
                        if let Some(rect) = self.encode_rect(tile, chosen, &ctx).await {
                            encoded.push(rect);
                        }
                        x += tw;
                    }
                    y += th;
                }
            } else if let Some(rect) = self.encode_rect(*region, chosen, &ctx).await {
                encoded.push(rect);
            }
        }

        let total = copy_rects.len() + encoded.len();
        if total == 0 {
            return Ok(false);
        }

        let mut msg = BytesMut::with_capacity(UPDATE_BUF_SIZE);
        msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        msg.put_u8(0);
        msg.put_u16(total as u16);

        let _send = self.shared.send_lock.lock().await;
        let mut writer = self.shared.writer.lock().await;

        for (dest, src_x, src_y) in copy_rects {
            RectHeader {
                x: dest.x,
                y: dest.y,
                width: dest.width,
                height: dest.height,
                encoding: ENCODING_COPYRECT,
            }
            .write_to(&mut msg);
            msg.put_u16(src_x);
            msg.put_u16(src_y);
        }
        for (header, payload) in encoded {
            header.write_to(&mut msg);
            msg.extend_from_slice(&payload);
            if msg.len() >= UPDATE_BUF_SIZE {
                writer.write_all(&msg).await?;
                msg.clear();
            }
        }
        if !msg.is_empty() {
            writer.write_all(&msg).await?;
        }
        writer.flush().await?;
        Ok(true)
    }

    /// First server-priority encoding the client advertised; Raw wins by
    /// default.
    async fn select_encoding(&self) -> i32 {
        let encodings = self.shared.encodings.read().await;
        ENCODING_PRIORITY
            .iter()
            .find(|enc| encodings.contains(enc))
            .copied()
            .unwrap_or(ENCODING_RAW)
    }

    /// Encodes one rectangle, falling back Tight -> ZRLE -> Zlib -> Raw
    /// on encoder failure (restricted to encodings the client advertised;
    /// Raw is always permitted). Returns `None` when the rectangle fell
    /// outside the framebuffer.
    async fn encode_rect(
        &mut self,
        rect: Rect,
        encoding: i32,
        ctx: &EncodeContext,
    ) -> Option<(RectHeader, BytesMut)> {
        let data = match self.framebuffer.read_rect(rect).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!("skipping rectangle outside framebuffer: {e}");
                return None;
            }
        };

        let mut attempt = encoding;
        loop {
            match self.encode_with(&data, rect, attempt, ctx) {
                Ok(payload) => {
                    return Some((
                        RectHeader {
                            x: rect.x,
                            y: rect.y,
                            width: rect.width,
                            height: rect.height,
                            encoding: attempt,
                        },
                        payload,
                    ));
                }
                Err(e) => {
                    let next = self.next_fallback(attempt).await;
                    log::error!(
                        "encoding {attempt} failed ({e}), falling back to {next}"
                    );
                    attempt = next;
                }
            }
        }
    }

    /// The next encoding in the failure chain that the client advertised.
    async fn next_fallback(&self, failed: i32) -> i32 {
        const CHAIN: [i32; 3] = [ENCODING_ZRLE, ENCODING_ZLIB, ENCODING_RAW];
        let advertised = self.shared.encodings.read().await;
        let start = CHAIN.iter().position(|&e| e == failed).map_or(0, |i| i + 1);
        CHAIN[start..]
            .iter()
            .find(|&&e| e == ENCODING_RAW || advertised.contains(&e))
            .copied()
            .unwrap_or(ENCODING_RAW)
    }

    fn encode_with(
        &mut self,
        data: &[u8],
        rect: Rect,
        encoding: i32,
        ctx: &EncodeContext,
    ) -> std::result::Result<BytesMut, RfbError> {
        let (w, h) = (rect.width, rect.height);
        let payload = match encoding {
            ENCODING_ZLIB => {
                let stream = persistent(&mut self.zlib_stream, ctx.compress_level);
                BytesMut::from(&zlib::encode_zlib(data, ctx, stream)?[..])
            }
            ENCODING_ZLIBHEX => {
                let raw = self
                    .zlibhex_raw
                    .get_or_insert_with(|| new_stream(ctx.compress_level));
                let hex = self
                    .zlibhex_hex
                    .get_or_insert_with(|| new_stream(ctx.compress_level));
                BytesMut::from(&zlibhex::encode_zlibhex(data, w, h, ctx, raw, hex)?[..])
            }
            ENCODING_ZRLE => {
                let stream = persistent(&mut self.zrle_stream, ctx.compress_level);
                BytesMut::from(&zrle::encode_zrle(data, w, h, ctx, stream)?[..])
            }
            ENCODING_ZYWRLE => {
                let level = zywrle::level_for_quality(ctx.quality_level);
                let stream = persistent(&mut self.zywrle_stream, ctx.compress_level);
                BytesMut::from(&zywrle::encode_zywrle(data, w, h, level, ctx, stream)?[..])
            }
            ENCODING_TIGHT => tight::encode_tight(data, w, h, ctx, &mut self.tight_streams, false),
            ENCODING_TIGHTPNG => {
                tightpng::encode_tightpng(data, w, h, ctx, &mut self.tight_streams)
            }
            other => match encoder_for(other) {
                Some(encoder) => encoder.encode(data, w, h, ctx),
                None => encoding::RawEncoding.encode(data, w, h, ctx),
            },
        };
        Ok(payload)
    }
}

fn new_stream(level: u8) -> Compress {
    Compress::new(Compression::new(u32::from(level)), true)
}

fn persistent(slot: &mut Option<Compress>, level: u8) -> &mut Compress {
    slot.get_or_insert_with(|| new_stream(level))
}

/// Cut text arrives as UTF-8 from modern viewers and Latin-1 from
/// everything older; decode accordingly.
fn decode_cut_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// The wire handshake: version, security, ClientInit/ServerInit.
async fn handshake<S>(
    stream: &mut S,
    framebuffer: &Framebuffer,
    config: &HandshakeConfig,
) -> Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream
        .write_all(config.max_version.wire_string().as_bytes())
        .await?;

    let mut version_buf = [0u8; 12];
    stream.read_exact(&mut version_buf).await?;
    let version = ProtocolVersion::negotiate(&version_buf, config.max_version)?;

    let auth_required = config.password.as_deref().is_some_and(|p| !p.is_empty());
    let offered = if auth_required {
        SECURITY_TYPE_VNC_AUTH
    } else {
        SECURITY_TYPE_NONE
    };

    if version == ProtocolVersion::V33 {
        // 3.3: the server dictates the type as a u32.
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(u32::from(offered));
        stream.write_all(&buf).await?;
    } else {
        stream.write_all(&[1, offered]).await?;
        let mut choice = [0u8; 1];
        stream.read_exact(&mut choice).await?;
        if choice[0] != offered {
            security_failure(stream, version, "security type not offered").await?;
            return Err(HandshakeError::AuthFailure.into());
        }
    }

    if offered == SECURITY_TYPE_VNC_AUTH {
        let auth = VncAuthenticator::new(config.password.as_deref().unwrap_or(""));
        let challenge = auth.challenge();
        stream.write_all(&challenge).await?;

        let mut response = [0u8; 16];
        stream.read_exact(&mut response).await?;

        if auth.verify(&challenge, &response) {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(SECURITY_RESULT_OK);
            stream.write_all(&buf).await?;
        } else {
            security_failure(stream, version, "authentication failed").await?;
            return Err(HandshakeError::AuthFailure.into());
        }
    } else if version == ProtocolVersion::V38 {
        // Only 3.8 acknowledges the None type with a SecurityResult.
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(SECURITY_RESULT_OK);
        stream.write_all(&buf).await?;
    }

    // ClientInit: the shared flag is read and accepted as-is.
    let mut shared_flag = [0u8; 1];
    stream.read_exact(&mut shared_flag).await?;

    let init = ServerInit {
        width: framebuffer.width(),
        height: framebuffer.height(),
        pixel_format: PixelFormat::rgbx32(),
        name: config.desktop_name.clone(),
    };
    let mut buf = BytesMut::new();
    init.write_to(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    Ok(version)
}

/// Writes `SecurityResult = failed`, plus the reason string on 3.8.
#[allow(clippy::cast_possible_truncation)] // reason strings are short
async fn security_failure<S>(stream: &mut S, version: ProtocolVersion, reason: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = BytesMut::new();
    buf.put_u32(SECURITY_RESULT_FAILED);
    if version == ProtocolVersion::V38 {
        buf.put_u32(reason.len() as u32);
        buf.put_slice(reason.as_bytes());
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::DirtySink;
    use tokio::io::DuplexStream;

    fn config(password: Option<&str>) -> HandshakeConfig {
        HandshakeConfig {
            desktop_name: "test".into(),
            password: password.map(str::to_string),
            max_version: ProtocolVersion::V38,
        }
    }

    async fn read_exactly<const N: usize>(stream: &mut DuplexStream) -> [u8; N] {
        let mut buf = [0u8; N];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    /// Scenario: RFB 3.8, security None, byte-for-byte.
    #[tokio::test]
    async fn handshake_v38_none_exact_bytes() {
        let (mut client, server_end) = tokio::io::duplex(64 * 1024);
        let fb = Framebuffer::new(1920, 1080);
        let (tx, _rx) = mpsc::unbounded_channel();
        let establishing =
            tokio::spawn(RfbSession::establish(1, server_end, None, fb, config(None), tx));

        assert_eq!(&read_exactly::<12>(&mut client).await, b"RFB 003.008\n");
        client.write_all(b"RFB 003.008\n").await.unwrap();

        assert_eq!(read_exactly::<2>(&mut client).await, [1, SECURITY_TYPE_NONE]);
        client.write_all(&[SECURITY_TYPE_NONE]).await.unwrap();

        assert_eq!(read_exactly::<4>(&mut client).await, [0, 0, 0, 0]);
        client.write_all(&[1]).await.unwrap(); // ClientInit, shared

        let init = read_exactly::<28>(&mut client).await;
        assert_eq!(&init[0..2], &1920u16.to_be_bytes());
        assert_eq!(&init[2..4], &1080u16.to_be_bytes());
        // Pixel format: 32 bpp, depth 24, little-endian true colour,
        // max 255 per channel, shifts 0/8/16.
        assert_eq!(
            &init[4..20],
            &[32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 0, 8, 16, 0, 0, 0]
        );
        assert_eq!(&init[20..24], &4u32.to_be_bytes());
        assert_eq!(&init[24..28], b"test");

        establishing.await.unwrap().unwrap();
    }

    /// Scenario: VncAuth failure on 3.8 sends the result, a reason
    /// string, then closes.
    #[tokio::test]
    async fn vncauth_failure_sends_reason_and_closes() {
        let (mut client, server_end) = tokio::io::duplex(64 * 1024);
        let fb = Framebuffer::new(640, 480);
        let (tx, _rx) = mpsc::unbounded_channel();
        let establishing = tokio::spawn(RfbSession::establish(
            1,
            server_end,
            None,
            fb,
            config(Some("secret")),
            tx,
        ));

        let _ = read_exactly::<12>(&mut client).await;
        client.write_all(b"RFB 003.008\n").await.unwrap();

        assert_eq!(
            read_exactly::<2>(&mut client).await,
            [1, SECURITY_TYPE_VNC_AUTH]
        );
        client.write_all(&[SECURITY_TYPE_VNC_AUTH]).await.unwrap();

        let _challenge = read_exactly::<16>(&mut client).await;
        client.write_all(&[0u8; 16]).await.unwrap(); // wrong response

        assert_eq!(read_exactly::<4>(&mut client).await, [0, 0, 0, 1]);
        let reason_len = u32::from_be_bytes(read_exactly::<4>(&mut client).await) as usize;
        let mut reason = vec![0u8; reason_len];
        client.read_exact(&mut reason).await.unwrap();
        assert!(std::str::from_utf8(&reason).is_ok());

        let result = establishing.await.unwrap();
        assert!(matches!(
            result,
            Err(RfbError::Handshake(HandshakeError::AuthFailure))
        ));
    }

    /// 3.3 clients get the dictated u32 security type, no type list.
    #[tokio::test]
    async fn handshake_v33_dictates_security_type() {
        let (mut client, server_end) = tokio::io::duplex(64 * 1024);
        let fb = Framebuffer::new(64, 64);
        let (tx, _rx) = mpsc::unbounded_channel();
        let establishing =
            tokio::spawn(RfbSession::establish(1, server_end, None, fb, config(None), tx));

        let _ = read_exactly::<12>(&mut client).await;
        client.write_all(b"RFB 003.003\n").await.unwrap();

        assert_eq!(
            read_exactly::<4>(&mut client).await,
            u32::from(SECURITY_TYPE_NONE).to_be_bytes()
        );
        // 3.3 + None: no SecurityResult, straight to ClientInit.
        client.write_all(&[0]).await.unwrap();
        let _init = read_exactly::<28>(&mut client).await;

        establishing.await.unwrap().unwrap();
    }

    async fn establish_running(
        fb: &Framebuffer,
    ) -> (DuplexStream, Arc<SessionShared>, tokio::task::JoinHandle<Result<()>>) {
        let (mut client, server_end) = tokio::io::duplex(1024 * 1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let establishing = tokio::spawn(RfbSession::establish(
            7,
            server_end,
            None,
            fb.clone(),
            config(None),
            tx,
        ));

        let _ = read_exactly::<12>(&mut client).await;
        client.write_all(b"RFB 003.008\n").await.unwrap();
        let _ = read_exactly::<2>(&mut client).await;
        client.write_all(&[SECURITY_TYPE_NONE]).await.unwrap();
        let _ = read_exactly::<4>(&mut client).await;
        client.write_all(&[1]).await.unwrap();
        let _init = read_exactly::<28>(&mut client).await;

        let mut session = establishing.await.unwrap().unwrap();
        let shared = session.shared();
        fb.register_sink(DirtySink::new(Arc::downgrade(&shared.dirty)))
            .await;
        let running = tokio::spawn(async move { session.run().await });
        (client, shared, running)
    }

    /// Scenario: a scheduled copy emits before any pixel rectangle, with
    /// the source coordinates in the body.
    #[tokio::test]
    async fn copyrect_precedes_dirty_rectangles() {
        let fb = Framebuffer::new(400, 300);
        fb.write(&vec![0x20u8; 400 * 300 * 4]).await.unwrap();
        let (mut client, shared, _running) = establish_running(&fb).await;

        // Advertise Raw only; schedule a copy and dirty a region.
        let mut msg = BytesMut::new();
        msg.put_u8(CLIENT_MSG_SET_ENCODINGS);
        msg.put_u8(0);
        msg.put_u16(2);
        msg.put_i32(ENCODING_RAW);
        msg.put_i32(ENCODING_COPYRECT);
        client.write_all(&msg).await.unwrap();

        shared
            .schedule_copy(Rect::new(0, 0, 100, 100), 50, 0)
            .await;
        fb.mark_dirty(Rect::new(200, 200, 10, 10)).await;

        let mut msg = BytesMut::new();
        msg.put_u8(CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST);
        msg.put_u8(1); // incremental
        msg.put_u16(0);
        msg.put_u16(0);
        msg.put_u16(400);
        msg.put_u16(300);
        client.write_all(&msg).await.unwrap();

        // FramebufferUpdate header.
        let header = read_exactly::<4>(&mut client).await;
        assert_eq!(header[0], SERVER_MSG_FRAMEBUFFER_UPDATE);
        let count = u16::from_be_bytes([header[2], header[3]]);
        assert_eq!(count, 2);

        // First rectangle must be the CopyRect: dest (50,0) 100x100,
        // body holds src (0,0).
        let rect = read_exactly::<12>(&mut client).await;
        assert_eq!(&rect[0..2], &50u16.to_be_bytes());
        assert_eq!(&rect[2..4], &0u16.to_be_bytes());
        assert_eq!(&rect[4..6], &100u16.to_be_bytes());
        assert_eq!(&rect[6..8], &100u16.to_be_bytes());
        assert_eq!(
            i32::from_be_bytes([rect[8], rect[9], rect[10], rect[11]]),
            ENCODING_COPYRECT
        );
        assert_eq!(read_exactly::<4>(&mut client).await, [0, 0, 0, 0]);

        // Second rectangle is the dirty region as Raw.
        let rect = read_exactly::<12>(&mut client).await;
        assert_eq!(
            i32::from_be_bytes([rect[8], rect[9], rect[10], rect[11]]),
            ENCODING_RAW
        );
        let w = u16::from_be_bytes([rect[4], rect[5]]) as usize;
        let h = u16::from_be_bytes([rect[6], rect[7]]) as usize;
        let mut pixels = vec![0u8; w * h * 4];
        client.read_exact(&mut pixels).await.unwrap();
        assert!(pixels.chunks_exact(4).all(|px| px == [0x20, 0x20, 0x20, 0x00]));
    }

    /// Scheduling a second copy with a different offset over the same
    /// destination demotes the first to the dirty list.
    #[tokio::test]
    async fn conflicting_copy_offset_demotes_older_entry() {
        let fb = Framebuffer::new(400, 300);
        let (_client, shared, _running) = establish_running(&fb).await;

        shared.schedule_copy(Rect::new(0, 0, 100, 100), 50, 0).await;
        shared.schedule_copy(Rect::new(60, 0, 100, 100), 0, 40).await;

        let copies = shared.copies.read().await;
        assert_eq!(copies.len(), 1);
        assert_eq!((copies[0].dx, copies[0].dy), (0, 40));

        let dirty = shared.dirty.read().await;
        assert!(dirty.contains(&Rect::new(50, 0, 100, 100)));
    }

    /// Same-offset copies queue without demotion.
    #[tokio::test]
    async fn same_offset_copies_coexist() {
        let fb = Framebuffer::new(400, 300);
        let (_client, shared, _running) = establish_running(&fb).await;

        shared.schedule_copy(Rect::new(0, 0, 50, 50), 10, 10).await;
        shared.schedule_copy(Rect::new(20, 20, 50, 50), 10, 10).await;

        assert_eq!(shared.copies.read().await.len(), 2);
        assert!(shared.dirty.read().await.is_empty());
    }

    /// Non-incremental requests force the whole requested rectangle out
    /// even with nothing marked dirty.
    #[tokio::test]
    async fn non_incremental_request_forces_full_rect() {
        let fb = Framebuffer::new(32, 32);
        let (mut client, _shared, _running) = establish_running(&fb).await;

        let mut msg = BytesMut::new();
        msg.put_u8(CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST);
        msg.put_u8(0); // non-incremental
        msg.put_u16(0);
        msg.put_u16(0);
        msg.put_u16(32);
        msg.put_u16(32);
        client.write_all(&msg).await.unwrap();

        let header = read_exactly::<4>(&mut client).await;
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 1);
        let rect = read_exactly::<12>(&mut client).await;
        assert_eq!(&rect[4..6], &32u16.to_be_bytes());
        assert_eq!(&rect[6..8], &32u16.to_be_bytes());
    }

    #[test]
    fn cut_text_decodes_latin1_fallback() {
        assert_eq!(decode_cut_text(b"plain"), "plain");
        assert_eq!(decode_cut_text(&[0xE9, 0x74, 0xE9]), "\u{e9}t\u{e9}");
    }
}
