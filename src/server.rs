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

//! The RFB server: listener lifecycle, session registry and the host
//! operations the embedder drives.
//!
//! The embedder owns the tokio runtime. [`RfbServer::start`] binds the
//! listener and spawns the accept loop; every accepted or dialled
//! connection gets its own session task. Input events and connection
//! changes flow back over the event channel returned by
//! [`RfbServer::new`].

use crate::connector;
use crate::error::{Result, RfbError};
use crate::events::ServerEvent;
use crate::framebuffer::{DirtySink, Framebuffer, Rect};
use crate::protocol::ProtocolVersion;
use crate::session::{HandshakeConfig, RfbSession, SessionShared, CLOSE_DRAIN_TIMEOUT};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Configuration read once at [`RfbServer::new`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port; 0 asks the OS for one (see [`RfbServer::bound_port`]).
    pub port: u16,
    /// Interface to bind; empty binds all interfaces.
    pub interface: String,
    /// Desktop name announced in `ServerInit`.
    pub desktop_name: String,
    /// VNC password. `None` or empty disables VncAuth; only the first
    /// 8 bytes are effective (classic DES key schedule).
    pub password: Option<String>,
    /// Connection cap; `None` is unlimited.
    pub max_clients: Option<usize>,
    /// Highest protocol version to advertise.
    pub max_version: ProtocolVersion,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            interface: String::new(),
            desktop_name: "rfbserve".to_string(),
            password: None,
            max_clients: None,
            max_version: ProtocolVersion::V38,
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    framebuffer: Framebuffer,
    sessions: Arc<RwLock<Vec<Arc<SessionShared>>>>,
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    bound_port: AtomicU16,
    active: AtomicBool,
    shutdown: broadcast::Sender<()>,
    events: mpsc::UnboundedSender<ServerEvent>,
    next_id: AtomicUsize,
}

/// An RFB server bound to one framebuffer. Cheap to clone; all clones
/// control the same server.
#[derive(Clone)]
pub struct RfbServer {
    inner: Arc<ServerInner>,
}

impl RfbServer {
    /// Creates a server with a `width` x `height` framebuffer. Returns
    /// the server handle and the event channel for the embedder.
    #[must_use]
    pub fn new(
        width: u16,
        height: u16,
        config: ServerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(4);
        let server = Self {
            inner: Arc::new(ServerInner {
                config,
                framebuffer: Framebuffer::new(width, height),
                sessions: Arc::new(RwLock::new(Vec::new())),
                session_tasks: Mutex::new(Vec::new()),
                listener_task: Mutex::new(None),
                bound_port: AtomicU16::new(0),
                active: AtomicBool::new(false),
                shutdown,
                events,
                next_id: AtomicUsize::new(1),
            }),
        };
        (server, event_rx)
    }

    /// Binds the listener and starts accepting viewers. Returns the
    /// actual bound port (useful when the configured port was 0).
    ///
    /// # Errors
    ///
    /// [`RfbError::InvalidOperation`] if already started, or the bind
    /// error.
    pub async fn start(&self) -> Result<u16> {
        if self.inner.active.swap(true, Ordering::AcqRel) {
            return Err(RfbError::InvalidOperation("server already started".into()));
        }

        let interface = if self.inner.config.interface.is_empty() {
            "0.0.0.0"
        } else {
            self.inner.config.interface.as_str()
        };
        let listener = match TcpListener::bind((interface, self.inner.config.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.active.store(false, Ordering::Release);
                return Err(RfbError::Io(e));
            }
        };
        let port = listener.local_addr()?.port();
        self.inner.bound_port.store(port, Ordering::Release);
        log::info!("RFB server listening on {interface}:{port}");

        let server = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                if server.at_capacity().await {
                                    log::warn!("rejecting {addr}: client limit reached");
                                    continue;
                                }
                                if let Err(e) = stream.set_nodelay(true) {
                                    log::warn!("set_nodelay failed for {addr}: {e}");
                                }
                                let server = server.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = server.activate(stream, Some(addr)).await {
                                        log::error!("client from {addr} failed: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                log::error!("accept failed: {e}");
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        *self.inner.listener_task.lock().await = Some(accept_task);
        Ok(port)
    }

    /// Stops accepting, asks every session to close and waits for their
    /// tasks, bounded by the drain timeout.
    pub async fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(());

        if let Some(task) = self.inner.listener_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        let sessions: Vec<_> = self.inner.sessions.write().await.drain(..).collect();
        for session in &sessions {
            session.close().await;
        }

        let tasks: Vec<_> = self.inner.session_tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, &mut task).await.is_err() {
                log::warn!("session task did not drain in time, aborting");
                task.abort();
            }
        }
        log::info!("RFB server stopped");
    }

    /// True between a successful [`start`](RfbServer::start) and
    /// [`stop`](RfbServer::stop).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// The port the listener is bound to (0 before `start`).
    #[must_use]
    pub fn bound_port(&self) -> u16 {
        self.inner.bound_port.load(Ordering::Acquire)
    }

    /// The shared framebuffer.
    #[must_use]
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.inner.framebuffer
    }

    /// Replaces the frame with a full canonical R,G,B,X image. If the
    /// geometry changed, the framebuffer is resized first (preserving
    /// the semantics of [`new_framebuffer`](RfbServer::new_framebuffer)).
    ///
    /// # Errors
    ///
    /// Length mismatches and resize failures.
    pub async fn update_framebuffer(&self, data: &[u8], width: u16, height: u16) -> Result<()> {
        let fb = &self.inner.framebuffer;
        if (fb.width(), fb.height()) != (width, height) {
            fb.resize(width, height).await?;
        }
        fb.write(data).await
    }

    /// Resizes the framebuffer in place; see
    /// [`Framebuffer::resize`] for content and dirty semantics.
    ///
    /// # Errors
    ///
    /// [`RfbError::Resize`] when allocation fails; the old geometry
    /// survives and no client is dropped.
    pub async fn new_framebuffer(&self, width: u16, height: u16) -> Result<()> {
        self.inner.framebuffer.resize(width, height).await
    }

    /// Marks a rectangle dirty for every session.
    pub async fn mark_dirty(&self, rect: Rect) {
        self.inner.framebuffer.mark_dirty(rect).await;
    }

    /// Queues `src` moved by (dx, dy) as a CopyRect for every session.
    /// The pixels are assumed to have moved already (via
    /// [`do_copy_rect`](RfbServer::do_copy_rect) or an embedder that
    /// wrote the moved frame).
    pub async fn schedule_copy_rect(&self, src: Rect, dx: i16, dy: i16) {
        let sessions = self.sessions_snapshot().await;
        for session in sessions {
            session.schedule_copy(src, dx, dy).await;
        }
    }

    /// Applies the copy to the framebuffer, then queues the CopyRect for
    /// every session.
    ///
    /// # Errors
    ///
    /// [`RfbError::InvalidOperation`] when the clipped copy is empty.
    pub async fn do_copy_rect(&self, src: Rect, dx: i16, dy: i16) -> Result<()> {
        self.inner.framebuffer.copy_region(src, dx, dy).await?;
        self.schedule_copy_rect(src, dx, dy).await;
        Ok(())
    }

    /// Broadcasts clipboard text to every session.
    pub async fn send_cut_text(&self, text: &str) {
        let sessions = self.sessions_snapshot().await;
        for session in sessions {
            if let Err(e) = session.send_cut_text(text).await {
                log::warn!("cut text to client {} failed: {e}", session.id);
            }
        }
    }

    /// Dials a listening viewer and runs the ordinary server-initiated
    /// handshake. Returns the new client id once the session is running.
    ///
    /// # Errors
    ///
    /// Dial failures, timeouts and handshake errors.
    pub async fn connect_reverse(&self, host: &str, port: u16) -> Result<usize> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let stream = connector::dial(host, port, &mut shutdown).await?;
        let peer = stream.peer_addr().ok();
        self.activate(stream, peer).await
    }

    /// Dials a repeater, presents the id string, then handshakes as for
    /// a reverse connection.
    ///
    /// # Errors
    ///
    /// Dial failures, oversized ids, timeouts and handshake errors.
    pub async fn connect_repeater(&self, host: &str, port: u16, repeater_id: &str) -> Result<usize> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let stream = connector::dial_repeater(host, port, repeater_id, &mut shutdown).await?;
        let peer = stream.peer_addr().ok();
        self.activate(stream, peer).await
    }

    /// Runs a session over an already-connected transport (WebSocket
    /// bridges, unix sockets, tests). Returns the client id once the
    /// handshake completes.
    ///
    /// # Errors
    ///
    /// Handshake errors.
    pub async fn attach_stream<S>(&self, stream: S, peer: Option<SocketAddr>) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        self.activate(stream, peer).await
    }

    /// Forcibly disconnects one client. Returns false when the id is
    /// unknown.
    pub async fn disconnect_client(&self, id: usize) -> bool {
        let session = {
            let sessions = self.inner.sessions.read().await;
            sessions.iter().find(|s| s.id == id).cloned()
        };
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Ids of the currently running sessions.
    pub async fn client_ids(&self) -> Vec<usize> {
        self.inner.sessions.read().await.iter().map(|s| s.id).collect()
    }

    async fn sessions_snapshot(&self) -> Vec<Arc<SessionShared>> {
        self.inner.sessions.read().await.clone()
    }

    async fn at_capacity(&self) -> bool {
        match self.inner.config.max_clients {
            Some(max) => self.inner.sessions.read().await.len() >= max,
            None => false,
        }
    }

    /// Handshakes `stream`, registers the session and spawns its task.
    async fn activate<S>(&self, stream: S, peer: Option<SocketAddr>) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        let config = HandshakeConfig {
            desktop_name: self.inner.config.desktop_name.clone(),
            password: self.inner.config.password.clone(),
            max_version: self.inner.config.max_version,
        };

        let mut session = RfbSession::establish(
            id,
            stream,
            peer,
            self.inner.framebuffer.clone(),
            config,
            self.inner.events.clone(),
        )
        .await?;

        let shared = session.shared();
        self.inner
            .framebuffer
            .register_sink(DirtySink::new(Arc::downgrade(&shared.dirty)))
            .await;
        self.inner.sessions.write().await.push(shared.clone());
        let _ = self.inner.events.send(ServerEvent::ClientConnected {
            id,
            address: shared.peer,
        });

        let sessions = self.inner.sessions.clone();
        let events = self.inner.events.clone();
        let task = tokio::spawn(async move {
            let result = session.run().await;
            let shared = session.shared();
            let reason = match result {
                Ok(()) => {
                    if shared.running.load(Ordering::Acquire) {
                        "closed by peer".to_string()
                    } else {
                        "server shutdown".to_string()
                    }
                }
                Err(e) => {
                    log::error!("client {id} terminated: {e}");
                    e.to_string()
                }
            };
            shared.close().await;
            sessions.write().await.retain(|s| !Arc::ptr_eq(s, &shared));
            let _ = events.send(ServerEvent::ClientDisconnected { id, reason });
        });
        self.inner.session_tasks.lock().await.push(task);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SECURITY_TYPE_NONE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn viewer_handshake(stream: &mut TcpStream) {
        let mut version = [0u8; 12];
        stream.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, b"RFB 003.008\n");
        stream.write_all(b"RFB 003.008\n").await.unwrap();

        let mut security = [0u8; 2];
        stream.read_exact(&mut security).await.unwrap();
        assert_eq!(security, [1, SECURITY_TYPE_NONE]);
        stream.write_all(&[SECURITY_TYPE_NONE]).await.unwrap();

        let mut result = [0u8; 4];
        stream.read_exact(&mut result).await.unwrap();
        stream.write_all(&[1]).await.unwrap();

        let mut init = [0u8; 24];
        stream.read_exact(&mut init).await.unwrap();
        let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]) as usize;
        let mut name = vec![0u8; name_len];
        stream.read_exact(&mut name).await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_and_events() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let (server, mut events) = RfbServer::new(320, 240, config);

        let port = server.start().await.unwrap();
        assert!(port > 0);
        assert!(server.is_active());
        assert_eq!(server.bound_port(), port);

        let mut viewer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        viewer_handshake(&mut viewer).await;

        match events.recv().await.unwrap() {
            ServerEvent::ClientConnected { id, address } => {
                assert!(address.is_some());
                assert_eq!(server.client_ids().await, vec![id]);
            }
            other => panic!("expected ClientConnected, got {other:?}"),
        }

        server.stop().await;
        assert!(!server.is_active());
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::ClientDisconnected { .. }
        ));
        assert!(server.client_ids().await.is_empty());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let (server, _events) = RfbServer::new(64, 64, config);
        server.start().await.unwrap();
        assert!(server.start().await.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn max_clients_caps_connections() {
        let config = ServerConfig {
            port: 0,
            max_clients: Some(1),
            ..ServerConfig::default()
        };
        let (server, mut events) = RfbServer::new(64, 64, config);
        let port = server.start().await.unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        viewer_handshake(&mut first).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::ClientConnected { .. }
        ));

        // The second connection is dropped before any handshake byte.
        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let n = second.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn update_framebuffer_resizes_on_geometry_change() {
        let (server, _events) = RfbServer::new(4, 4, ServerConfig::default());
        let frame = vec![9u8; 8 * 8 * 4];
        server.update_framebuffer(&frame, 8, 8).await.unwrap();
        assert_eq!(
            (server.framebuffer().width(), server.framebuffer().height()),
            (8, 8)
        );
    }

    #[tokio::test]
    async fn disconnect_unknown_client_is_false() {
        let (server, _events) = RfbServer::new(4, 4, ServerConfig::default());
        assert!(!server.disconnect_client(42).await);
    }
}
