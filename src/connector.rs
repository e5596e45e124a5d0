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

//! Outbound connections: reverse connections to listening viewers and the
//! UltraVNC-style repeater rendezvous.
//!
//! A reverse connection dials the viewer and then runs the ordinary
//! server-initiated handshake as if the viewer had dialled in. The
//! repeater path first writes a 250-byte NUL-padded `ID:<id>` string so
//! the repeater can match this server with the viewer that presented the
//! same id.
//!
//! Every dial honours a timeout and the server's shutdown broadcast.

use crate::error::{Result, RfbError};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

/// Default time budget for an outbound dial.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of the repeater id preamble.
const REPEATER_ID_LEN: usize = 250;

/// Dials `host:port`, racing the timeout and the shutdown broadcast.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<TcpStream> {
    let connect = TcpStream::connect((host, port));
    tokio::select! {
        result = tokio::time::timeout(DIAL_TIMEOUT, connect) => {
            match result {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    Ok(stream)
                }
                Ok(Err(e)) => {
                    log::error!("outbound connection to {host}:{port} failed: {e}");
                    Err(RfbError::Io(e))
                }
                Err(_) => Err(RfbError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial to {host}:{port} timed out"),
                ))),
            }
        }
        _ = shutdown.recv() => {
            Err(RfbError::InvalidOperation("dial cancelled by shutdown".into()))
        }
    }
}

/// Dials a repeater and writes the `ID:<id>` preamble, NUL-padded to
/// exactly 250 bytes, before any RFB byte is exchanged.
pub(crate) async fn dial_repeater(
    host: &str,
    port: u16,
    repeater_id: &str,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<TcpStream> {
    let id_string = format!("ID:{repeater_id}");
    if id_string.len() > REPEATER_ID_LEN {
        return Err(RfbError::InvalidOperation(format!(
            "repeater id longer than {} bytes",
            REPEATER_ID_LEN - 3
        )));
    }

    let mut stream = dial(host, port, shutdown).await?;

    let mut preamble = [0u8; REPEATER_ID_LEN];
    preamble[..id_string.len()].copy_from_slice(id_string.as_bytes());
    stream.write_all(&preamble).await?;

    #[cfg(feature = "debug-logging")]
    log::info!("repeater id sent to {host}:{port}, proceeding with handshake");

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn repeater_preamble_is_250_nul_padded_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_tx, mut shutdown) = {
            let (tx, rx) = broadcast::channel(1);
            (tx, rx)
        };

        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; REPEATER_ID_LEN];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let _stream = dial_repeater("127.0.0.1", port, "12345", &mut shutdown)
            .await
            .unwrap();
        let preamble = accept.await.unwrap();
        assert_eq!(&preamble[..8], b"ID:12345");
        assert!(preamble[8..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn oversized_repeater_id_is_rejected() {
        let (_tx, mut shutdown) = {
            let (tx, rx) = broadcast::channel(1);
            (tx, rx)
        };
        let id = "x".repeat(260);
        assert!(dial_repeater("127.0.0.1", 1, &id, &mut shutdown).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_cancels_a_dial() {
        let (tx, mut shutdown) = broadcast::channel(1);
        // 192.0.2.0/24 is TEST-NET; the connect hangs long enough for the
        // shutdown signal to win the race.
        let dialing = dial("192.0.2.1", 5900, &mut shutdown);
        tx.send(()).unwrap();
        assert!(dialing.await.is_err());
    }
}
