// src/core/source/connection.rs

//! The socket layer for talking to the Dragonfly source.
//!
//! A `SourceConnection` starts in framed mode for the control exchanges of
//! the handshake, then converts into a `SourceStream` for the raw snapshot
//! and journal bytes. The conversion keeps any bytes the framed reader had
//! already buffered, so nothing the source sent is lost at the switch.

use crate::core::RiptideError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Socket options applied to every source connection.
#[derive(Debug, Clone, Copy)]
pub struct SocketTuning {
    pub keepalive: Duration,
    pub recv_buffer_bytes: usize,
}

/// A connection to the source in framed (control) mode.
#[derive(Debug)]
pub struct SourceConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    codec: RespFrameCodec,
    control_timeout: Duration,
}

impl SourceConnection {
    /// Dials the source and applies keepalive and receive-buffer tuning.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        control_timeout: Duration,
        tuning: SocketTuning,
    ) -> Result<Self, RiptideError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RiptideError::Connect(format!("timed out connecting to source {addr}")))?
            .map_err(|e| RiptideError::Connect(format!("failed to connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        tune_socket(&stream, tuning);

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
            codec: RespFrameCodec,
            control_timeout,
        })
    }

    /// The local address of the socket, used for the announce fallback.
    pub fn local_addr(&self) -> Result<SocketAddr, RiptideError> {
        Ok(self.stream.local_addr()?)
    }

    /// Sends one command in the standard array-of-bulk framing.
    pub async fn send_command(&mut self, args: &[Bytes]) -> Result<(), RiptideError> {
        let encoded = RespFrame::command(args).encode_to_vec()?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Reads one reply frame under the short control deadline.
    pub async fn read_reply(&mut self) -> Result<RespFrame, RiptideError> {
        self.read_reply_with(self.control_timeout).await
    }

    /// Reads one reply frame under an explicit deadline.
    pub async fn read_reply_with(&mut self, deadline: Duration) -> Result<RespFrame, RiptideError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let read_fut = self.stream.read_buf(&mut self.read_buf);
            let n = tokio::time::timeout(deadline, read_fut)
                .await
                .map_err(|_| {
                    RiptideError::Connect("timed out waiting for a reply from the source".into())
                })??;
            if n == 0 {
                return Err(RiptideError::Connect(
                    "source closed the connection mid-reply".into(),
                ));
            }
        }
    }

    /// Sends a command and reads its reply.
    pub async fn request(&mut self, args: &[Bytes]) -> Result<RespFrame, RiptideError> {
        self.send_command(args).await?;
        self.read_reply().await
    }

    /// Authenticates if the source requires a password.
    pub async fn authenticate(&mut self, password: &str) -> Result<(), RiptideError> {
        let reply = self
            .request(&[
                Bytes::from_static(b"AUTH"),
                Bytes::copy_from_slice(password.as_bytes()),
            ])
            .await?;
        match reply {
            RespFrame::SimpleString(s) if s.eq_ignore_ascii_case("OK") => Ok(()),
            RespFrame::Error(e) => Err(RiptideError::Connect(format!(
                "source rejected AUTH: {e}"
            ))),
            other => Err(RiptideError::Protocol(format!(
                "unexpected AUTH reply: {other:?}"
            ))),
        }
    }

    /// Switches to raw mode, preserving bytes already buffered by the framed
    /// reader. RDB payload and journal records are read from the result.
    pub fn into_stream(self) -> SourceStream {
        SourceStream {
            leftover: self.read_buf,
            stream: self.stream,
        }
    }
}

/// A source socket in raw mode: an `AsyncRead` that first drains whatever the
/// framed phase had buffered, then reads from the socket.
pub struct SourceStream {
    leftover: BytesMut,
    stream: TcpStream,
}

impl SourceStream {
    /// Shuts the socket down to unblock a parked reader during cancellation.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl AsyncRead for SourceStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

/// Applies SO_KEEPALIVE and SO_RCVBUF. Tokio exposes no receive-buffer knob,
/// so this goes through the raw fd. Failures are logged, not fatal: the
/// engine still works with a default-sized buffer, just with less slack
/// while workers wait on the snapshot barrier.
#[cfg(unix)]
fn tune_socket(stream: &TcpStream, tuning: SocketTuning) {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let yes: libc::c_int = 1;
    // SAFETY: fd is a valid open socket owned by `stream` for the duration
    // of the call, and the option values are plain ints.
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&yes as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            warn!("Failed to enable TCP keepalive on source socket");
        }

        #[cfg(target_os = "linux")]
        {
            let idle = tuning.keepalive.as_secs().max(1) as libc::c_int;
            if libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                (&idle as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) != 0
            {
                warn!("Failed to set TCP keepalive idle time on source socket");
            }
        }

        let size: libc::c_int = tuning.recv_buffer_bytes.min(i32::MAX as usize) as libc::c_int;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&size as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            warn!(
                "Failed to raise receive buffer to {} bytes on source socket",
                tuning.recv_buffer_bytes
            );
        } else {
            debug!(
                "Requested {} byte receive buffer on source socket",
                tuning.recv_buffer_bytes
            );
        }
    }
}

#[cfg(not(unix))]
fn tune_socket(_stream: &TcpStream, _tuning: SocketTuning) {}
