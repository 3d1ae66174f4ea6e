// src/core/cluster/node.rs

//! A single connection to one target node, with a pipelined request path.
//!
//! Each target master gets exactly one connection, serialized by a mutex: a
//! pipeline batch owns the socket from the first write to the last reply, so
//! replies always come back in submission order.

use crate::core::RiptideError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// A connection to one target node. Cheap to share; all I/O is serialized
/// through the inner mutex.
pub struct NodeConnection {
    addr: String,
    password: Option<String>,
    connect_timeout: Duration,
    response_timeout: Duration,
    reconnect_attempts: u32,
    inner: Mutex<Option<NodeStream>>,
}

struct NodeStream {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl NodeConnection {
    pub fn new(
        addr: String,
        password: Option<String>,
        connect_timeout: Duration,
        response_timeout: Duration,
        reconnect_attempts: u32,
    ) -> Self {
        Self {
            addr,
            password,
            connect_timeout,
            response_timeout,
            reconnect_attempts,
            inner: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one command and reads one reply.
    pub async fn request(&self, args: &[Bytes]) -> Result<RespFrame, RiptideError> {
        let batch = [args.to_vec()];
        let mut replies = self.pipeline(&batch).await?;
        replies
            .pop()
            .ok_or_else(|| RiptideError::Internal("pipeline returned no reply".into()))
    }

    /// Sends `commands` back-to-back, then reads exactly one reply per
    /// command. Replies are returned in submission order.
    ///
    /// A connection-level failure tears the socket down and retries the whole
    /// batch on a fresh connection, up to the configured attempt budget. The
    /// commands the engine pipelines are idempotent writes, so a blind resend
    /// after a broken pipe cannot corrupt the target.
    pub async fn pipeline(&self, commands: &[Vec<Bytes>]) -> Result<Vec<RespFrame>, RiptideError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.inner.lock().await;
        let mut attempt = 0u32;
        loop {
            if guard.is_none() {
                *guard = Some(self.dial().await?);
            }
            let Some(stream) = guard.as_mut() else {
                return Err(RiptideError::Internal(
                    "node connection vanished under its lock".into(),
                ));
            };

            match Self::exchange(stream, commands, self.response_timeout).await {
                Ok(replies) => return Ok(replies),
                Err(e) => {
                    // Drop the broken socket; the next iteration re-dials.
                    *guard = None;
                    attempt += 1;
                    if attempt > self.reconnect_attempts {
                        return Err(e);
                    }
                    warn!(
                        "Connection to target node {} failed ({e}); reconnecting (attempt {attempt}/{})",
                        self.addr, self.reconnect_attempts
                    );
                    // Back off with jitter before re-dialing so a flapping
                    // node is not hammered in lockstep by every pipeline.
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tokio::time::sleep(Duration::from_millis(100) * attempt + jitter).await;
                }
            }
        }
    }

    async fn exchange(
        stream: &mut NodeStream,
        commands: &[Vec<Bytes>],
        response_timeout: Duration,
    ) -> Result<Vec<RespFrame>, RiptideError> {
        let mut codec = RespFrameCodec;
        let mut write_buf = BytesMut::new();
        for args in commands {
            codec.encode(RespFrame::command(args), &mut write_buf)?;
        }
        stream.stream.write_all(&write_buf).await?;

        let mut replies = Vec::with_capacity(commands.len());
        while replies.len() < commands.len() {
            if let Some(frame) = codec.decode(&mut stream.read_buf)? {
                replies.push(frame);
                continue;
            }
            let read_fut = stream.stream.read_buf(&mut stream.read_buf);
            let n = tokio::time::timeout(response_timeout, read_fut).await??;
            if n == 0 {
                return Err(RiptideError::Connect(
                    "target node closed the connection mid-reply".into(),
                ));
            }
        }
        Ok(replies)
    }

    async fn dial(&self) -> Result<NodeStream, RiptideError> {
        debug!("Dialing target node {}", self.addr);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                RiptideError::Connect(format!("timed out connecting to target {}", self.addr))
            })?
            .map_err(|e| RiptideError::Connect(format!("failed to connect to {}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;

        let mut node = NodeStream {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
        };

        if let Some(password) = &self.password {
            let auth = vec![
                Bytes::from_static(b"AUTH"),
                Bytes::copy_from_slice(password.as_bytes()),
            ];
            let replies = Self::exchange(&mut node, &[auth], self.response_timeout).await?;
            match replies.first() {
                Some(RespFrame::SimpleString(s)) if s.eq_ignore_ascii_case("OK") => {}
                Some(RespFrame::Error(e)) => {
                    return Err(RiptideError::Connect(format!(
                        "target {} rejected AUTH: {e}",
                        self.addr
                    )));
                }
                other => {
                    return Err(RiptideError::Protocol(format!(
                        "unexpected AUTH reply from {}: {other:?}",
                        self.addr
                    )));
                }
            }
        }

        Ok(node)
    }

    /// Drops the underlying socket, if any.
    pub async fn close(&self) {
        *self.inner.lock().await = None;
    }
}
