//! Helper-side notification channel over the attach socket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bloop_helper::HelperChannel;
use bloop_proto::{Frame, FRAME_LEN};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// [`HelperChannel`] carried on the Unix socket left over from the
/// attach handshake.
pub struct UnixHelperChannel {
    stream: UnixStream,
}

impl UnixHelperChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl HelperChannel for UnixHelperChannel {
    async fn next_notification(&mut self) -> Result<Option<Frame>> {
        let mut buf = [0u8; FRAME_LEN];
        match self.stream.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("read notification frame"),
        }
        let frame = Frame::decode(buf).context("decode notification frame")?;
        Ok(Some(frame))
    }

    async fn send_completion(&mut self, frame: Frame) -> Result<()> {
        self.stream
            .write_all(&frame.encode())
            .await
            .context("write completion frame")
    }
}
