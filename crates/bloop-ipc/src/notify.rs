//! Driver-side notification plumbing: frame writer plus the background
//! pump that feeds helper completions back into the driver.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bloop_core::{ErrorKind, LoopDriver, NotifySender};
use bloop_proto::{Frame, MessageId, FRAME_LEN};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Sends notification frames to the helper over the attach socket.
///
/// Frames go through an in-order queue drained by a dedicated writer
/// task, so enqueueing never waits on socket backpressure. The driver
/// holds its lock across the send; a full socket buffer must not stall
/// it against the completion pump. The queue depth is bounded in
/// practice by the arena: every in-flight request holds at least one
/// page of it.
pub struct UnixNotifySender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl UnixNotifySender {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_frames(writer, rx));
        Self { tx }
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| anyhow!("notification writer gone"))
    }
}

async fn drain_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.write_all(&frame.encode()).await {
            debug!(error = %err, "notification writer: helper socket closed");
            break;
        }
    }
}

#[async_trait]
impl NotifySender for UnixNotifySender {
    async fn send_io_request(&mut self, frame: Frame) -> Result<()> {
        self.enqueue(frame)
    }

    async fn send_terminate(&mut self) -> Result<()> {
        self.enqueue(Frame::terminate())
    }
}

/// Run the completion pump for one attachment.
///
/// Reads completion frames off the helper socket and applies them to the
/// driver. When the helper goes away the driver is detached, which
/// aborts everything still in flight. A malformed frame also ends the
/// attachment: once framing is lost there is no way back in sync.
pub fn spawn_completion_pump(driver: Arc<LoopDriver>, reader: OwnedReadHalf) -> JoinHandle<()> {
    tokio::spawn(run_pump(driver, reader))
}

async fn run_pump(driver: Arc<LoopDriver>, mut reader: OwnedReadHalf) {
    loop {
        let mut buf = [0u8; FRAME_LEN];
        match reader.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "completion pump: helper socket closed");
                break;
            }
        }
        let frame = match Frame::decode(buf) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "completion pump: undecodable frame, dropping helper");
                break;
            }
        };
        if frame.message_id != MessageId::IoRequest {
            warn!(id = ?frame.message_id, "completion pump: unexpected message from helper");
            continue;
        }
        trace!(handle = frame.handle, result = frame.result, "completion received");
        match driver.complete(frame.handle, frame.result).await {
            Ok(()) => {}
            // A stale handle is the helper's bug, not grounds to kill
            // everyone else's requests.
            Err(err) if err.kind() == ErrorKind::ProtocolViolation => {
                warn!(handle = frame.handle, error = %err, "completion pump: stale completion");
            }
            Err(err) => {
                warn!(error = %err, "completion pump: completion rejected");
                break;
            }
        }
    }
    match driver.detach().await {
        Ok(()) => {}
        // Terminate closes the socket before the pump notices; the
        // device is already torn down.
        Err(err) if err.kind() == ErrorKind::AlreadyTerminated => {}
        Err(err) => warn!(error = %err, "completion pump: detach failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloop_proto::Direction;
    use tokio::net::UnixStream;

    // Enough 48-byte frames to overflow a Unix socket send buffer many
    // times over; with nobody reading, a direct write would stall.
    const FRAMES: u64 = 10_000;

    #[tokio::test]
    async fn sends_never_block_on_a_full_socket() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (_unused, writer) = ours.into_split();
        let mut sender = UnixNotifySender::new(writer);

        for handle in 0..FRAMES {
            sender
                .send_io_request(Frame::io_request(0, 1, 0x1000, Direction::Read, handle))
                .await
                .unwrap();
        }

        // Drain the peer and check nothing was lost or reordered.
        let (mut reader, _keep_write_open) = theirs.into_split();
        for expected in 0..FRAMES {
            let mut buf = [0u8; FRAME_LEN];
            reader.read_exact(&mut buf).await.unwrap();
            let frame = Frame::decode(buf).unwrap();
            assert_eq!(frame.handle, expected);
        }
    }

    #[tokio::test]
    async fn send_fails_once_the_writer_is_gone() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (_unused, writer) = ours.into_split();
        let mut sender = UnixNotifySender::new(writer);
        drop(theirs);

        // The writer task exits on its first failed write; queued sends
        // start failing once that happens.
        sender
            .send_io_request(Frame::io_request(0, 1, 0x1000, Direction::Read, 1))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        let mut saw_failure = false;
        for handle in 2..100 {
            if sender
                .send_io_request(Frame::io_request(0, 1, 0x1000, Direction::Read, handle))
                .await
                .is_err()
            {
                saw_failure = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(saw_failure);
    }
}
