//! Helper side of the bloop loop device: services I/O notifications
//! against a backing file through the shared arena the driver granted it.

mod file;

pub use file::BackingFile;

use anyhow::Result;
use async_trait::async_trait;
use bloop_proto::{
    Direction, Frame, MessageId, BLOCK_SIZE, MAX_TRANSFER_BYTES, RESULT_IO_ERROR,
    RESULT_READ_ONLY, RESULT_SUCCESS,
};
use bloop_shm::HelperArena;
use std::io;
use tracing::{debug, trace, warn};

/// Notification channel between driver and helper, as seen by the helper.
#[async_trait]
pub trait HelperChannel: Send {
    /// Next driver notification, or `None` once the driver side has
    /// closed the channel.
    async fn next_notification(&mut self) -> Result<Option<Frame>>;

    /// Return a completed request frame to the driver.
    async fn send_completion(&mut self, frame: Frame) -> Result<()>;
}

/// Why the session loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Driver sent a terminate notification.
    Terminated,
    /// Notification channel closed without a terminate.
    ChannelClosed,
}

/// One helper session: pulls notifications off the channel, moves data
/// between the backing file and the shared arena, and echoes each frame
/// back with its result. I/O failures become failed completions, never
/// session aborts.
pub struct HelperSession<C> {
    channel: C,
    arena: HelperArena,
    file: BackingFile,
}

impl<C: HelperChannel> HelperSession<C> {
    pub fn new(channel: C, arena: HelperArena, file: BackingFile) -> Self {
        Self {
            channel,
            arena,
            file,
        }
    }

    /// Arena base address in this process, reported to the driver during
    /// the attach handshake.
    pub fn arena_base(&self) -> u64 {
        self.arena.base()
    }

    pub async fn run(mut self) -> Result<SessionEnd> {
        loop {
            let frame = match self.channel.next_notification().await? {
                Some(frame) => frame,
                None => {
                    debug!("notification channel closed");
                    return Ok(SessionEnd::ChannelClosed);
                }
            };
            match frame.message_id {
                MessageId::Terminate => {
                    debug!("device terminated");
                    return Ok(SessionEnd::Terminated);
                }
                MessageId::IoRequest => {
                    let result = self.service(&frame).await;
                    self.channel.send_completion(frame.into_completion(result)).await?;
                }
            }
        }
    }

    async fn service(&mut self, frame: &Frame) -> u32 {
        trace!(
            handle = frame.handle,
            direction = ?frame.direction,
            offset = frame.offset,
            blocks = frame.block_count,
            "servicing request"
        );
        if frame.direction == Direction::Write && !self.file.writable() {
            warn!(handle = frame.handle, "write refused on read-only media");
            return RESULT_READ_ONLY;
        }
        let Some(byte_len) = frame
            .block_count
            .checked_mul(BLOCK_SIZE as u64)
            .filter(|len| *len <= MAX_TRANSFER_BYTES)
            .map(|len| len as usize)
        else {
            warn!(handle = frame.handle, blocks = frame.block_count, "oversized request");
            return RESULT_IO_ERROR;
        };
        let byte_offset = frame.offset * BLOCK_SIZE as u64;

        let segment = match self.arena.segment_mut(frame.buffer_addr, byte_len) {
            Ok(segment) => segment,
            Err(err) => {
                warn!(handle = frame.handle, error = %err, "buffer address outside arena");
                return RESULT_IO_ERROR;
            }
        };

        let outcome = match frame.direction {
            Direction::Read => self.file.read_at(byte_offset, segment).await,
            Direction::Write => self.file.write_at(byte_offset, segment).await,
        };
        match outcome {
            Ok(()) => RESULT_SUCCESS,
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                warn!(handle = frame.handle, "write refused on read-only media");
                RESULT_READ_ONLY
            }
            Err(err) => {
                warn!(handle = frame.handle, error = %err, "backing file I/O failed");
                RESULT_IO_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloop_shm::SharedArena;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::sync::{Arc, Mutex};

    /// Feeds a fixed notification script and records completions where the
    /// test can still see them after `run()` consumes the session.
    struct ScriptedChannel {
        notifications: VecDeque<Frame>,
        completions: Arc<Mutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl HelperChannel for ScriptedChannel {
        async fn next_notification(&mut self) -> Result<Option<Frame>> {
            Ok(self.notifications.pop_front())
        }

        async fn send_completion(&mut self, frame: Frame) -> Result<()> {
            self.completions.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct Fixture {
        driver_arena: SharedArena,
        helper_arena: Option<HelperArena>,
        file: tempfile::NamedTempFile,
    }

    fn fixture(file_len: usize) -> Fixture {
        let mut driver_arena = SharedArena::create(64 * 1024).unwrap();
        let fd: OwnedFd = driver_arena.fd().try_clone_to_owned().unwrap();
        let helper_arena = HelperArena::map(fd, driver_arena.len()).unwrap();
        driver_arena.set_helper_base(helper_arena.base());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; file_len]).unwrap();
        Fixture {
            driver_arena,
            helper_arena: Some(helper_arena),
            file,
        }
    }

    async fn run_session(
        fixture: &mut Fixture,
        notifications: Vec<Frame>,
    ) -> (SessionEnd, Vec<Frame>) {
        let completions = Arc::new(Mutex::new(Vec::new()));
        let channel = ScriptedChannel {
            notifications: notifications.into(),
            completions: Arc::clone(&completions),
        };
        let file = BackingFile::open(fixture.file.path()).await.unwrap();
        let helper_arena = fixture.helper_arena.take().unwrap();
        let session = HelperSession::new(channel, helper_arena, file);
        let end = session.run().await.unwrap();
        let recorded = completions.lock().unwrap().clone();
        (end, recorded)
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_arena() {
        let mut fixture = fixture(4096);

        // Stage the write payload in a shared segment the way the driver does.
        let buffer = fixture.driver_arena.allocate(512).unwrap();
        fixture
            .driver_arena
            .copy_in(&buffer, &[0xc3u8; 512])
            .unwrap();
        let addr = fixture.driver_arena.map_into_helper(&buffer).unwrap().address();

        let (end, completions) = run_session(
            &mut fixture,
            vec![
                Frame::io_request(2, 1, addr, Direction::Write, 7),
                Frame::io_request(2, 1, addr, Direction::Read, 8),
                Frame::terminate(),
            ],
        )
        .await;
        assert_eq!(end, SessionEnd::Terminated);

        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|f| f.result == RESULT_SUCCESS));
        assert_eq!(completions[0].handle, 7);
        assert_eq!(completions[1].handle, 8);

        // The read landed in the shared segment, visible to the driver side.
        let mut readback = vec![0u8; 512];
        fixture.driver_arena.copy_out(&mut readback, &buffer).unwrap();
        assert!(readback.iter().all(|b| *b == 0xc3));
    }

    #[tokio::test]
    async fn read_past_file_end_fails_the_request_not_the_session() {
        let mut fixture = fixture(1024);
        let buffer = fixture.driver_arena.allocate(512).unwrap();
        let addr = fixture.driver_arena.map_into_helper(&buffer).unwrap().address();

        let (end, completions) = run_session(
            &mut fixture,
            vec![
                Frame::io_request(100, 1, addr, Direction::Read, 1),
                Frame::terminate(),
            ],
        )
        .await;
        assert_eq!(end, SessionEnd::Terminated);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, RESULT_IO_ERROR);
        assert_eq!(completions[0].handle, 1);
    }

    #[tokio::test]
    async fn bogus_buffer_address_fails_the_request() {
        let mut fixture = fixture(1024);
        let bogus = fixture.helper_arena.as_ref().unwrap().base().wrapping_sub(4096);
        let (_end, completions) = run_session(
            &mut fixture,
            vec![
                Frame::io_request(0, 1, bogus, Direction::Read, 1),
                Frame::terminate(),
            ],
        )
        .await;
        assert_eq!(completions[0].result, RESULT_IO_ERROR);
    }

    #[tokio::test]
    async fn channel_close_ends_the_session() {
        let mut fixture = fixture(512);
        let (end, completions) = run_session(&mut fixture, Vec::new()).await;
        assert_eq!(end, SessionEnd::ChannelClosed);
        assert!(completions.is_empty());
    }
}
