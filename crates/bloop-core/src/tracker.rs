//! In-flight request bookkeeping: the single authority for completing
//! (exactly once) or force-failing every dispatched request.

use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::geometry::DeviceGeometry;
use bloop_proto::{Direction, Frame, BLOCK_SIZE, RESULT_ABORTED, RESULT_SUCCESS};
use bloop_shm::{HelperMapping, SharedArena, SharedBuffer};
use tokio::sync::oneshot;
use tracing::trace;

/// Terminal status of one I/O request as seen by the external caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    IoError,
    Aborted,
}

impl IoStatus {
    pub fn from_wire(result: u32) -> Self {
        match result {
            RESULT_SUCCESS => Self::Success,
            RESULT_ABORTED => Self::Aborted,
            _ => Self::IoError,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Delivered through the completion channel exactly once per request.
///
/// Arrives from an arbitrary task context; the caller's buffer rides
/// along so ownership returns to the caller on both success and failure.
#[derive(Debug)]
pub struct IoCompletion {
    pub status: IoStatus,
    pub bytes_transferred: u64,
    pub buffer: Vec<u8>,
}

/// One in-flight request. Owns its shared segment and helper mapping
/// until the terminal event releases them.
struct PendingRequest {
    direction: Direction,
    block_count: u64,
    source: Vec<u8>,
    shared: SharedBuffer,
    mapping: HelperMapping,
    completion: oneshot::Sender<IoCompletion>,
}

struct Slot {
    generation: u32,
    pending: Option<PendingRequest>,
}

/// Arena-style table of pending requests. Handles are generation-checked
/// slot indices packed into a `u64`, so a stale completion can never
/// alias a recycled slot.
#[derive(Default)]
pub struct RequestTracker {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate, stage, and register a new request, returning its handle
    /// and the frame to dispatch. No state is left behind on any error.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        arena: &mut SharedArena,
        geometry: &DeviceGeometry,
        direction: Direction,
        block_offset: u64,
        block_count: u64,
        source: Vec<u8>,
        completion: oneshot::Sender<IoCompletion>,
    ) -> DriverResult<(u64, Frame)> {
        let byte_len = geometry.validate(direction, block_offset, block_count)?;
        if source.len() != byte_len {
            return Err(DriverError::with_message(
                ErrorKind::IoError,
                format!(
                    "caller buffer holds {} bytes, request needs {byte_len}",
                    source.len()
                ),
            ));
        }

        let shared = arena.allocate(byte_len)?;
        if direction == Direction::Write {
            if let Err(err) = arena.copy_in(&shared, &source) {
                arena.release_unmapped(shared);
                return Err(err.into());
            }
        }
        let mapping = match arena.map_into_helper(&shared) {
            Ok(mapping) => mapping,
            Err(err) => {
                arena.release_unmapped(shared);
                return Err(err.into());
            }
        };

        let buffer_addr = mapping.address();
        let handle = self.register(PendingRequest {
            direction,
            block_count,
            source,
            shared,
            mapping,
            completion,
        });
        trace!(handle, ?direction, block_offset, block_count, "request staged");
        Ok((
            handle,
            Frame::io_request(block_offset, block_count, buffer_addr, direction, handle),
        ))
    }

    /// Finalize a request with the helper-reported result.
    ///
    /// An unknown or stale handle is a protocol violation: the caller
    /// reports it and carries on. `bytes_transferred` on success is
    /// always `block_count * 512`; the protocol is all-or-nothing per
    /// request and any short-count hint from the helper is ignored.
    pub fn complete(&mut self, arena: &mut SharedArena, handle: u64, result: u32) -> DriverResult<()> {
        let request = self.remove(handle).ok_or_else(|| {
            DriverError::with_message(
                ErrorKind::ProtocolViolation,
                format!("completion for unknown handle {handle:#x}"),
            )
        })?;
        let mut status = IoStatus::from_wire(result);
        let mut source = request.source;
        if status.is_success() && request.direction == Direction::Read {
            if let Err(err) = arena.copy_out(&mut source, &request.shared) {
                trace!(handle, error = %err, "copy-out failed on completion");
                status = IoStatus::IoError;
            }
        }
        let bytes_transferred = if status.is_success() {
            request.block_count * BLOCK_SIZE as u64
        } else {
            0
        };
        deliver(
            request.completion,
            IoCompletion {
                status,
                bytes_transferred,
                buffer: source,
            },
        );
        arena.release(request.shared, request.mapping);
        trace!(handle, ?status, bytes_transferred, "request completed");
        Ok(())
    }

    /// Evict a request whose dispatch failed synchronously. Its shared
    /// resources are released and its completion never fires; to the
    /// caller the request was never registered.
    pub fn abort_dispatch(&mut self, arena: &mut SharedArena, handle: u64) {
        if let Some(request) = self.remove(handle) {
            arena.release(request.shared, request.mapping);
        }
    }

    /// Fail every pending request with `status` and zero bytes, releasing
    /// all shared resources. The detach liveness guarantee: nobody is
    /// left waiting on a helper that disappeared.
    pub fn force_fail_all(&mut self, arena: &mut SharedArena, status: IoStatus) {
        let mut failed = 0usize;
        for idx in 0..self.slots.len() {
            let Some(request) = self.slots[idx].pending.take() else {
                continue;
            };
            self.slots[idx].generation = self.slots[idx].generation.wrapping_add(1);
            self.free.push(idx);
            deliver(
                request.completion,
                IoCompletion {
                    status,
                    bytes_transferred: 0,
                    buffer: request.source,
                },
            );
            arena.release(request.shared, request.mapping);
            failed += 1;
        }
        if failed > 0 {
            trace!(failed, ?status, "force-failed pending requests");
        }
    }

    fn register(&mut self, request: PendingRequest) -> u64 {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].pending = Some(request);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    pending: Some(request),
                });
                self.slots.len() - 1
            }
        };
        pack_handle(idx, self.slots[idx].generation)
    }

    fn remove(&mut self, handle: u64) -> Option<PendingRequest> {
        let (idx, generation) = unpack_handle(handle);
        let slot = self.slots.get_mut(idx)?;
        if slot.generation != generation {
            return None;
        }
        let request = slot.pending.take()?;
        // Bump so the handle can never match again, then recycle the slot.
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        Some(request)
    }
}

fn deliver(completion: oneshot::Sender<IoCompletion>, outcome: IoCompletion) {
    if completion.send(outcome).is_err() {
        trace!("completion receiver dropped");
    }
}

fn pack_handle(idx: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | idx as u64
}

fn unpack_handle(handle: u64) -> (usize, u32) {
    ((handle & u32::MAX as u64) as usize, (handle >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloop_proto::{MessageId, RESULT_IO_ERROR};

    const HELPER_BASE: u64 = 0x7f00_0000_0000;

    fn arena() -> SharedArena {
        let mut arena = SharedArena::create(64 * 1024).unwrap();
        arena.set_helper_base(HELPER_BASE);
        arena
    }

    fn geometry() -> DeviceGeometry {
        DeviceGeometry::new(1000, false)
    }

    fn stage_read(
        tracker: &mut RequestTracker,
        arena: &mut SharedArena,
        offset: u64,
        count: u64,
    ) -> (u64, Frame, oneshot::Receiver<IoCompletion>) {
        let (tx, rx) = oneshot::channel();
        let (handle, frame) = tracker
            .create(
                arena,
                &geometry(),
                Direction::Read,
                offset,
                count,
                vec![0u8; (count * 512) as usize],
                tx,
            )
            .unwrap();
        (handle, frame, rx)
    }

    #[test]
    fn staged_frame_carries_request() {
        let mut arena = arena();
        let mut tracker = RequestTracker::new();
        let (handle, frame, _rx) = stage_read(&mut tracker, &mut arena, 8, 4);
        assert_eq!(frame.message_id, MessageId::IoRequest);
        assert_eq!(frame.offset, 8);
        assert_eq!(frame.block_count, 4);
        assert_eq!(frame.direction, Direction::Read);
        assert_eq!(frame.handle, handle);
        assert!(frame.buffer_addr >= HELPER_BASE);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn validation_failures_allocate_nothing() {
        let mut arena = arena();
        let free_before = arena.free_bytes();
        let mut tracker = RequestTracker::new();

        let (tx, _rx) = oneshot::channel();
        let err = tracker
            .create(
                &mut arena,
                &geometry(),
                Direction::Read,
                999,
                4,
                vec![0u8; 2048],
                tx,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let (tx, _rx) = oneshot::channel();
        let err = tracker
            .create(
                &mut arena,
                &DeviceGeometry::new(1000, true),
                Direction::Write,
                0,
                1,
                vec![0u8; 512],
                tx,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnlyViolation);

        assert_eq!(arena.free_bytes(), free_before);
        assert!(tracker.is_empty());
    }

    #[test]
    fn caller_buffer_must_match_transfer_size() {
        let mut arena = arena();
        let mut tracker = RequestTracker::new();
        let (tx, _rx) = oneshot::channel();
        let err = tracker
            .create(
                &mut arena,
                &geometry(),
                Direction::Write,
                0,
                4,
                vec![0u8; 512],
                tx,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }

    #[test]
    fn completion_fires_exactly_once() {
        let mut arena = arena();
        let mut tracker = RequestTracker::new();
        let (handle, _frame, mut rx) = stage_read(&mut tracker, &mut arena, 0, 4);

        tracker.complete(&mut arena, handle, RESULT_SUCCESS).unwrap();
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status, IoStatus::Success);
        assert_eq!(completion.bytes_transferred, 2048);

        // Second completion for the same handle is a protocol violation
        // and must not produce a second delivery.
        let err = tracker
            .complete(&mut arena, handle, RESULT_SUCCESS)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(tracker.is_empty());
    }

    #[test]
    fn stale_handle_after_slot_reuse_is_rejected() {
        let mut arena = arena();
        let mut tracker = RequestTracker::new();
        let (old_handle, _f, _rx) = stage_read(&mut tracker, &mut arena, 0, 1);
        tracker
            .complete(&mut arena, old_handle, RESULT_SUCCESS)
            .unwrap();

        // Slot is recycled with a fresh generation.
        let (new_handle, _f, _rx2) = stage_read(&mut tracker, &mut arena, 0, 1);
        assert_ne!(old_handle, new_handle);
        let err = tracker
            .complete(&mut arena, old_handle, RESULT_SUCCESS)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn failed_completion_reports_zero_bytes() {
        let mut arena = arena();
        let mut tracker = RequestTracker::new();
        let (handle, _f, mut rx) = stage_read(&mut tracker, &mut arena, 0, 2);
        tracker
            .complete(&mut arena, handle, RESULT_IO_ERROR)
            .unwrap();
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status, IoStatus::IoError);
        assert_eq!(completion.bytes_transferred, 0);
        assert_eq!(completion.buffer.len(), 1024);
    }

    #[test]
    fn out_of_order_completions_keep_buffers_apart() {
        let mut arena = arena();
        let mut tracker = RequestTracker::new();
        let (h1, f1, mut rx1) = stage_read(&mut tracker, &mut arena, 0, 1);
        let (h2, f2, mut rx2) = stage_read(&mut tracker, &mut arena, 1, 1);
        assert_ne!(f1.buffer_addr, f2.buffer_addr);

        // Simulate the helper filling each shared segment with a distinct
        // pattern, then completing in reverse dispatch order.
        fill_segment(&mut arena, &mut tracker, h1, 0x11);
        fill_segment(&mut arena, &mut tracker, h2, 0x22);
        tracker.complete(&mut arena, h2, RESULT_SUCCESS).unwrap();
        tracker.complete(&mut arena, h1, RESULT_SUCCESS).unwrap();

        assert!(rx1.try_recv().unwrap().buffer.iter().all(|b| *b == 0x11));
        assert!(rx2.try_recv().unwrap().buffer.iter().all(|b| *b == 0x22));
    }

    #[test]
    fn force_fail_all_aborts_every_pending_request() {
        let mut arena = arena();
        let free_before = arena.free_bytes();
        let mut tracker = RequestTracker::new();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (_h, _f, rx) = stage_read(&mut tracker, &mut arena, i, 1);
            receivers.push(rx);
        }

        tracker.force_fail_all(&mut arena, IoStatus::Aborted);

        assert!(tracker.is_empty());
        assert_eq!(arena.free_bytes(), free_before);
        for mut rx in receivers {
            let completion = rx.try_recv().unwrap();
            assert_eq!(completion.status, IoStatus::Aborted);
            assert_eq!(completion.bytes_transferred, 0);
        }
    }

    #[test]
    fn abort_dispatch_releases_without_delivery() {
        let mut arena = arena();
        let free_before = arena.free_bytes();
        let mut tracker = RequestTracker::new();
        let (handle, _f, mut rx) = stage_read(&mut tracker, &mut arena, 0, 1);
        tracker.abort_dispatch(&mut arena, handle);
        assert!(tracker.is_empty());
        assert_eq!(arena.free_bytes(), free_before);
        assert!(rx.try_recv().is_err());
    }

    /// Write a pattern into a pending request's shared segment the way the
    /// helper would through its own mapping.
    fn fill_segment(arena: &mut SharedArena, tracker: &mut RequestTracker, handle: u64, byte: u8) {
        let (idx, _) = super::unpack_handle(handle);
        let request = tracker.slots[idx].pending.as_ref().unwrap();
        let pattern = vec![byte; request.source.len()];
        arena.copy_in(&request.shared, &pattern).unwrap();
    }
}
