#![no_std]

use core::{convert::TryFrom, fmt};

/// Fixed logical block size of every bloop device, in bytes.
pub const BLOCK_SIZE: u32 = 512;
/// Upper bound on a single request's transfer, in blocks.
pub const MAX_TRANSFER_BLOCKS: u64 = 20480;
/// Upper bound on a single request's transfer, in bytes (10 MiB).
pub const MAX_TRANSFER_BYTES: u64 = BLOCK_SIZE as u64 * MAX_TRANSFER_BLOCKS;

/// Number of bytes in an encoded notification [`Frame`].
pub const FRAME_LEN: usize = 48;
/// Number of bytes in an encoded [`AttachControl`] message.
pub const ATTACH_CONTROL_LEN: usize = 16;
/// Number of bytes in an encoded [`ArenaGrant`] message.
pub const ARENA_GRANT_LEN: usize = 8;
/// Number of bytes in an encoded [`ArenaBase`] message.
pub const ARENA_BASE_LEN: usize = 8;

/// Wire result: request completed successfully.
pub const RESULT_SUCCESS: u32 = 0;
/// Wire result: helper-side file I/O failed.
pub const RESULT_IO_ERROR: u32 = 5;
/// Wire result: write rejected by a read-only helper.
pub const RESULT_READ_ONLY: u32 = 30;
/// Wire result: request force-failed during detach/terminate.
pub const RESULT_ABORTED: u32 = 125;

/// Errors surfaced while decoding protocol messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Incoming message id is unsupported.
    InvalidMessageId(u32),
    /// Direction field is neither Read nor Write.
    InvalidDirection(u32),
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid message length {actual}, expected {expected}")
            }
            ProtoError::InvalidMessageId(id) => write!(f, "invalid message id {id}"),
            ProtoError::InvalidDirection(dir) => write!(f, "invalid direction {dir}"),
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

impl core::error::Error for ProtoError {}

/// Result alias for protocol parsing operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Kinds of notification flowing from the driver to the helper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageId {
    /// New I/O request; the frame body describes it.
    IoRequest = 0,
    /// Device is going away; the helper must close its session.
    Terminate = 1,
}

impl TryFrom<u32> for MessageId {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::IoRequest),
            1 => Ok(Self::Terminate),
            other => Err(ProtoError::InvalidMessageId(other)),
        }
    }
}

/// Transfer direction relative to the backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

impl TryFrom<u32> for Direction {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            other => Err(ProtoError::InvalidDirection(other)),
        }
    }
}

/// One notification frame, used both driver→helper (request, terminate)
/// and helper→driver (completion: the request echoed with `result` set).
///
/// Encoded layout, little-endian, 48 bytes:
///
/// ```text
/// 0..4   message_id   4..8   reserved (zero)
/// 8..16  offset       16..24 block_count
/// 24..32 buffer_addr  32..36 direction
/// 36..40 result       40..48 handle
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub message_id: MessageId,
    /// File offset in blocks.
    pub offset: u64,
    /// Number of blocks to transfer.
    pub block_count: u64,
    /// Shared-buffer address in the helper's address space.
    pub buffer_addr: u64,
    pub direction: Direction,
    /// Zero on request; completion status set by the helper.
    pub result: u32,
    /// Opaque correlation value, round-tripped unexamined by the helper.
    pub handle: u64,
}

impl Frame {
    /// Build an I/O request frame with a zeroed result field.
    pub const fn io_request(
        offset: u64,
        block_count: u64,
        buffer_addr: u64,
        direction: Direction,
        handle: u64,
    ) -> Self {
        Self {
            message_id: MessageId::IoRequest,
            offset,
            block_count,
            buffer_addr,
            direction,
            result: RESULT_SUCCESS,
            handle,
        }
    }

    /// Build a terminate notification. Carries no payload; the body is zeroed.
    pub const fn terminate() -> Self {
        Self {
            message_id: MessageId::Terminate,
            offset: 0,
            block_count: 0,
            buffer_addr: 0,
            direction: Direction::Read,
            result: RESULT_SUCCESS,
            handle: 0,
        }
    }

    /// Turn a request frame into its completion, with `result` filled in.
    pub const fn into_completion(mut self, result: u32) -> Self {
        self.result = result;
        self
    }

    pub fn encode(self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&(self.message_id as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.block_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.buffer_addr.to_le_bytes());
        buf[32..36].copy_from_slice(&(self.direction as u32).to_le_bytes());
        buf[36..40].copy_from_slice(&self.result.to_le_bytes());
        buf[40..48].copy_from_slice(&self.handle.to_le_bytes());
        buf
    }

    pub fn decode(bytes: [u8; FRAME_LEN]) -> Result<Self> {
        let message_id = MessageId::try_from(read_u32(&bytes[0..4]))?;
        if read_u32(&bytes[4..8]) != 0 {
            return Err(ProtoError::InvalidValue("reserved bytes must be zero"));
        }
        Ok(Self {
            message_id,
            offset: read_u64(&bytes[8..16]),
            block_count: read_u64(&bytes[16..24]),
            buffer_addr: read_u64(&bytes[24..32]),
            direction: Direction::try_from(read_u32(&bytes[32..36]))?,
            result: read_u32(&bytes[36..40]),
            handle: read_u64(&bytes[40..48]),
        })
    }
}

impl TryFrom<&[u8]> for Frame {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != FRAME_LEN {
            return Err(ProtoError::InvalidLength {
                expected: FRAME_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; FRAME_LEN];
        buf.copy_from_slice(value);
        Self::decode(buf)
    }
}

/// Attach control message sent by the helper to create a new device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachControl {
    /// Device size in blocks.
    pub size: u64,
    /// Nonzero when the device must refuse writes.
    pub readonly: i32,
    /// Helper process id, published for discovery.
    pub pid: i32,
}

impl AttachControl {
    pub const fn new(size: u64, readonly: bool, pid: i32) -> Self {
        Self {
            size,
            readonly: readonly as i32,
            pid,
        }
    }

    pub const fn read_only(&self) -> bool {
        self.readonly != 0
    }

    pub fn encode(self) -> [u8; ATTACH_CONTROL_LEN] {
        let mut buf = [0u8; ATTACH_CONTROL_LEN];
        buf[0..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.readonly.to_le_bytes());
        buf[12..16].copy_from_slice(&self.pid.to_le_bytes());
        buf
    }

    pub fn decode(bytes: [u8; ATTACH_CONTROL_LEN]) -> Result<Self> {
        Ok(Self {
            size: read_u64(&bytes[0..8]),
            readonly: read_u32(&bytes[8..12]) as i32,
            pid: read_u32(&bytes[12..16]) as i32,
        })
    }
}

impl TryFrom<&[u8]> for AttachControl {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != ATTACH_CONTROL_LEN {
            return Err(ProtoError::InvalidLength {
                expected: ATTACH_CONTROL_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; ATTACH_CONTROL_LEN];
        buf.copy_from_slice(value);
        Self::decode(buf)
    }
}

/// Shared-arena grant accompanying the memfd during the attach handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaGrant {
    /// Arena length in bytes.
    pub len: u64,
}

impl ArenaGrant {
    pub fn encode(self) -> [u8; ARENA_GRANT_LEN] {
        self.len.to_le_bytes()
    }

    pub fn decode(bytes: [u8; ARENA_GRANT_LEN]) -> Result<Self> {
        let len = u64::from_le_bytes(bytes);
        if len == 0 {
            return Err(ProtoError::InvalidValue("arena length must be non-zero"));
        }
        Ok(Self { len })
    }
}

/// Helper's reply to an [`ArenaGrant`]: where the arena landed in its
/// address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaBase {
    pub base: u64,
}

impl ArenaBase {
    pub fn encode(self) -> [u8; ARENA_BASE_LEN] {
        self.base.to_le_bytes()
    }

    pub fn decode(bytes: [u8; ARENA_BASE_LEN]) -> Result<Self> {
        let base = u64::from_le_bytes(bytes);
        if base == 0 {
            return Err(ProtoError::InvalidValue("arena base must be non-zero"));
        }
        Ok(Self { base })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_request_round_trip() {
        let frame = Frame::io_request(7, 4, 0xdead_0000, Direction::Write, 0x1_0000_0002);
        let bytes = frame.encode();
        assert_eq!(Frame::decode(bytes).unwrap(), frame);
        assert_eq!(Frame::try_from(bytes.as_slice()).unwrap(), frame);
    }

    #[test]
    fn layout_is_fixed() {
        let frame = Frame::io_request(1, 2, 3, Direction::Write, 4);
        let bytes = frame.encode();
        assert_eq!(&bytes[0..4], &0u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &1u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &2u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &3u64.to_le_bytes());
        assert_eq!(&bytes[32..36], &1u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &0u32.to_le_bytes());
        assert_eq!(&bytes[40..48], &4u64.to_le_bytes());
    }

    #[test]
    fn terminate_has_zero_body() {
        let bytes = Frame::terminate().encode();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert!(bytes[4..].iter().all(|b| *b == 0));
        let decoded = Frame::decode(bytes).unwrap();
        assert_eq!(decoded.message_id, MessageId::Terminate);
    }

    #[test]
    fn completion_preserves_correlation() {
        let frame = Frame::io_request(0, 1, 0x1000, Direction::Read, 42);
        let completion = frame.into_completion(RESULT_IO_ERROR);
        assert_eq!(completion.handle, 42);
        assert_eq!(completion.result, RESULT_IO_ERROR);
        let decoded = Frame::decode(completion.encode()).unwrap();
        assert_eq!(decoded, completion);
    }

    #[test]
    fn bad_message_id() {
        let mut bytes = Frame::terminate().encode();
        bytes[0] = 0xFF;
        assert!(matches!(
            Frame::decode(bytes),
            Err(ProtoError::InvalidMessageId(0xFF))
        ));
    }

    #[test]
    fn bad_direction() {
        let mut bytes = Frame::io_request(0, 1, 0, Direction::Read, 0).encode();
        bytes[32] = 7;
        assert!(matches!(
            Frame::decode(bytes),
            Err(ProtoError::InvalidDirection(7))
        ));
    }

    #[test]
    fn reserved_bytes_guard() {
        let mut bytes = Frame::io_request(0, 1, 0, Direction::Read, 0).encode();
        bytes[5] = 1;
        assert!(matches!(
            Frame::decode(bytes),
            Err(ProtoError::InvalidValue(_))
        ));
    }

    #[test]
    fn frame_length_guard() {
        assert!(matches!(
            Frame::try_from(&[0u8; 47][..]),
            Err(ProtoError::InvalidLength {
                expected: 48,
                actual: 47
            })
        ));
    }

    #[test]
    fn attach_control_round_trip() {
        let ctl = AttachControl::new(204800, true, 4321);
        let decoded = AttachControl::decode(ctl.encode()).unwrap();
        assert_eq!(decoded, ctl);
        assert!(decoded.read_only());
        assert_eq!(decoded.pid, 4321);
    }

    #[test]
    fn attach_control_writable() {
        let ctl = AttachControl::new(100, false, 1);
        assert!(!AttachControl::decode(ctl.encode()).unwrap().read_only());
    }

    #[test]
    fn arena_messages_reject_zero() {
        assert!(ArenaGrant::decode(0u64.to_le_bytes()).is_err());
        assert!(ArenaBase::decode(0u64.to_le_bytes()).is_err());
        let grant = ArenaGrant { len: 1 << 20 };
        assert_eq!(ArenaGrant::decode(grant.encode()).unwrap(), grant);
    }

    #[test]
    fn max_transfer_is_ten_mib() {
        assert_eq!(MAX_TRANSFER_BYTES, 10 * 1024 * 1024);
    }
}
