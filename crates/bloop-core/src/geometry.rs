use crate::error::{DriverError, DriverResult, ErrorKind};
use bloop_proto::{Direction, BLOCK_SIZE, MAX_TRANSFER_BYTES};

/// Immutable per-device geometry, fixed at driver creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceGeometry {
    total_blocks: u64,
    read_only: bool,
}

impl DeviceGeometry {
    pub const fn new(total_blocks: u64, read_only: bool) -> Self {
        Self {
            total_blocks,
            read_only,
        }
    }

    pub const fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub const fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    pub const fn byte_capacity(&self) -> u64 {
        self.total_blocks * BLOCK_SIZE as u64
    }

    /// Validate a request against the geometry and transfer cap, returning
    /// its byte length. Runs before any allocation happens.
    pub fn validate(
        &self,
        direction: Direction,
        block_offset: u64,
        block_count: u64,
    ) -> DriverResult<usize> {
        let end = block_offset.checked_add(block_count).ok_or_else(|| {
            DriverError::with_message(ErrorKind::OutOfRange, "block range overflows")
        })?;
        if end > self.total_blocks {
            return Err(DriverError::with_message(
                ErrorKind::OutOfRange,
                format!(
                    "request [{block_offset}, {end}) exceeds {} blocks",
                    self.total_blocks
                ),
            ));
        }
        let byte_len = block_count
            .checked_mul(BLOCK_SIZE as u64)
            .filter(|len| *len <= MAX_TRANSFER_BYTES)
            .ok_or_else(|| {
                DriverError::with_message(
                    ErrorKind::OutOfRange,
                    format!("transfer exceeds {MAX_TRANSFER_BYTES} byte cap"),
                )
            })?;
        if direction == Direction::Write && self.read_only {
            return Err(DriverError::new(ErrorKind::ReadOnlyViolation));
        }
        Ok(byte_len as usize)
    }
}
