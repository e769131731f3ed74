//! Caller-facing block device surface over [`LoopDriver`]: awaitable
//! reads and writes plus the media control operations.

use std::sync::Arc;

use bloop_proto::Direction;
use tracing::debug;

use crate::driver::LoopDriver;
use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::geometry::DeviceGeometry;
use crate::tracker::IoCompletion;

/// Awaitable view of a loop device. Cheap to clone; all clones share the
/// underlying driver.
#[derive(Clone)]
pub struct BlockDevice {
    driver: Arc<LoopDriver>,
}

impl BlockDevice {
    pub fn new(driver: Arc<LoopDriver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<LoopDriver> {
        &self.driver
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.driver.geometry()
    }

    pub fn is_write_protected(&self) -> bool {
        self.driver.geometry().read_only()
    }

    /// Read `block_count` blocks starting at `block_offset` into a fresh
    /// buffer. Resolves once the helper reports completion.
    pub async fn read(&self, block_offset: u64, block_count: u64) -> DriverResult<IoCompletion> {
        // Validate before sizing the buffer; the count is caller-supplied.
        let byte_len = self
            .driver
            .geometry()
            .validate(Direction::Read, block_offset, block_count)?;
        self.read_or_write(Direction::Read, vec![0u8; byte_len], block_offset, block_count)
            .await
    }

    /// Write `buffer` at `block_offset`. The buffer length must be exactly
    /// `block_count * 512`; it comes back inside the completion.
    pub async fn write(
        &self,
        block_offset: u64,
        block_count: u64,
        buffer: Vec<u8>,
    ) -> DriverResult<IoCompletion> {
        self.read_or_write(Direction::Write, buffer, block_offset, block_count)
            .await
    }

    /// Submit one transfer in either direction and await its completion.
    /// `buffer` must hold exactly `block_count * 512` bytes; it returns
    /// through the completion on success and failure alike.
    pub async fn read_or_write(
        &self,
        direction: Direction,
        buffer: Vec<u8>,
        block_offset: u64,
        block_count: u64,
    ) -> DriverResult<IoCompletion> {
        let rx = self
            .driver
            .submit(direction, block_offset, block_count, buffer)
            .await?;
        rx.await.map_err(|_| {
            DriverError::with_message(ErrorKind::IoError, "completion channel closed")
        })
    }

    /// Validate a proposed format capacity against the media. The device
    /// is fixed-capacity, so the only accepted value is its own size.
    pub fn format(&self, byte_capacity: u64) -> DriverResult<u64> {
        let capacity = self.driver.geometry().byte_capacity();
        if byte_capacity != capacity {
            return Err(DriverError::with_message(
                ErrorKind::OutOfRange,
                format!("requested {byte_capacity} bytes, media holds {capacity}"),
            ));
        }
        debug!(device = %self.driver.name(), byte_capacity, "format accepted");
        Ok(capacity)
    }

    /// No volatile write cache sits between the driver and the backing
    /// file, so a cache flush has nothing to do.
    pub fn synchronize_cache(&self) -> DriverResult<()> {
        Ok(())
    }

    pub async fn set_locked(&self, locked: bool) {
        self.driver.set_locked(locked).await;
    }

    pub async fn is_locked(&self) -> bool {
        self.driver.is_locked().await
    }

    pub async fn eject(&self) -> DriverResult<()> {
        self.driver.eject().await
    }
}
