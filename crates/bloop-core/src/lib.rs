//! Driver side of the bloop userspace loop device.
//!
//! A [`LoopDriver`] owns the lifecycle of one virtual block device backed
//! by an unprivileged helper process: helper attachment, shared-arena
//! buffer staging, request dispatch over a [`NotifySender`], and
//! generation-checked completion correlation. [`BlockDevice`] wraps it in
//! an awaitable read/write surface for consumers.

mod channel;
mod directory;
mod driver;
mod error;
mod facade;
mod geometry;
mod tracker;

pub use channel::NotifySender;
pub use directory::{DeviceRecord, FsDirectory, ServiceDirectory};
pub use driver::LoopDriver;
pub use error::{DriverError, DriverResult, ErrorKind};
pub use facade::BlockDevice;
pub use geometry::DeviceGeometry;
pub use tracker::{IoCompletion, IoStatus};
