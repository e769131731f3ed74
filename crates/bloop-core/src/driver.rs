//! Driver state machine: helper attachment lifecycle plus request
//! submission and completion, serialized behind one mutex so frames go
//! out in submission order.

use std::sync::Arc;

use bloop_proto::Direction;
use bloop_shm::SharedArena;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::channel::NotifySender;
use crate::directory::{DeviceRecord, ServiceDirectory};
use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::geometry::DeviceGeometry;
use crate::tracker::{IoCompletion, IoStatus, RequestTracker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Unattached,
    Attached,
    Detaching,
    Terminated,
}

/// Everything tied to the currently attached helper. Dropped as a unit
/// on detach, which closes the notification channel and unmaps the arena.
struct HelperBinding {
    notify: Box<dyn NotifySender>,
    pid: i32,
    arena: SharedArena,
}

struct DriverInner {
    lifecycle: Lifecycle,
    binding: Option<HelperBinding>,
    tracker: RequestTracker,
    locked: bool,
}

/// One virtual block device backed by an unprivileged helper process.
///
/// All mutation happens under the inner mutex. The lock is held across
/// the notification send so two concurrent submissions cannot reach the
/// helper out of registration order.
pub struct LoopDriver {
    name: String,
    geometry: DeviceGeometry,
    directory: Option<Arc<dyn ServiceDirectory>>,
    inner: Mutex<DriverInner>,
}

impl LoopDriver {
    pub fn new(
        name: impl Into<String>,
        geometry: DeviceGeometry,
        directory: Option<Arc<dyn ServiceDirectory>>,
    ) -> Self {
        Self {
            name: name.into(),
            geometry,
            directory,
            inner: Mutex::new(DriverInner {
                lifecycle: Lifecycle::Unattached,
                binding: None,
                tracker: RequestTracker::new(),
                locked: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    /// Bind a helper to the device and publish it for discovery.
    ///
    /// The arena must already carry the helper's reported base address.
    pub async fn attach(
        &self,
        notify: Box<dyn NotifySender>,
        pid: i32,
        arena: SharedArena,
    ) -> DriverResult<()> {
        {
            let mut inner = self.inner.lock().await;
            match inner.lifecycle {
                Lifecycle::Unattached => {}
                Lifecycle::Terminated => {
                    return Err(DriverError::with_message(
                        ErrorKind::AlreadyTerminated,
                        "device has been terminated",
                    ))
                }
                _ => {
                    return Err(DriverError::with_message(
                        ErrorKind::AlreadyAttached,
                        format!("helper already attached to {}", self.name),
                    ))
                }
            }
            inner.binding = Some(HelperBinding { notify, pid, arena });
            inner.lifecycle = Lifecycle::Attached;
        }
        info!(device = %self.name, pid, "helper attached");
        if let Some(directory) = &self.directory {
            directory.publish(&DeviceRecord {
                device: self.name.clone(),
                pid,
                total_blocks: self.geometry.total_blocks(),
                read_only: self.geometry.read_only(),
            })?;
        }
        Ok(())
    }

    /// Submit one read or write. Returns the channel on which the
    /// completion will arrive; the caller's buffer rides through it.
    pub async fn submit(
        &self,
        direction: Direction,
        block_offset: u64,
        block_count: u64,
        buffer: Vec<u8>,
    ) -> DriverResult<oneshot::Receiver<IoCompletion>> {
        let mut inner = self.inner.lock().await;
        match inner.lifecycle {
            Lifecycle::Attached => {}
            Lifecycle::Terminated => {
                return Err(DriverError::with_message(
                    ErrorKind::AlreadyTerminated,
                    "device has been terminated",
                ))
            }
            _ => {
                return Err(DriverError::with_message(
                    ErrorKind::NotAttached,
                    format!("{} has no attached helper", self.name),
                ))
            }
        }
        let DriverInner {
            tracker, binding, ..
        } = &mut *inner;
        let binding = binding
            .as_mut()
            .ok_or_else(|| DriverError::new(ErrorKind::NotAttached))?;

        let (tx, rx) = oneshot::channel();
        let (handle, frame) = tracker.create(
            &mut binding.arena,
            &self.geometry,
            direction,
            block_offset,
            block_count,
            buffer,
            tx,
        )?;

        // Still under the lock: send order equals registration order.
        if let Err(err) = binding.notify.send_io_request(frame).await {
            tracker.abort_dispatch(&mut binding.arena, handle);
            return Err(DriverError::with_message(
                ErrorKind::DispatchFailed,
                format!("notification send failed: {err:#}"),
            ));
        }
        Ok(rx)
    }

    /// Apply a helper-reported completion to its pending request.
    pub async fn complete(&self, handle: u64, result: u32) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        let DriverInner {
            tracker, binding, ..
        } = &mut *inner;
        let binding = binding.as_mut().ok_or_else(|| {
            DriverError::with_message(ErrorKind::NotAttached, "completion with no helper attached")
        })?;
        tracker.complete(&mut binding.arena, handle, result)
    }

    /// Tear down the helper binding. Every pending request fails with
    /// [`IoStatus::Aborted`] and the device returns to the unattached
    /// state, ready for a new helper.
    pub async fn detach(&self) -> DriverResult<()> {
        {
            let mut inner = self.inner.lock().await;
            match inner.lifecycle {
                Lifecycle::Attached => {}
                Lifecycle::Unattached | Lifecycle::Detaching => return Ok(()),
                Lifecycle::Terminated => {
                    return Err(DriverError::with_message(
                        ErrorKind::AlreadyTerminated,
                        "device has been terminated",
                    ))
                }
            }
            inner.lifecycle = Lifecycle::Detaching;
            if let Some(mut binding) = inner.binding.take() {
                inner
                    .tracker
                    .force_fail_all(&mut binding.arena, IoStatus::Aborted);
            }
            inner.lifecycle = Lifecycle::Unattached;
        }
        info!(device = %self.name, "helper detached");
        if let Some(directory) = &self.directory {
            directory.unpublish(&self.name)?;
        }
        Ok(())
    }

    /// Permanently retire the device. The helper gets a best-effort
    /// terminate notification, pending requests abort, and the device
    /// refuses all further attachments.
    pub async fn terminate(&self) -> DriverResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.lifecycle == Lifecycle::Terminated {
                return Err(DriverError::with_message(
                    ErrorKind::AlreadyTerminated,
                    "device has been terminated",
                ));
            }
            inner.lifecycle = Lifecycle::Terminated;
            if let Some(mut binding) = inner.binding.take() {
                if let Err(err) = binding.notify.send_terminate().await {
                    debug!(device = %self.name, error = %format!("{err:#}"), "terminate notification not delivered");
                }
                inner
                    .tracker
                    .force_fail_all(&mut binding.arena, IoStatus::Aborted);
            }
        }
        info!(device = %self.name, "device terminated");
        if let Some(directory) = &self.directory {
            directory.unpublish(&self.name)?;
        }
        Ok(())
    }

    /// Media lock, honored by [`eject`](Self::eject).
    pub async fn set_locked(&self, locked: bool) {
        let mut inner = self.inner.lock().await;
        inner.locked = locked;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.lock().await.locked
    }

    /// Eject the media. Refused while the media lock is held; otherwise
    /// this terminates the device.
    pub async fn eject(&self) -> DriverResult<()> {
        {
            let inner = self.inner.lock().await;
            if inner.lifecycle == Lifecycle::Terminated {
                return Err(DriverError::with_message(
                    ErrorKind::AlreadyTerminated,
                    "device has been terminated",
                ));
            }
            if inner.locked {
                warn!(device = %self.name, "eject refused, media is locked");
                return Err(DriverError::with_message(
                    ErrorKind::NotPermitted,
                    "media is locked",
                ));
            }
        }
        self.terminate().await
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.lifecycle == Lifecycle::Attached
    }

    pub async fn is_terminated(&self) -> bool {
        self.inner.lock().await.lifecycle == Lifecycle::Terminated
    }

    pub async fn pending_requests(&self) -> usize {
        self.inner.lock().await.tracker.len()
    }

    /// Pid of the attached helper, if any.
    pub async fn helper_pid(&self) -> Option<i32> {
        self.inner.lock().await.binding.as_ref().map(|b| b.pid)
    }
}
