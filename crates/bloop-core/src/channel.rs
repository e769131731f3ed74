use anyhow::Result;
use async_trait::async_trait;
use bloop_proto::Frame;

/// Driver-side handle to the notification channel: one-way, ordered,
/// best-effort delivery towards the helper.
///
/// Send failures are surfaced to the caller; the driver maps an
/// `IoRequest` failure to `DispatchFailed` and ignores `Terminate`
/// failures (the helper may already be gone).
#[async_trait]
pub trait NotifySender: Send {
    /// Deliver an I/O request notification to the helper.
    async fn send_io_request(&mut self, frame: Frame) -> Result<()>;

    /// Deliver a terminate notification to the helper.
    async fn send_terminate(&mut self) -> Result<()>;
}
