use anyhow::{bail, Context, Result};
use bloop_core::{
    BlockDevice, DeviceGeometry, DriverError, ErrorKind, FsDirectory, IoStatus, LoopDriver,
};
use bloop_ipc::{bind_helper, read_attach_control, DEFAULT_ARENA_LEN};
use bloop_proto::{
    Direction, Frame, MessageId, AttachControl, BLOCK_SIZE, FRAME_LEN, MAX_TRANSFER_BLOCKS,
    RESULT_ABORTED, RESULT_IO_ERROR, RESULT_READ_ONLY, RESULT_SUCCESS,
};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bloopd")]
#[command(about = "Loop block device daemon", long_about = None)]
struct Args {
    /// Control socket helpers attach through
    #[arg(long, default_value = "/run/bloop/bloopd.sock")]
    socket: PathBuf,
    /// Directory for published device records
    #[arg(long, default_value = "/run/bloop/devices")]
    state_dir: PathBuf,
    /// Directory for per-device consumer sockets
    #[arg(long, default_value = "/run/bloop")]
    device_dir: PathBuf,
    /// Shared arena granted to each helper, in bytes
    #[arg(long, default_value_t = DEFAULT_ARENA_LEN)]
    arena_bytes: usize,
}

struct Daemon {
    args: Args,
    directory: Arc<FsDirectory>,
    next_device: AtomicU64,
    drivers: Mutex<Vec<Arc<LoopDriver>>>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if let Some(parent) = args.socket.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    fs::create_dir_all(&args.device_dir)
        .with_context(|| format!("create {}", args.device_dir.display()))?;
    // A previous run may have left its socket behind.
    match fs::remove_file(&args.socket) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context("remove stale control socket"),
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("bind {}", args.socket.display()))?;
    info!(socket = %args.socket.display(), "bloopd listening");

    let daemon = Arc::new(Daemon {
        directory: Arc::new(FsDirectory::new(&args.state_dir)),
        next_device: AtomicU64::new(0),
        drivers: Mutex::new(Vec::new()),
        args,
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.context("accept helper connection")?;
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    if let Err(err) = daemon.handle_attach(stream).await {
                        warn!(error = %format!("{err:#}"), "attach failed");
                    }
                });
            }
            _ = signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    daemon.shutdown().await;
    let _ = fs::remove_file(&daemon.args.socket);
    Ok(())
}

impl Daemon {
    async fn handle_attach(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let stream = stream.into_std().context("unregister attach socket")?;
        stream
            .set_nonblocking(false)
            .context("set attach socket blocking")?;
        let (control, stream) = read_attach_control(stream).await?;
        validate_control(&control)?;

        let index = self.next_device.fetch_add(1, Ordering::Relaxed);
        let name = format!("bloop{index}");
        let directory: Arc<dyn bloop_core::ServiceDirectory> = self.directory.clone();
        let driver = Arc::new(LoopDriver::new(
            &name,
            DeviceGeometry::new(control.size, control.read_only()),
            Some(directory),
        ));
        info!(
            device = %name,
            blocks = control.size,
            read_only = control.read_only(),
            pid = control.pid,
            "attaching helper"
        );

        let pump = bind_helper(
            Arc::clone(&driver),
            stream,
            control.pid,
            self.args.arena_bytes,
        )
        .await?;

        let socket_path = self.args.device_dir.join(format!("{name}.sock"));
        let consumer_listener = match bind_consumer_socket(&socket_path) {
            Ok(listener) => listener,
            Err(err) => {
                // The helper is already attached; tear it down rather
                // than leave a device no consumer can reach.
                if let Err(terr) = driver.terminate().await {
                    warn!(device = %name, error = %terr, "terminate after failed bind");
                }
                return Err(err);
            }
        };
        self.drivers.lock().await.push(Arc::clone(&driver));
        let device = BlockDevice::new(Arc::clone(&driver));
        let serve = tokio::spawn(serve_consumers(device, consumer_listener));

        // Device lives until its helper goes away or the daemon stops.
        let daemon = Arc::clone(&self);
        tokio::spawn(async move {
            let _ = pump.await;
            serve.abort();
            let _ = fs::remove_file(&socket_path);
            daemon.forget_driver(&driver).await;
        });
        Ok(())
    }

    /// Drop a dead device from the roster so shutdown only terminates
    /// the live ones.
    async fn forget_driver(&self, driver: &Arc<LoopDriver>) {
        self.drivers
            .lock()
            .await
            .retain(|d| !Arc::ptr_eq(d, driver));
    }

    async fn shutdown(&self) {
        let drivers = self.drivers.lock().await;
        for driver in drivers.iter() {
            match driver.terminate().await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyTerminated => {}
                Err(err) => warn!(device = driver.name(), error = %err, "terminate failed"),
            }
        }
    }
}

/// Bind a device's consumer socket, moving aside whatever an unclean
/// shutdown left behind under the same name.
fn bind_consumer_socket(path: &std::path::Path) -> Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("remove stale {}", path.display())),
    }
    UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))
}

fn validate_control(control: &AttachControl) -> Result<()> {
    if control.size == 0 {
        bail!("attach request for an empty device");
    }
    if control.pid <= 0 {
        bail!("attach request with invalid pid {}", control.pid);
    }
    Ok(())
}

/// Accept consumer connections for one device and serve them until the
/// socket goes away.
async fn serve_consumers(device: BlockDevice, listener: UnixListener) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(err) => {
                warn!(error = %err, "consumer accept failed");
                return;
            }
        };
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_consumer(device, stream).await {
                warn!(error = %format!("{err:#}"), "consumer connection ended");
            }
        });
    }
}

/// One consumer connection: the same 48-byte frames as the helper
/// channel, driver-bound. Writes carry their payload after the frame;
/// successful reads carry theirs after the completion. A `Terminate`
/// frame requests eject.
async fn serve_consumer(device: BlockDevice, mut stream: UnixStream) -> Result<()> {
    loop {
        let mut buf = [0u8; FRAME_LEN];
        match stream.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err).context("read consumer frame"),
        }
        let frame = Frame::decode(buf).context("decode consumer frame")?;

        match frame.message_id {
            MessageId::Terminate => {
                let result = match device.eject().await {
                    Ok(()) => RESULT_SUCCESS,
                    Err(err) => result_code(&err),
                };
                stream
                    .write_all(&frame.into_completion(result).encode())
                    .await
                    .context("write eject reply")?;
                if result == RESULT_SUCCESS {
                    return Ok(());
                }
            }
            MessageId::IoRequest => {
                if frame.block_count > MAX_TRANSFER_BLOCKS {
                    // Cannot trust the framing of an oversized write.
                    bail!("oversized consumer request: {} blocks", frame.block_count);
                }
                let byte_len = (frame.block_count * BLOCK_SIZE as u64) as usize;
                match frame.direction {
                    Direction::Write => {
                        let mut payload = vec![0u8; byte_len];
                        stream
                            .read_exact(&mut payload)
                            .await
                            .context("read write payload")?;
                        let result = match device
                            .write(frame.offset, frame.block_count, payload)
                            .await
                        {
                            Ok(completion) => status_code(completion.status),
                            Err(err) => result_code(&err),
                        };
                        stream
                            .write_all(&frame.into_completion(result).encode())
                            .await
                            .context("write completion")?;
                    }
                    Direction::Read => {
                        match device.read(frame.offset, frame.block_count).await {
                            Ok(completion) if completion.status == IoStatus::Success => {
                                stream
                                    .write_all(
                                        &frame.into_completion(RESULT_SUCCESS).encode(),
                                    )
                                    .await
                                    .context("write completion")?;
                                stream
                                    .write_all(&completion.buffer)
                                    .await
                                    .context("write read payload")?;
                            }
                            Ok(completion) => {
                                stream
                                    .write_all(
                                        &frame
                                            .into_completion(status_code(completion.status))
                                            .encode(),
                                    )
                                    .await
                                    .context("write completion")?;
                            }
                            Err(err) => {
                                stream
                                    .write_all(
                                        &frame.into_completion(result_code(&err)).encode(),
                                    )
                                    .await
                                    .context("write completion")?;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn status_code(status: IoStatus) -> u32 {
    match status {
        IoStatus::Success => RESULT_SUCCESS,
        IoStatus::Aborted => RESULT_ABORTED,
        IoStatus::IoError => RESULT_IO_ERROR,
    }
}

fn result_code(err: &DriverError) -> u32 {
    match err.kind() {
        ErrorKind::ReadOnlyViolation | ErrorKind::NotPermitted => RESULT_READ_ONLY,
        _ => RESULT_IO_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumer_socket_binds_over_a_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bloop0.sock");

        // An unclean shutdown leaves the bound socket file behind.
        let listener = bind_consumer_socket(&path).unwrap();
        drop(listener);
        assert!(path.exists());

        bind_consumer_socket(&path).unwrap();
    }

    #[tokio::test]
    async fn dead_drivers_are_pruned_from_the_roster() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon {
            args: Args {
                socket: dir.path().join("bloopd.sock"),
                state_dir: dir.path().join("devices"),
                device_dir: dir.path().to_path_buf(),
                arena_bytes: DEFAULT_ARENA_LEN,
            },
            directory: Arc::new(FsDirectory::new(dir.path().join("devices"))),
            next_device: AtomicU64::new(0),
            drivers: Mutex::new(Vec::new()),
        };

        let dead = Arc::new(LoopDriver::new("bloop0", DeviceGeometry::new(8, false), None));
        let live = Arc::new(LoopDriver::new("bloop1", DeviceGeometry::new(8, false), None));
        daemon.drivers.lock().await.push(Arc::clone(&dead));
        daemon.drivers.lock().await.push(Arc::clone(&live));

        daemon.forget_driver(&dead).await;
        let drivers = daemon.drivers.lock().await;
        assert_eq!(drivers.len(), 1);
        assert!(Arc::ptr_eq(&drivers[0], &live));
    }
}
