use anyhow::{bail, Context, Result};
use bloop_core::FsDirectory;
use bloop_helper::{BackingFile, HelperSession, SessionEnd};
use bloop_ipc::connect_helper;
use bloop_proto::{AttachControl, BLOCK_SIZE};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::time;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bloopctl")]
#[command(about = "Attach a file as a loop block device", long_about = None)]
struct Args {
    /// File to expose as a block device
    file: PathBuf,
    /// Attach read-only
    #[arg(short = 'r', long)]
    read_only: bool,
    /// bloopd control socket
    #[arg(long, default_value = "/run/bloop/bloopd.sock")]
    socket: PathBuf,
    /// Directory bloopd publishes device records into
    #[arg(long, default_value = "/run/bloop/devices")]
    state_dir: PathBuf,
    /// Seconds to wait for the device to appear
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let file = if args.read_only {
        BackingFile::open_read_only(&args.file).await?
    } else {
        let file = BackingFile::open(&args.file).await?;
        if !file.writable() {
            warn!(
                file = %args.file.display(),
                "write access denied, attaching read-only"
            );
        }
        file
    };

    let total_blocks = file.total_blocks();
    if total_blocks == 0 {
        bail!(
            "{} is smaller than one {BLOCK_SIZE}-byte block",
            args.file.display()
        );
    }
    let remainder = file.len() % BLOCK_SIZE as u64;
    if remainder != 0 {
        warn!(
            file = %args.file.display(),
            trailing_bytes = remainder,
            "file size is not a multiple of the block size, trailing bytes ignored"
        );
    }

    let pid = nix::unistd::getpid().as_raw();
    let control = AttachControl::new(total_blocks, !file.writable(), pid);
    info!(
        file = %args.file.display(),
        blocks = total_blocks,
        read_only = !file.writable(),
        "attaching"
    );
    let (channel, arena) = connect_helper(&args.socket, control)
        .await
        .context("attach to bloopd")?;

    let device = wait_for_device(&args, pid).await?;
    info!(device = %device, "device ready");

    let session = HelperSession::new(channel, arena, file);
    tokio::select! {
        end = session.run() => match end.context("helper session")? {
            SessionEnd::Terminated => {
                info!(device = %device, "device terminated");
                Ok(())
            }
            SessionEnd::ChannelClosed => bail!("bloopd closed the notification channel"),
        },
        _ = signal::ctrl_c() => {
            info!("interrupted, detaching");
            Ok(())
        }
    }
}

/// The record shows up only after bloopd finishes the attach, so poll
/// the service directory for a bounded time.
async fn wait_for_device(args: &Args, pid: i32) -> Result<String> {
    let directory = FsDirectory::new(&args.state_dir);
    let deadline = time::Instant::now() + Duration::from_secs(args.wait_secs);
    loop {
        if let Some(record) = directory.find_by_pid(pid)? {
            return Ok(record.device);
        }
        if time::Instant::now() >= deadline {
            bail!(
                "no device appeared under {} within {}s",
                args.state_dir.display(),
                args.wait_secs
            );
        }
        time::sleep(Duration::from_millis(100)).await;
    }
}
