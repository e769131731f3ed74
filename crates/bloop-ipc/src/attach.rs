//! End-to-end attach flows built on [`handshake`](crate::handshake):
//! the driver side binds a helper socket to a [`LoopDriver`], the helper
//! side turns a connected socket into a running session's inputs.

use anyhow::{Context, Result};
use bloop_core::LoopDriver;
use bloop_proto::AttachControl;
use bloop_shm::{HelperArena, SharedArena};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::task::{self, JoinHandle};
use tracing::info;

use crate::handshake;
use crate::helper::UnixHelperChannel;
use crate::notify::{spawn_completion_pump, UnixNotifySender};

/// Arena size granted to each helper. Large enough for a full-size
/// transfer plus headroom for concurrent smaller requests.
pub const DEFAULT_ARENA_LEN: usize = 16 * 1024 * 1024;

/// Driver side, phase one: read the helper's attach request off a
/// freshly accepted socket. The socket must still be in blocking mode.
pub async fn read_attach_control(
    stream: StdUnixStream,
) -> Result<(AttachControl, StdUnixStream)> {
    task::spawn_blocking(move || {
        let mut stream = stream;
        let control = handshake::accept_attach(&mut stream)?;
        Ok((control, stream))
    })
    .await
    .context("attach control task panicked")?
}

/// Driver side, phase two: grant an arena, bind the socket to the driver
/// as its notification channel, and start the completion pump.
pub async fn bind_helper(
    driver: Arc<LoopDriver>,
    stream: StdUnixStream,
    pid: i32,
    arena_len: usize,
) -> Result<JoinHandle<()>> {
    let arena = SharedArena::create(arena_len)?;
    let (arena, stream) = task::spawn_blocking(move || {
        let mut arena = arena;
        let mut stream = stream;
        let base = handshake::grant_arena(&mut stream, arena.fd(), arena.len() as u64)?;
        arena.set_helper_base(base);
        Ok::<_, anyhow::Error>((arena, stream))
    })
    .await
    .context("arena grant task panicked")??;

    stream
        .set_nonblocking(true)
        .context("set attach socket non-blocking")?;
    let stream = UnixStream::from_std(stream).context("register attach socket")?;
    let (reader, writer) = stream.into_split();

    driver
        .attach(Box::new(UnixNotifySender::new(writer)), pid, arena)
        .await?;
    info!(device = driver.name(), pid, "helper bound");
    Ok(spawn_completion_pump(driver, reader))
}

/// Helper side: connect, hand over the attach request, map the granted
/// arena, and report back where it landed. Returns the channel for the
/// session plus the mapped arena.
pub async fn connect_helper(
    socket: &Path,
    control: AttachControl,
) -> Result<(UnixHelperChannel, HelperArena)> {
    let socket = socket.to_path_buf();
    let (stream, arena) = task::spawn_blocking(move || {
        let mut stream = StdUnixStream::connect(&socket)
            .with_context(|| format!("connect {}", socket.display()))?;
        let (fd, len) = handshake::request_attach(&mut stream, control)?;
        let arena = HelperArena::map(fd, len as usize)?;
        handshake::report_base(&mut stream, arena.base())?;
        Ok::<_, anyhow::Error>((stream, arena))
    })
    .await
    .context("attach task panicked")??;

    stream
        .set_nonblocking(true)
        .context("set attach socket non-blocking")?;
    let stream = UnixStream::from_std(stream).context("register attach socket")?;
    Ok((UnixHelperChannel::new(stream), arena))
}
