//! Attach handshake over a Unix stream socket.
//!
//! Sequence, helper-initiated:
//!
//! 1. helper → driver: [`AttachControl`] (backing size, access mode, pid)
//! 2. driver → helper: [`ArenaGrant`] with the arena fd as `SCM_RIGHTS`
//! 3. helper → driver: [`ArenaBase`] after mapping the arena
//!
//! The same socket then carries notification frames for the lifetime of
//! the attachment. All handshake I/O is blocking; callers run it on the
//! blocking pool before handing the socket back to the runtime.

use anyhow::{bail, Context, Result};
use bloop_proto::{ArenaBase, ArenaGrant, AttachControl, ARENA_BASE_LEN, ARENA_GRANT_LEN, ATTACH_CONTROL_LEN};
use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Driver side, step 1: receive the helper's attach request.
pub fn accept_attach(stream: &mut UnixStream) -> Result<AttachControl> {
    let mut buf = [0u8; ATTACH_CONTROL_LEN];
    stream
        .read_exact(&mut buf)
        .context("read attach control")?;
    AttachControl::decode(buf).context("decode attach control")
}

/// Driver side, steps 2 and 3: pass the arena over and learn where it
/// landed in the helper's address space.
pub fn grant_arena(stream: &mut UnixStream, arena_fd: BorrowedFd<'_>, arena_len: u64) -> Result<u64> {
    let payload = ArenaGrant { len: arena_len }.encode();
    let iov = [IoSlice::new(&payload)];
    let fds = [arena_fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .context("send arena grant")?;
    if sent != payload.len() {
        bail!("short arena grant send: {sent} of {} bytes", payload.len());
    }

    let mut buf = [0u8; ARENA_BASE_LEN];
    stream.read_exact(&mut buf).context("read arena base")?;
    let base = ArenaBase::decode(buf).context("decode arena base")?;
    Ok(base.base)
}

/// Helper side, steps 1 and 2: send the attach request and receive the
/// arena fd and length.
pub fn request_attach(stream: &mut UnixStream, control: AttachControl) -> Result<(OwnedFd, u64)> {
    stream
        .write_all(&control.encode())
        .context("send attach control")?;

    let mut buf = [0u8; ARENA_GRANT_LEN];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = cmsg_space!([RawFd; 1]);
    let received_fd;
    {
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .context("receive arena grant")?;
        if msg.bytes != ARENA_GRANT_LEN {
            bail!("short arena grant: {} of {ARENA_GRANT_LEN} bytes", msg.bytes);
        }
        let mut fd = None;
        for cmsg in msg.cmsgs().context("parse control messages")? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for raw in fds {
                    if fd.is_none() {
                        // recvmsg hands us ownership of the descriptor.
                        fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                    } else {
                        drop(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
            }
        }
        received_fd = fd;
    }
    let fd = received_fd.context("arena grant carried no file descriptor")?;
    let grant = ArenaGrant::decode(buf).context("decode arena grant")?;
    Ok((fd, grant.len))
}

/// Helper side, step 3: report the mapped arena base.
pub fn report_base(stream: &mut UnixStream, base: u64) -> Result<()> {
    stream
        .write_all(&ArenaBase { base }.encode())
        .context("send arena base")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloop_shm::{HelperArena, SharedArena};
    use std::thread;

    #[test]
    fn full_handshake_passes_arena_across_processes() {
        let (mut driver_end, mut helper_end) = UnixStream::pair().unwrap();
        let arena = SharedArena::create(64 * 1024).unwrap();
        let arena_len = arena.len() as u64;

        let helper = thread::spawn(move || {
            let control = AttachControl {
                size: 4096 * 512,
                readonly: 0,
                pid: 42,
            };
            let (fd, len) = request_attach(&mut helper_end, control).unwrap();
            let helper_arena = HelperArena::map(fd, len as usize).unwrap();
            report_base(&mut helper_end, helper_arena.base()).unwrap();
            helper_arena.base()
        });

        let control = accept_attach(&mut driver_end).unwrap();
        assert_eq!(control.pid, 42);
        assert_eq!(control.size, 4096 * 512);
        let base = grant_arena(&mut driver_end, arena.fd(), arena_len).unwrap();

        let helper_base = helper.join().unwrap();
        assert_eq!(base, helper_base);
        assert_ne!(base, 0);
    }
}
