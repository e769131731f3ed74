//! Unix-socket transport between the bloop driver and its helpers: the
//! attach handshake (with arena fd passing), the notification channel,
//! and the completion pump.

mod attach;
pub mod handshake;
mod helper;
mod notify;

pub use attach::{bind_helper, connect_helper, read_attach_control, DEFAULT_ARENA_LEN};
pub use helper::UnixHelperChannel;
pub use notify::{spawn_completion_pump, UnixNotifySender};
