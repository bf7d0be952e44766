//! Platform glue.
//!
//! Spec §1 names Unix socket/notifier primitives only (epoll and poll
//! backends, no IPv6, no Windows). The crate is built for Unix targets.
#[cfg(unix)]
pub use self::unix::*;

#[cfg(unix)]
mod unix;

#[cfg(not(unix))]
compile_error!("reactor_net currently supports Unix targets only (epoll/poll notifier backends)");
