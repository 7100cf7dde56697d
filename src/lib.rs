//! Small embeddable event-driven I/O core for Linux.
//!
//! `evio` is built around a [`Monitor`]: an epoll-backed readiness
//! multiplexer owning a set of [`Source`]s, each wrapping one file
//! descriptor with an I/O intent and a dispatch hook. The monitor exposes a
//! single readiness descriptor; an external event loop blocks on it and
//! calls [`Monitor::process_events`], which drains ready events and invokes
//! each ready source's hook. Everything is single-threaded and cooperative:
//! hooks may freely re-enter the monitor, and sources hitting error events
//! are removed automatically.
//!
//! On top of the monitor the crate provides:
//!
//! - [`Io`], a duplex stream engine with a ring-buffered, callback-parsed
//!   read path and a FIFO write queue guarded by a watchdog timer;
//! - [`TimerSource`], periodic timers over `timerfd`;
//! - [`SignalSource`], signal demultiplexing over `signalfd` with scoped
//!   signal-mask acquisition;
//! - [`MsgSource`], fixed-length message framing;
//! - [`FdSource`], a generic source over any descriptor.
//!
//! The crate performs no waiting itself: every operation either completes
//! immediately or relies on level-triggered readiness to be resumed by a
//! later drain.
#![warn(missing_docs, missing_debug_implementations)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("evio requires the Linux readiness APIs (epoll, timerfd, signalfd)");

#[macro_use]
mod sys;

mod event;
mod io;
mod monitor;
mod msg;
mod ring;
mod signal;
mod source;
mod timer;

pub use crate::event::{Direction, EventSet};
pub use crate::sys::pipe;
pub use crate::io::{
    Io, IoState, WriteBuffer, WriteStatus, DEFAULT_WRITE_TIMEOUT, IO_RING_CAPACITY,
};
pub use crate::monitor::{Monitor, MAX_EVENTS};
pub use crate::msg::{MsgEvent, MsgSource};
pub use crate::ring::RingBuffer;
pub use crate::signal::SignalSource;
pub use crate::source::{FdSource, SharedSource, Source};
pub use crate::timer::{Timer, TimerSource};
