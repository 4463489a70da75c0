//! `mqueue` is a safe interface to POSIX message queues on Linux.
//!
//! A POSIX message queue is a kernel object identified by a name such as `/jobs`. Any process with
//! the right permissions can open it and exchange discrete messages through it. Each message
//! carries a priority: higher priorities are always received first, and messages of equal priority
//! are received in the order they were sent.
//!
//! # Usage
//!
//! Queues are opened (and created) through [`OpenOptions`], which yields a [`MessageQueue`]
//! handle:
//!
//! ```no_run
//! use mqueue::OpenOptions;
//!
//! let queue = OpenOptions::read_write()
//!     .create()
//!     .capacity(16)
//!     .max_msg_len(1024)
//!     .open("/jobs")?;
//!
//! queue.send(b"low", 1, None)?;
//! queue.send(b"high", 9, None)?;
//!
//! assert_eq!(queue.receive(None)?.payload, b"high");
//! assert_eq!(queue.receive(None)?.payload, b"low");
//!
//! mqueue::unlink("/jobs")?;
//! # Ok::<(), mqueue::MqError>(())
//! ```
//!
//! # Persistence
//!
//! Queues are not tied to the lifetime of any handle or process: closing or dropping a
//! [`MessageQueue`] releases the descriptor but leaves the queue, and any message still in it, in
//! the kernel. A queue only goes away once it has been [unlinked] and every descriptor to it has
//! been closed. Handles created with [`OpenOptions::unlink_on_close`] take care of this for queues
//! they created themselves.
//!
//! # Blocking
//!
//! [`send`] and [`receive`] block the calling thread on a full or empty queue, unless the handle is
//! non-blocking or a timeout is given. From async code, use [`AsyncMessageQueue`] instead, which
//! runs these calls on tokio's blocking thread pool.
//!
//! # Notifications
//!
//! A process can ask to be told when a message arrives on an empty queue with
//! [`MessageQueue::notify`], either through a callback or a signal. See the [`notify`] module
//! documentation for the delivery semantics.
//!
//! [unlinked]: unlink
//! [`send`]: MessageQueue::send
//! [`receive`]: MessageQueue::receive

#[cfg(not(target_os = "linux"))]
compile_error!("mqueue relies on the Linux message queue interface");

mod error;
mod limits;
mod macros;
mod name;
pub mod notify;
mod options;
mod queue;
mod runtime;
pub mod stream;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod common;

pub use error::{Errno, MqError, Operation};
pub use limits::{SystemLimits, prio_max};
pub use name::{NAME_MAX, QueueName};
pub use notify::Notification;
pub use options::{Access, DEFAULT_MODE, OpenOptions};
pub use queue::{Message, MessageQueue, QueueAttributes, unlink};
pub use runtime::AsyncMessageQueue;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
