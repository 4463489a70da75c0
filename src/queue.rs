use crate::error::{Errno, MqError, Operation};
use crate::macros::*;
use crate::name::QueueName;
use crate::notify::{self, Notification};
use crate::options::{Access, OpenOptions};

const S_IMODE: u32 = 0o7777;

/// A message as delivered by the kernel: higher priorities are received first, and messages of
/// equal priority are received in the order they were sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub priority: u32,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, priority: u32) -> Self {
        Self { payload: payload.into(), priority }
    }
}

/// A snapshot of a queue's attributes. `current_messages` reflects the kernel state at the time
/// of the query and may be stale by the time it is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueAttributes {
    pub nonblocking: bool,
    pub max_messages: usize,
    pub max_message_size: usize,
    pub current_messages: usize,
}

impl QueueAttributes {
    fn from_raw(attr: &libc::mq_attr) -> Self {
        Self {
            nonblocking: attr.mq_flags & libc::O_NONBLOCK as libc::c_long != 0,
            max_messages: num::cast(attr.mq_maxmsg).unwrap_or_default(),
            max_message_size: num::cast(attr.mq_msgsize).unwrap_or_default(),
            current_messages: num::cast(attr.mq_curmsgs).unwrap_or_default(),
        }
    }
}

/// An open POSIX message queue descriptor.
///
/// A handle is either open, or closed after a call to [`close`]. Every operation on a closed handle
/// fails with [`MqError::UseAfterClose`]. Dropping an open handle closes it.
///
/// Closing a handle never removes the queue itself: queues and their pending messages live in the
/// kernel until [`unlink`] is called (or the system reboots), independently of the processes which
/// created or opened them.
///
/// # Concurrency
///
/// `send`, `receive` and the attribute operations take `&self` and can be called from several
/// threads at once, the kernel serializes access to the queue. Only `send` and `receive` may block,
/// and they only ever block the calling thread. Registering notifications concurrently with another
/// `notify` or `close` on the same handle is not synchronized: the last call wins.
///
/// [`close`]: Self::close
pub struct MessageQueue {
    mqd: Option<libc::mqd_t>,
    name: QueueName,
    options: OpenOptions,
    mode: u32,
    max_messages: usize,
    max_message_size: usize,
    prio_max: u32,
    created: bool,
    registration: std::sync::atomic::AtomicU64,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("mqd", &self.mqd)
            .field("flags", &self.options.flags())
            .field("mode", &format_args!("{:o}", self.mode))
            .field("max_messages", &self.max_messages)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if self.mqd.is_some() {
            debug!(name = %self.name, "Closing message queue on drop");
            if let Err(e) = self.close() {
                tracing::error!(name = %self.name, error = %e, "Failed to release message queue descriptor");
            }
        }
    }
}

impl MessageQueue {
    /// Opens (and possibly creates) the queue called `name`.
    ///
    /// When `options` asks to create the queue without requiring it to be new, the queue is first
    /// created exclusively so that [`created`] reports whether this call is the one that created
    /// it.
    ///
    /// [`created`]: Self::created
    #[cfg_attr(test, tracing::instrument(skip(options), err(Debug)))]
    pub fn open(name: &str, options: &OpenOptions) -> Result<Self, MqError> {
        let name = QueueName::new(name)?;
        let attr = options.creation_attributes()?;
        let flags = options.flags();

        let open = |flags| raw_open(&name, flags, options.mode, attr.as_ref());
        let (mqd, created) = if options.create && !options.exclusive {
            match open(flags | libc::O_EXCL) {
                Ok(mqd) => (mqd, true),
                Err(Errno(libc::EEXIST)) => {
                    debug!("Queue already exists, attaching to it");
                    (open(flags).map_err(|errno| open_error(&name, attr.is_some(), errno))?, false)
                }
                Err(errno) => return Err(open_error(&name, attr.is_some(), errno)),
            }
        } else {
            (open(flags).map_err(|errno| open_error(&name, attr.is_some(), errno))?, options.create)
        };

        // From here on the descriptor is owned by `queue`, if anything fails it is closed on drop.
        let mut queue = Self {
            mqd: Some(mqd),
            name,
            options: *options,
            mode: 0,
            max_messages: 0,
            max_message_size: 0,
            prio_max: crate::limits::prio_max(),
            created,
            registration: std::sync::atomic::AtomicU64::new(0),
        };

        if let Err(e) = queue.load_metadata(mqd) {
            warn!(error = %e, "Failed to inspect freshly opened queue");
            // A queue nobody got a handle to should not outlive this call.
            queue.options.unlink_on_close = true;
            return Err(e);
        }

        debug!(?queue, created, "Opened message queue");
        Ok(queue)
    }

    fn load_metadata(&mut self, mqd: libc::mqd_t) -> Result<(), MqError> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(mqd, &mut stat) } == -1 {
            return Err(MqError::from_os(Operation::Open, Errno::last()));
        }
        self.mode = stat.st_mode & S_IMODE;

        let attributes = raw_getattr(mqd)?;
        self.max_messages = attributes.max_messages;
        self.max_message_size = attributes.max_message_size;
        Ok(())
    }

    /// Releases the descriptor. The queue itself stays in the system namespace unless this handle
    /// created it and was opened with [`OpenOptions::unlink_on_close`].
    ///
    /// Calling `close` a second time fails with [`MqError::UseAfterClose`].
    #[cfg_attr(test, tracing::instrument(skip(self), fields(name = %self.name)))]
    pub fn close(&mut self) -> Result<(), MqError> {
        let mqd = self.mqd.take().ok_or(MqError::UseAfterClose { op: Operation::Close })?;

        // The kernel drops our registration along with the descriptor, the callback has to go too.
        self.forget_registration();

        if unsafe { libc::mq_close(mqd) } == -1 {
            return Err(MqError::from_os(Operation::Close, Errno::last()));
        }

        if self.options.unlink_on_close && self.created {
            match unlink(self.name.as_str()) {
                Ok(()) | Err(MqError::NotFound { .. }) => (),
                Err(e) => return Err(e),
            }
        }

        debug!("Closed message queue");
        Ok(())
    }

    /// Adds a message to the queue.
    ///
    /// If the queue is full, a blocking handle waits for space until `timeout` elapses (forever if
    /// `None`) and fails with [`MqError::TimedOut`] afterwards, while a non-blocking handle fails
    /// with [`MqError::WouldBlock`] straight away. A signal interrupting the wait surfaces as
    /// [`MqError::Interrupted`]: nothing is retried on the caller's behalf.
    #[cfg_attr(test, tracing::instrument(skip(self, payload), fields(name = %self.name, len = payload.len())))]
    pub fn send(&self, payload: &[u8], priority: u32, timeout: Option<std::time::Duration>) -> Result<(), MqError> {
        let mqd = self.descriptor(Operation::Send)?;

        if !self.options.access.can_send() {
            return Err(MqError::PermissionDenied { op: Operation::Send, errno: Errno(libc::EBADF) });
        }
        if priority >= self.prio_max {
            return Err(MqError::InvalidPriority { priority, max: self.prio_max - 1, errno: None });
        }

        let deadline = timeout.map(|timeout| deadline(timeout, Operation::Send)).transpose()?;
        let buf = payload.as_ptr().cast::<libc::c_char>();
        let ret = match &deadline {
            Some(deadline) => unsafe { libc::mq_timedsend(mqd, buf, payload.len(), priority, deadline) },
            None => unsafe { libc::mq_send(mqd, buf, payload.len(), priority) },
        };

        if ret == -1 {
            let errno = Errno::last();
            return Err(match errno.0 {
                libc::EMSGSIZE => MqError::MessageTooLong { len: payload.len(), max: self.max_message_size, errno },
                libc::EINVAL => MqError::InvalidPriority { priority, max: self.prio_max - 1, errno: Some(errno) },
                libc::EBADF => MqError::PermissionDenied { op: Operation::Send, errno },
                _ => MqError::from_os(Operation::Send, errno),
            });
        }

        debug!(priority, "Sent message");
        Ok(())
    }

    /// Removes the oldest message of the highest priority from the queue.
    ///
    /// Blocking behaviour mirrors [`send`](Self::send): waits until a message is available (or
    /// `timeout` elapses) on a blocking handle, fails with [`MqError::WouldBlock`] on an empty
    /// queue otherwise.
    pub fn receive(&self, timeout: Option<std::time::Duration>) -> Result<Message, MqError> {
        let mut payload = vec![0; self.max_message_size];
        let (len, priority) = self.receive_into(&mut payload, timeout)?;
        payload.truncate(len);
        Ok(Message { payload, priority })
    }

    /// Like [`receive`](Self::receive), but writes the payload into `buf` and returns its length
    /// along with the message priority.
    ///
    /// `buf` must be able to hold the largest message the queue accepts, otherwise this fails with
    /// [`MqError::BufferTooSmall`] without touching the queue.
    #[cfg_attr(test, tracing::instrument(skip(self, buf), fields(name = %self.name, len = buf.len())))]
    pub fn receive_into(&self, buf: &mut [u8], timeout: Option<std::time::Duration>) -> Result<(usize, u32), MqError> {
        let mqd = self.descriptor(Operation::Receive)?;

        if !self.options.access.can_receive() {
            return Err(MqError::PermissionDenied { op: Operation::Receive, errno: Errno(libc::EBADF) });
        }
        if buf.len() < self.max_message_size {
            return Err(MqError::BufferTooSmall { len: buf.len(), required: self.max_message_size, errno: None });
        }

        let deadline = timeout.map(|timeout| deadline(timeout, Operation::Receive)).transpose()?;
        let mut priority: libc::c_uint = 0;
        let ptr = buf.as_mut_ptr().cast::<libc::c_char>();
        let received = match &deadline {
            Some(deadline) => unsafe { libc::mq_timedreceive(mqd, ptr, buf.len(), &mut priority, deadline) },
            None => unsafe { libc::mq_receive(mqd, ptr, buf.len(), &mut priority) },
        };

        if received < 0 {
            let errno = Errno::last();
            return Err(match errno.0 {
                libc::EMSGSIZE => {
                    MqError::BufferTooSmall { len: buf.len(), required: self.max_message_size, errno: Some(errno) }
                }
                libc::EBADF => MqError::PermissionDenied { op: Operation::Receive, errno },
                _ => MqError::from_os(Operation::Receive, errno),
            });
        }

        debug!(received, priority, "Received message");
        Ok((received as usize, priority))
    }

    /// Queries the kernel for the queue's current attributes.
    pub fn attributes(&self) -> Result<QueueAttributes, MqError> {
        raw_getattr(self.descriptor(Operation::GetAttributes)?)
    }

    /// Applies `attributes` to this descriptor and returns the previous ones.
    ///
    /// Only the blocking flag can change once a queue exists: asking for a different capacity or
    /// message size fails with [`MqError::Unsupported`]. `current_messages` is ignored.
    #[cfg_attr(test, tracing::instrument(skip(self), fields(name = %self.name)))]
    pub fn set_attributes(&self, attributes: &QueueAttributes) -> Result<QueueAttributes, MqError> {
        let mqd = self.descriptor(Operation::SetAttributes)?;

        if attributes.max_messages != self.max_messages {
            return Err(MqError::Unsupported { what: "changing the capacity of an existing queue" });
        }
        if attributes.max_message_size != self.max_message_size {
            return Err(MqError::Unsupported { what: "changing the message size of an existing queue" });
        }

        let mut new: libc::mq_attr = unsafe { std::mem::zeroed() };
        new.mq_flags = if attributes.nonblocking { libc::O_NONBLOCK as libc::c_long } else { 0 };
        let mut old: libc::mq_attr = unsafe { std::mem::zeroed() };

        if unsafe { libc::mq_setattr(mqd, &new, &mut old) } == -1 {
            return Err(MqError::from_os(Operation::SetAttributes, Errno::last()));
        }

        Ok(QueueAttributes::from_raw(&old))
    }

    pub fn is_nonblocking(&self) -> Result<bool, MqError> {
        Ok(self.attributes()?.nonblocking)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), MqError> {
        let attributes = QueueAttributes {
            nonblocking,
            max_messages: self.max_messages,
            max_message_size: self.max_message_size,
            current_messages: 0,
        };
        self.set_attributes(&attributes).map(|_| ())
    }

    /// Registers `notification` to fire the next time a message arrives on the empty queue, or
    /// cancels this handle's registration when given `None`.
    ///
    /// Registrations are single-shot: once a notification has fired, it has to be registered again
    /// to fire a second time. Only one registration can exist per queue across all processes,
    /// attempting a second one fails with [`MqError::AlreadyRegistered`].
    ///
    /// A callback may register a new notification from within itself.
    #[cfg_attr(test, tracing::instrument(skip(self), fields(name = %self.name)))]
    pub fn notify(&self, notification: Option<Notification>) -> Result<(), MqError> {
        let mqd = self.descriptor(Operation::Notify)?;

        let arm_error = |errno: Errno| match errno.0 {
            libc::EBUSY => MqError::AlreadyRegistered { errno },
            libc::EINVAL => MqError::Unsupported { what: "notification method" },
            _ => MqError::from_os(Operation::Notify, errno),
        };

        match notification {
            Some(Notification::Callback(callback)) => {
                let id = notify::park(callback);
                // Recorded before arming: the callback may fire, and re-register, before
                // `mq_notify` even returns.
                let previous = self.registration.swap(id, std::sync::atomic::Ordering::AcqRel);

                if let Err(errno) = notify::arm_callback(mqd, id) {
                    // Whatever was registered before is still live.
                    let _ = self.registration.compare_exchange(
                        id,
                        previous,
                        std::sync::atomic::Ordering::AcqRel,
                        std::sync::atomic::Ordering::Acquire,
                    );
                    notify::forget(id);
                    return Err(arm_error(errno));
                }

                // The kernel held no registration, so the previous one has fired or was cancelled.
                if previous != 0 {
                    notify::forget(previous);
                }
            }
            Some(Notification::Signal { signo, value }) => {
                notify::arm_signal(mqd, signo, value).map_err(arm_error)?;
                self.forget_registration();
            }
            None => {
                notify::unregister(mqd).map_err(|errno| MqError::from_os(Operation::Notify, errno))?;
                self.forget_registration();
                debug!("Cancelled notification");
            }
        }

        Ok(())
    }

    fn forget_registration(&self) {
        let id = self.registration.swap(0, std::sync::atomic::Ordering::AcqRel);
        if id != 0 {
            notify::forget(id);
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn access(&self) -> Access {
        self.options.access
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// Permission bits of the queue, as reported by the kernel when it was opened.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Whether opening this handle created the queue.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn is_closed(&self) -> bool {
        self.mqd.is_none()
    }

    /// The underlying descriptor. On Linux this is a file descriptor which can be polled for
    /// readability (a message is pending) and writability (there is room for one).
    pub fn fileno(&self) -> Result<std::os::fd::RawFd, MqError> {
        self.mqd.ok_or(MqError::UseAfterClose { op: Operation::Fileno })
    }

    fn descriptor(&self, op: Operation) -> Result<libc::mqd_t, MqError> {
        self.mqd.ok_or(MqError::UseAfterClose { op })
    }
}

/// Removes `name` from the system namespace.
///
/// Handles which already have the queue open keep working until they are closed, at which point
/// the queue is destroyed. Opening the name again afterwards fails with [`MqError::NotFound`]
/// (unless it gets created anew).
#[cfg_attr(test, tracing::instrument(err(Debug)))]
pub fn unlink(name: &str) -> Result<(), MqError> {
    let name = QueueName::new(name)?;
    if unsafe { libc::mq_unlink(name.as_c_str().as_ptr()) } == -1 {
        let errno = Errno::last();
        return Err(match errno.0 {
            libc::ENOENT => MqError::NotFound { name: name.to_string(), errno },
            libc::EINVAL | libc::ENAMETOOLONG => {
                MqError::NameInvalid { name: name.to_string(), reason: "rejected by the kernel", errno: Some(errno) }
            }
            _ => MqError::from_os(Operation::Unlink, errno),
        });
    }

    debug!("Unlinked message queue");
    Ok(())
}

fn raw_open(name: &QueueName, flags: libc::c_int, mode: u32, attr: Option<&libc::mq_attr>) -> Result<libc::mqd_t, Errno> {
    let attr = attr.map_or(std::ptr::null(), |attr| attr as *const libc::mq_attr);
    let mqd = unsafe { libc::mq_open(name.as_c_str().as_ptr(), flags, mode as libc::mode_t, attr) };
    if mqd == -1 {
        return Err(Errno::last());
    }
    Ok(mqd)
}

fn raw_getattr(mqd: libc::mqd_t) -> Result<QueueAttributes, MqError> {
    let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
    if unsafe { libc::mq_getattr(mqd, &mut attr) } == -1 {
        return Err(MqError::from_os(Operation::GetAttributes, Errno::last()));
    }
    Ok(QueueAttributes::from_raw(&attr))
}

fn open_error(name: &QueueName, with_attributes: bool, errno: Errno) -> MqError {
    match errno.0 {
        libc::EEXIST => MqError::AlreadyExists { name: name.to_string(), errno },
        libc::ENOENT => MqError::NotFound { name: name.to_string(), errno },
        libc::EINVAL if with_attributes => {
            MqError::InvalidAttributes { reason: "rejected by the kernel", errno: Some(errno) }
        }
        libc::EINVAL | libc::ENAMETOOLONG => {
            MqError::NameInvalid { name: name.to_string(), reason: "rejected by the kernel", errno: Some(errno) }
        }
        _ => MqError::from_os(Operation::Open, errno),
    }
}

/// Converts a relative timeout into the absolute `CLOCK_REALTIME` deadline the timed calls expect.
fn deadline(timeout: std::time::Duration, op: Operation) -> Result<libc::timespec, MqError> {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } == -1 {
        return Err(MqError::from_os(op, Errno::last()));
    }

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = timeout.as_secs().saturating_add(nanos / 1_000_000_000);

    let mut deadline = now;
    deadline.tv_sec = now.tv_sec.saturating_add(num::cast(secs).unwrap_or(libc::time_t::MAX));
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    Ok(deadline)
}
