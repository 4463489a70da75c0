//! Error taxonomy for message queue operations.
//!
//! Every failure reported by the kernel keeps its originating [`Errno`], so callers can always
//! recover the exact OS error even when it has been classified into a more specific variant.

/// A raw OS error code, as read from `errno` right after a failed call.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// Reads the calling thread's current `errno`. Must be called before anything else has a
    /// chance to clobber it (including logging).
    pub(crate) fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (os error {})", std::io::Error::from_raw_os_error(self.0).kind(), self.0)
    }
}

/// The queue operation which produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Open,
    Close,
    Send,
    Receive,
    Notify,
    GetAttributes,
    SetAttributes,
    Unlink,
    /// Reading the raw descriptor, which involves no system call.
    Fileno,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Open => "mq_open",
            Self::Close => "mq_close",
            Self::Send => "mq_send",
            Self::Receive => "mq_receive",
            Self::Notify => "mq_notify",
            Self::GetAttributes => "mq_getattr",
            Self::SetAttributes => "mq_setattr",
            Self::Unlink => "mq_unlink",
            Self::Fileno => "fileno",
        };
        f.write_str(op)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MqError {
    #[error("Invalid queue name {name:?}: {reason}")]
    NameInvalid { name: String, reason: &'static str, errno: Option<Errno> },
    #[error("Queue {name} already exists")]
    AlreadyExists { name: String, errno: Errno },
    #[error("Queue {name} does not exist")]
    NotFound { name: String, errno: Errno },
    #[error("{op}: permission denied")]
    PermissionDenied { op: Operation, errno: Errno },
    #[error("{op}: system limit exceeded, {errno}")]
    LimitExceeded { op: Operation, errno: Errno },
    #[error("{op}: out of memory")]
    OutOfMemory { op: Operation, errno: Errno },
    #[error("Invalid queue attributes: {reason}")]
    InvalidAttributes { reason: &'static str, errno: Option<Errno> },
    #[error("Message of {len} bytes exceeds the maximum message size of {max} bytes")]
    MessageTooLong { len: usize, max: usize, errno: Errno },
    #[error("Priority {priority} is above the system maximum of {max}")]
    InvalidPriority { priority: u32, max: u32, errno: Option<Errno> },
    #[error("{op}: timed out")]
    TimedOut { op: Operation, errno: Errno },
    #[error("{op}: operation would block")]
    WouldBlock { op: Operation, errno: Errno },
    #[error("{op}: interrupted by a signal")]
    Interrupted { op: Operation, errno: Errno },
    #[error("Receive buffer of {len} bytes is smaller than the maximum message size of {required} bytes")]
    BufferTooSmall { len: usize, required: usize, errno: Option<Errno> },
    #[error("A notification is already registered for this queue")]
    AlreadyRegistered { errno: Errno },
    #[error("Unsupported: {what}")]
    Unsupported { what: &'static str },
    #[error("{op}: message queue is closed")]
    UseAfterClose { op: Operation },
    #[error("{op}: blocking task was cancelled")]
    Cancelled { op: Operation },
    #[error("Failed to read system limit from {path}: {reason}")]
    SystemConfig {
        path: &'static str,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("{op}: {errno}")]
    Os { op: Operation, errno: Errno },
}

impl MqError {
    /// Classifies the errors which mean the same thing whichever call produced them. Callers
    /// match their operation-specific codes (`ENOENT` on open, `EMSGSIZE` on send...) first and
    /// fall back to this.
    pub(crate) fn from_os(op: Operation, errno: Errno) -> Self {
        match errno.0 {
            libc::EACCES | libc::EPERM => Self::PermissionDenied { op, errno },
            libc::EMFILE | libc::ENFILE | libc::ENOSPC => Self::LimitExceeded { op, errno },
            libc::ENOMEM => Self::OutOfMemory { op, errno },
            libc::EAGAIN => Self::WouldBlock { op, errno },
            libc::ETIMEDOUT => Self::TimedOut { op, errno },
            libc::EINTR => Self::Interrupted { op, errno },
            libc::EBUSY => Self::AlreadyRegistered { errno },
            _ => Self::Os { op, errno },
        }
    }

    /// The OS error code behind this error, if it came from the kernel.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::NameInvalid { errno, .. }
            | Self::InvalidAttributes { errno, .. }
            | Self::InvalidPriority { errno, .. }
            | Self::BufferTooSmall { errno, .. } => *errno,
            Self::AlreadyExists { errno, .. }
            | Self::NotFound { errno, .. }
            | Self::PermissionDenied { errno, .. }
            | Self::LimitExceeded { errno, .. }
            | Self::OutOfMemory { errno, .. }
            | Self::MessageTooLong { errno, .. }
            | Self::TimedOut { errno, .. }
            | Self::WouldBlock { errno, .. }
            | Self::Interrupted { errno, .. }
            | Self::AlreadyRegistered { errno }
            | Self::Os { errno, .. } => Some(*errno),
            Self::SystemConfig { source, .. } => source.as_ref().and_then(|e| e.raw_os_error()).map(Errno),
            Self::Unsupported { .. } | Self::UseAfterClose { .. } | Self::Cancelled { .. } => None,
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

impl From<MqError> for std::io::Error {
    fn from(err: MqError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            MqError::NameInvalid { .. }
            | MqError::InvalidAttributes { .. }
            | MqError::InvalidPriority { .. }
            | MqError::BufferTooSmall { .. } => ErrorKind::InvalidInput,
            MqError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            MqError::NotFound { .. } => ErrorKind::NotFound,
            MqError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            MqError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            MqError::MessageTooLong { .. } => ErrorKind::InvalidData,
            MqError::TimedOut { .. } => ErrorKind::TimedOut,
            MqError::WouldBlock { .. } => ErrorKind::WouldBlock,
            MqError::Interrupted { .. } => ErrorKind::Interrupted,
            MqError::AlreadyRegistered { .. } => ErrorKind::ResourceBusy,
            MqError::Unsupported { .. } => ErrorKind::Unsupported,
            MqError::UseAfterClose { .. } | MqError::Cancelled { .. } => ErrorKind::BrokenPipe,
            MqError::LimitExceeded { .. } | MqError::SystemConfig { .. } | MqError::Os { .. } => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
