use crate::error::MqError;
use crate::limits::SystemLimits;
use crate::queue::MessageQueue;

/// Default permission bits for newly created queues: read-write for the owner only.
pub const DEFAULT_MODE: u32 = 0o600;

const KNOWN_FLAGS: libc::c_int =
    libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_NONBLOCK | libc::O_CLOEXEC;

/// Which directions a descriptor is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn can_send(self) -> bool {
        self != Self::ReadOnly
    }

    pub fn can_receive(self) -> bool {
        self != Self::WriteOnly
    }

    fn flags(self) -> libc::c_int {
        match self {
            Self::ReadOnly => libc::O_RDONLY,
            Self::WriteOnly => libc::O_WRONLY,
            Self::ReadWrite => libc::O_RDWR,
        }
    }
}

/// Flags and parameters controlling how a [`MessageQueue`] is opened or created.
///
/// Mode and attributes (`capacity`, `max_msg_len`) only matter when the call actually creates the
/// queue, they are ignored by the kernel when attaching to an existing one.
///
/// ```no_run
/// use mqueue::OpenOptions;
///
/// let queue = OpenOptions::read_write()
///     .create_new()
///     .capacity(8)
///     .max_msg_len(256)
///     .open("/jobs")?;
/// # Ok::<(), mqueue::MqError>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub(crate) access: Access,
    pub(crate) create: bool,
    pub(crate) exclusive: bool,
    pub(crate) nonblocking: bool,
    pub(crate) cloexec: bool,
    pub(crate) mode: u32,
    pub(crate) capacity: usize,
    pub(crate) max_msg_len: usize,
    pub(crate) unlink_on_close: bool,
}

impl OpenOptions {
    fn new(access: Access) -> Self {
        Self {
            access,
            create: false,
            exclusive: false,
            nonblocking: false,
            cloexec: true,
            mode: DEFAULT_MODE,
            capacity: 0,
            max_msg_len: 0,
            unlink_on_close: false,
        }
    }

    pub fn read_only() -> Self {
        Self::new(Access::ReadOnly)
    }

    pub fn write_only() -> Self {
        Self::new(Access::WriteOnly)
    }

    pub fn read_write() -> Self {
        Self::new(Access::ReadWrite)
    }

    /// Parses raw `O_*` open flags, as accepted by `mq_open(3)`.
    pub fn from_flags(flags: libc::c_int) -> Result<Self, MqError> {
        if flags & !KNOWN_FLAGS != 0 {
            return Err(MqError::Unsupported { what: "unknown open flags" });
        }

        let access = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => Access::ReadOnly,
            libc::O_WRONLY => Access::WriteOnly,
            libc::O_RDWR => Access::ReadWrite,
            _ => return Err(MqError::Unsupported { what: "invalid access mode" }),
        };

        let mut options = Self::new(access);
        options.create = flags & libc::O_CREAT != 0;
        options.exclusive = flags & libc::O_EXCL != 0;
        options.nonblocking = flags & libc::O_NONBLOCK != 0;
        options.cloexec = flags & libc::O_CLOEXEC != 0;
        Ok(options)
    }

    /// Raw `O_*` flags equivalent to these options.
    pub fn flags(&self) -> libc::c_int {
        let mut flags = self.access.flags();
        if self.create {
            flags |= libc::O_CREAT;
        }
        if self.exclusive {
            flags |= libc::O_EXCL;
        }
        if self.nonblocking {
            flags |= libc::O_NONBLOCK;
        }
        if self.cloexec {
            flags |= libc::O_CLOEXEC;
        }
        flags
    }

    /// Create the queue if it does not exist yet.
    pub fn create(&mut self) -> &mut Self {
        self.create = true;
        self.exclusive = false;
        self
    }

    /// Create the queue, failing with [`MqError::AlreadyExists`] if it already exists.
    pub fn create_new(&mut self) -> &mut Self {
        self.create = true;
        self.exclusive = true;
        self
    }

    /// Only open an existing queue, failing with [`MqError::NotFound`] otherwise.
    pub fn existing(&mut self) -> &mut Self {
        self.create = false;
        self.exclusive = false;
        self
    }

    pub fn nonblocking(&mut self, nonblocking: bool) -> &mut Self {
        self.nonblocking = nonblocking;
        self
    }

    /// Close the descriptor when `exec`ing into another program. On by default.
    pub fn cloexec(&mut self, cloexec: bool) -> &mut Self {
        self.cloexec = cloexec;
        self
    }

    /// Permission bits for a newly created queue. Defaults to [`DEFAULT_MODE`].
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Maximum number of pending messages for a newly created queue. `0` leaves it to the system.
    pub fn capacity(&mut self, capacity: usize) -> &mut Self {
        self.capacity = capacity;
        self
    }

    /// Maximum size of a single message for a newly created queue. `0` leaves it to the system.
    pub fn max_msg_len(&mut self, max_msg_len: usize) -> &mut Self {
        self.max_msg_len = max_msg_len;
        self
    }

    /// Remove the queue's name when the handle is closed, but only if this handle created it.
    pub fn unlink_on_close(&mut self, unlink: bool) -> &mut Self {
        self.unlink_on_close = unlink;
        self
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn open(&self, name: &str) -> Result<MessageQueue, MqError> {
        MessageQueue::open(name, self)
    }

    /// Attributes to pass to `mq_open`, if any. When only one of capacity and message size was
    /// given, the other is taken from the system defaults since the kernel rejects zero values.
    pub(crate) fn creation_attributes(&self) -> Result<Option<libc::mq_attr>, MqError> {
        if !self.create || (self.capacity == 0 && self.max_msg_len == 0) {
            return Ok(None);
        }

        let (capacity, max_msg_len) = match (self.capacity, self.max_msg_len) {
            (0, len) => (SystemLimits::defaults()?.0, len),
            (cap, 0) => (cap, SystemLimits::defaults()?.1),
            pair => pair,
        };

        let too_large = || MqError::InvalidAttributes { reason: "attribute does not fit in mq_attr", errno: None };
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = num::cast(capacity).ok_or_else(too_large)?;
        attr.mq_msgsize = num::cast(max_msg_len).ok_or_else(too_large)?;
        Ok(Some(attr))
    }
}
