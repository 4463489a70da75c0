//! Message arrival notifications (`mq_notify(3)`).
//!
//! The kernel holds at most one registration per queue. It fires when a message arrives on an
//! *empty* queue while no thread is blocked receiving from it, and is consumed by firing: the
//! next notification needs a new registration.
//!
//! Callbacks are delivered with `SIGEV_THREAD`, meaning the C library runs them on a thread of
//! its own. The kernel only carries a pointer-sized value through to that thread, so rather than
//! handing it a pointer to the callback (which would dangle if the registration is cancelled while
//! a delivery is in flight), each registration gets an id and callbacks are parked in a
//! process-wide registry. Whoever removes an id from the registry first, the delivery thread or a
//! cancellation, owns the callback.

use crate::macros::*;

type Callback = Box<dyn FnOnce() + Send + 'static>;

static CALLBACKS: std::sync::LazyLock<std::sync::Mutex<std::collections::HashMap<u64, Callback>>> =
    std::sync::LazyLock::new(Default::default);

/// Registration ids start at 1, 0 means "no registration" in [`MessageQueue`].
///
/// [`MessageQueue`]: crate::MessageQueue
static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// How to be told that a message arrived on an empty queue.
pub enum Notification {
    /// Run a closure once, on a thread spawned by the C library.
    Callback(Callback),
    /// Deliver a signal to the process. `value` is passed along as `si_value`.
    Signal { signo: libc::c_int, value: usize },
}

impl Notification {
    pub fn callback<F: FnOnce() + Send + 'static>(f: F) -> Self {
        Self::Callback(Box::new(f))
    }

    pub fn signal(signo: libc::c_int) -> Self {
        Self::Signal { signo, value: 0 }
    }
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::Signal { signo, value } => f.debug_struct("Signal").field("signo", signo).field("value", value).finish(),
        }
    }
}

/// `struct sigevent` as laid out for `SIGEV_THREAD`. The `libc` definition only exposes the
/// thread id member of the trailing union, so this mirrors the C layout with the function and
/// attribute members instead.
#[repr(C)]
struct ThreadSigevent {
    sigev_value: libc::sigval,
    sigev_signo: libc::c_int,
    sigev_notify: libc::c_int,
    sigev_notify_function: Option<extern "C" fn(libc::sigval)>,
    sigev_notify_attributes: *mut libc::pthread_attr_t,
    _pad: [u8; SIGEV_THREAD_PAD],
}

const SIGEV_THREAD_PAD: usize = size_of::<libc::sigevent>()
    - size_of::<libc::sigval>()
    - 2 * size_of::<libc::c_int>()
    - 2 * size_of::<usize>();

const _: () = assert!(size_of::<ThreadSigevent>() == size_of::<libc::sigevent>());

/// Parks `callback` in the registry and returns the id it is delivered under. Nothing fires until
/// the id is armed with [`arm_callback`].
pub(crate) fn park(callback: Callback) -> u64 {
    let id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    registry().insert(id, callback);
    id
}

/// Asks the kernel to deliver the parked callback `id` on a thread of its own. On failure the
/// callback stays parked, callers [`forget`] it.
pub(crate) fn arm_callback(mqd: libc::mqd_t, id: u64) -> Result<(), crate::Errno> {
    let event = ThreadSigevent {
        sigev_value: libc::sigval { sival_ptr: id as usize as *mut libc::c_void },
        sigev_signo: 0,
        sigev_notify: libc::SIGEV_THREAD,
        sigev_notify_function: Some(deliver),
        sigev_notify_attributes: std::ptr::null_mut(),
        _pad: [0; SIGEV_THREAD_PAD],
    };

    let ret = unsafe { libc::mq_notify(mqd, (&raw const event).cast::<libc::sigevent>()) };
    if ret == -1 {
        return Err(crate::Errno::last());
    }

    debug!(id, "Registered notification callback");
    Ok(())
}

/// Asks the kernel to send `signo` to the process, with `value` as `si_value`.
pub(crate) fn arm_signal(mqd: libc::mqd_t, signo: libc::c_int, value: usize) -> Result<(), crate::Errno> {
    let mut event: libc::sigevent = unsafe { std::mem::zeroed() };
    event.sigev_notify = libc::SIGEV_SIGNAL;
    event.sigev_signo = signo;
    event.sigev_value = libc::sigval { sival_ptr: value as *mut libc::c_void };

    let ret = unsafe { libc::mq_notify(mqd, &event) };
    if ret == -1 {
        return Err(crate::Errno::last());
    }

    debug!(signo, "Registered notification signal");
    Ok(())
}

/// Removes the registration this process holds on `mqd`, if any.
pub(crate) fn unregister(mqd: libc::mqd_t) -> Result<(), crate::Errno> {
    let ret = unsafe { libc::mq_notify(mqd, std::ptr::null()) };
    if ret == -1 {
        return Err(crate::Errno::last());
    }
    Ok(())
}

/// Drops the callback for `id` unless it has already been delivered.
pub(crate) fn forget(id: u64) {
    if registry().remove(&id).is_some() {
        debug!(id, "Dropped undelivered notification callback");
    }
}

#[cfg(test)]
pub(crate) fn is_pending(id: u64) -> bool {
    registry().contains_key(&id)
}

fn registry() -> std::sync::MutexGuard<'static, std::collections::HashMap<u64, Callback>> {
    // Callbacks never run under the lock, so a poisoned registry still holds consistent data.
    CALLBACKS.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

extern "C" fn deliver(value: libc::sigval) {
    let id = value.sival_ptr as usize as u64;

    // The guard must be gone before the callback runs: it may register a new notification.
    let callback = registry().remove(&id);
    let Some(callback) = callback else {
        warn!(id, "Notification fired after its callback was dropped");
        return;
    };

    debug!(id, "Delivering notification");
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
        tracing::error!(id, "Message queue notification callback panicked");
    }
}
