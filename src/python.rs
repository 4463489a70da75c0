//! The `mqueue` Python extension module.

use pyo3::buffer::PyBuffer;
use pyo3::exceptions::{
    PyBlockingIOError, PyFileExistsError, PyFileNotFoundError, PyInterruptedError, PyOSError, PyPermissionError,
    PyTimeoutError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::{PyByteArray, PyBytes, PyDict};

use crate::error::MqError;
use crate::notify::Notification;
use crate::options::{DEFAULT_MODE, OpenOptions};
use crate::queue::MessageQueue;

impl From<MqError> for PyErr {
    fn from(err: MqError) -> Self {
        let msg = err.to_string();
        match (&err, err.errno()) {
            (
                MqError::UseAfterClose { .. }
                | MqError::NameInvalid { .. }
                | MqError::InvalidAttributes { .. }
                | MqError::MessageTooLong { .. }
                | MqError::InvalidPriority { .. }
                | MqError::BufferTooSmall { .. }
                | MqError::Unsupported { .. },
                _,
            ) => PyValueError::new_err(msg),
            (_, Some(errno)) => match errno.0 {
                libc::ENOENT => PyFileNotFoundError::new_err((errno.0, msg)),
                libc::EEXIST => PyFileExistsError::new_err((errno.0, msg)),
                libc::EACCES | libc::EPERM => PyPermissionError::new_err((errno.0, msg)),
                libc::ETIMEDOUT => PyTimeoutError::new_err((errno.0, msg)),
                libc::EAGAIN => PyBlockingIOError::new_err((errno.0, msg)),
                libc::EINTR => PyInterruptedError::new_err((errno.0, msg)),
                code => PyOSError::new_err((code, msg)),
            },
            (_, None) => PyOSError::new_err(msg),
        }
    }
}

fn timeout(seconds: Option<f64>) -> PyResult<Option<std::time::Duration>> {
    seconds
        .map(|seconds| {
            std::time::Duration::try_from_secs_f64(seconds)
                .map_err(|_| PyValueError::new_err("timeout must be a non-negative number"))
        })
        .transpose()
}

#[pyclass(name = "MessageQueue", module = "mqueue")]
struct PyMessageQueue {
    inner: MessageQueue,
}

#[pymethods]
impl PyMessageQueue {
    #[new]
    #[pyo3(signature = (name, flags, mode = DEFAULT_MODE, maxmsg = -1, msgsize = -1))]
    fn new(py: Python<'_>, name: &str, flags: i32, mode: u32, maxmsg: isize, msgsize: isize) -> PyResult<Self> {
        let mut options = OpenOptions::from_flags(flags)?;
        // Negative means "system default", which the options spell as 0.
        options
            .mode(mode)
            .capacity(usize::try_from(maxmsg).unwrap_or_default())
            .max_msg_len(usize::try_from(msgsize).unwrap_or_default());

        let inner = py.allow_threads(|| MessageQueue::open(name, &options))?;
        Ok(Self { inner })
    }

    fn __repr__(&self) -> String {
        format!(
            "<mqueue.MessageQueue('{}', {}, mode={:#o}, maxmsg={}, msgsize={})>",
            self.inner.name(),
            self.inner.options().flags(),
            self.inner.mode(),
            self.inner.max_messages(),
            self.inner.max_message_size(),
        )
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    /// Closes the queue unless the block already did.
    #[pyo3(signature = (*_args))]
    fn __exit__(&mut self, py: Python<'_>, _args: &Bound<'_, pyo3::types::PyTuple>) -> PyResult<bool> {
        if !self.inner.is_closed() {
            self.close(py)?;
        }
        Ok(false)
    }

    /// Closes the descriptor. Closing it a second time raises `ValueError`.
    fn close(&mut self, py: Python<'_>) -> PyResult<()> {
        let inner = &mut self.inner;
        py.allow_threads(|| inner.close())?;
        Ok(())
    }

    fn fileno(&self) -> PyResult<i32> {
        Ok(self.inner.fileno()?)
    }

    /// Sends one message and returns the number of bytes sent.
    #[pyo3(signature = (msg, priority = 0, timeout = None))]
    fn send(&self, py: Python<'_>, msg: PyBuffer<u8>, priority: u32, timeout: Option<f64>) -> PyResult<usize> {
        let payload = msg.to_vec(py)?;
        let timeout = self::timeout(timeout)?;
        let queue = &self.inner;

        py.allow_threads(|| queue.send(&payload, priority, timeout))?;
        Ok(payload.len())
    }

    #[pyo3(signature = (timeout = None))]
    fn recv<'py>(&self, py: Python<'py>, timeout: Option<f64>) -> PyResult<Bound<'py, PyBytes>> {
        let (payload, _) = self.receive(py, timeout)?;
        Ok(payload)
    }

    /// Receives one message, returning its payload and priority.
    #[pyo3(signature = (timeout = None))]
    fn receive<'py>(&self, py: Python<'py>, timeout: Option<f64>) -> PyResult<(Bound<'py, PyBytes>, u32)> {
        let timeout = self::timeout(timeout)?;
        let queue = &self.inner;

        let message = py.allow_threads(|| queue.receive(timeout))?;
        Ok((PyBytes::new(py, &message.payload), message.priority))
    }

    /// Calls `callback` (without arguments) the next time a message arrives on the empty queue.
    /// `None` cancels the current registration.
    #[pyo3(signature = (callback = None))]
    fn notify(&self, py: Python<'_>, callback: Option<PyObject>) -> PyResult<()> {
        let notification = match callback {
            Some(callback) => {
                if !callback.bind(py).is_callable() {
                    return Err(pyo3::exceptions::PyTypeError::new_err("callback must be callable"));
                }

                Some(Notification::callback(move || {
                    Python::with_gil(|py| {
                        if let Err(e) = callback.call0(py) {
                            e.print(py);
                        }
                    })
                }))
            }
            None => None,
        };

        Ok(self.inner.notify(notification)?)
    }

    /// The queue attributes as a dict with the `mq_attr` field names.
    fn getattr<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let attributes = self.inner.attributes()?;
        let flags = if attributes.nonblocking { libc::O_NONBLOCK } else { 0 };

        let dict = PyDict::new(py);
        dict.set_item("mq_flags", flags)?;
        dict.set_item("mq_maxmsg", attributes.max_messages)?;
        dict.set_item("mq_msgsize", attributes.max_message_size)?;
        dict.set_item("mq_curmsgs", attributes.current_messages)?;
        Ok(dict)
    }

    fn setnonblocking(&self, flag: bool) -> PyResult<()> {
        Ok(self.inner.set_nonblocking(flag)?)
    }

    /// Sends the content of `buf` as consecutive messages, removing what was sent from `buf`.
    fn _fill(&self, py: Python<'_>, buf: &Bound<'_, PyByteArray>) -> PyResult<()> {
        let mut data = buf.to_vec();
        let queue = &self.inner;

        let res = py.allow_threads(|| crate::stream::fill(queue, &mut data, 0));
        // Whatever was not sent goes back, even on failure.
        resize(buf, &data)?;
        Ok(res?)
    }

    /// Receives the pending messages into `buf`, returns `True` at end of stream.
    fn _drain(&self, py: Python<'_>, buf: &Bound<'_, PyByteArray>) -> PyResult<bool> {
        let mut data = Vec::new();
        let queue = &self.inner;

        let res = py.allow_threads(|| crate::stream::drain(queue, &mut data));
        if !data.is_empty() {
            let mut merged = buf.to_vec();
            merged.extend_from_slice(&data);
            resize(buf, &merged)?;
        }
        Ok(res?)
    }

    #[getter]
    fn name(&self) -> &str {
        self.inner.name().as_str()
    }

    #[getter]
    fn flags(&self) -> i32 {
        self.inner.options().flags()
    }

    #[getter]
    fn mode(&self) -> u32 {
        self.inner.mode()
    }

    #[getter]
    fn maxmsg(&self) -> usize {
        self.inner.max_messages()
    }

    #[getter]
    fn msgsize(&self) -> usize {
        self.inner.max_message_size()
    }

    #[getter]
    fn closed(&self) -> bool {
        self.inner.is_closed()
    }
}

fn resize(buf: &Bound<'_, PyByteArray>, data: &[u8]) -> PyResult<()> {
    buf.resize(data.len())?;
    // SAFETY: no Python code runs while the slice is alive, so the bytearray cannot be resized
    // under us.
    unsafe { buf.as_bytes_mut() }.copy_from_slice(data);
    Ok(())
}

#[pyfunction]
fn unlink(py: Python<'_>, name: &str) -> PyResult<()> {
    Ok(py.allow_threads(|| crate::queue::unlink(name))?)
}

#[pymodule]
fn mqueue(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", crate::VERSION)?;
    m.add_class::<PyMessageQueue>()?;
    m.add_function(wrap_pyfunction!(unlink, m)?)?;

    for (name, value) in [
        ("O_RDONLY", libc::O_RDONLY),
        ("O_WRONLY", libc::O_WRONLY),
        ("O_RDWR", libc::O_RDWR),
        ("O_CREAT", libc::O_CREAT),
        ("O_EXCL", libc::O_EXCL),
        ("O_NONBLOCK", libc::O_NONBLOCK),
        ("O_CLOEXEC", libc::O_CLOEXEC),
    ] {
        m.add(name, value)?;
    }

    Ok(())
}
