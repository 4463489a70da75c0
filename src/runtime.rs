//! Async access to a message queue from a tokio runtime.
//!
//! Message queue calls block the calling thread, which would stall every other task scheduled on
//! the same runtime worker. [`AsyncMessageQueue`] moves each potentially blocking call onto tokio's
//! blocking thread pool instead, so that only the task awaiting it is suspended.

use crate::error::{MqError, Operation};
use crate::macros::*;
use crate::notify::Notification;
use crate::options::OpenOptions;
use crate::queue::{Message, MessageQueue, QueueAttributes};

/// A [`MessageQueue`] usable from async code.
///
/// ```no_run
/// # async fn run() -> Result<(), mqueue::MqError> {
/// use mqueue::{AsyncMessageQueue, OpenOptions};
///
/// let queue = AsyncMessageQueue::open("/events", *OpenOptions::read_write().create()).await?;
/// queue.send(b"ping".to_vec(), 0, None).await?;
/// let message = queue.receive(None).await?;
/// assert_eq!(message.payload, b"ping");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AsyncMessageQueue {
    inner: Option<std::sync::Arc<MessageQueue>>,
}

impl From<MessageQueue> for AsyncMessageQueue {
    fn from(queue: MessageQueue) -> Self {
        Self { inner: Some(std::sync::Arc::new(queue)) }
    }
}

impl AsyncMessageQueue {
    pub async fn open(name: &str, options: OpenOptions) -> Result<Self, MqError> {
        let name = name.to_string();
        let queue = blocking(Operation::Open, move || MessageQueue::open(&name, &options)).await?;
        Ok(Self::from(queue))
    }

    /// The underlying queue, for the operations which never block. `None` once closed.
    pub fn get_ref(&self) -> Option<&MessageQueue> {
        self.inner.as_deref()
    }

    fn shared(&self, op: Operation) -> Result<std::sync::Arc<MessageQueue>, MqError> {
        self.inner.as_ref().map(std::sync::Arc::clone).ok_or(MqError::UseAfterClose { op })
    }

    pub async fn send(
        &self,
        payload: Vec<u8>,
        priority: u32,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), MqError> {
        let queue = self.shared(Operation::Send)?;
        blocking(Operation::Send, move || queue.send(&payload, priority, timeout)).await
    }

    pub async fn receive(&self, timeout: Option<std::time::Duration>) -> Result<Message, MqError> {
        let queue = self.shared(Operation::Receive)?;
        blocking(Operation::Receive, move || queue.receive(timeout)).await
    }

    pub async fn attributes(&self) -> Result<QueueAttributes, MqError> {
        let queue = self.shared(Operation::GetAttributes)?;
        blocking(Operation::GetAttributes, move || queue.attributes()).await
    }

    /// Waits until a message arrives on the empty queue.
    ///
    /// This registers a single-shot notification, see [`MessageQueue::notify`]. It fails with
    /// [`MqError::AlreadyRegistered`] if a notification is already registered on the queue, and
    /// with [`MqError::UseAfterClose`] if the queue is closed before anything arrives.
    #[cfg_attr(test, tracing::instrument(skip(self)))]
    pub async fn notified(&self) -> Result<(), MqError> {
        let queue = self.shared(Operation::Notify)?;
        let (sx, rx) = tokio::sync::oneshot::channel();

        queue.notify(Some(Notification::callback(move || {
            let _ = sx.send(());
        })))?;

        debug!("Waiting for notification");
        rx.await.map_err(|_| MqError::UseAfterClose { op: Operation::Notify })
    }

    /// Turns the queue into a stream of received messages. Each item waits for at most `timeout`
    /// (forever if `None`). The stream ends after the first error.
    pub fn into_stream(
        self,
        timeout: Option<std::time::Duration>,
    ) -> impl futures::Stream<Item = Result<Message, MqError>> {
        futures::stream::unfold(Some(self), move |state| async move {
            let queue = state?;
            match queue.receive(timeout).await {
                Ok(message) => Some((Ok(message), Some(queue))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Closes the queue. If a blocking call abandoned by a cancelled future is still running, the
    /// descriptor is released when that call returns instead.
    #[cfg_attr(test, tracing::instrument(skip(self)))]
    pub async fn close(&mut self) -> Result<(), MqError> {
        let queue = self.inner.take().ok_or(MqError::UseAfterClose { op: Operation::Close })?;

        match std::sync::Arc::into_inner(queue) {
            Some(mut queue) => blocking(Operation::Close, move || queue.close()).await,
            None => {
                warn!("Queue still in use by a blocking call, deferring close");
                Ok(())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

async fn blocking<T, F>(op: Operation, f: F) -> Result<T, MqError>
where
    F: FnOnce() -> Result<T, MqError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(MqError::Cancelled { op }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn queue(name: &str) -> AsyncMessageQueue {
        AsyncMessageQueue::open(name, *OpenOptions::read_write().create_new().capacity(4).max_msg_len(64))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[rstest::rstest]
    async fn round_trip(#[allow(unused)] log_stdout: (), queue_name: TempName) {
        let queue = queue(&queue_name).await;

        tokio_test::assert_ok!(queue.send(b"async".to_vec(), 4, None).await);
        assert_eq!(queue.attributes().await.unwrap().current_messages, 1);
        assert_eq!(queue.receive(None).await.unwrap(), Message::new(*b"async", 4));
    }

    #[tokio::test(flavor = "current_thread")]
    #[rstest::rstest]
    async fn blocking_receive_does_not_stall_the_runtime(
        #[allow(unused)] log_stdout: (),
        queue_name: TempName,
    ) {
        let queue = std::sync::Arc::new(queue(&queue_name).await);
        let receiver = std::sync::Arc::clone(&queue);

        // On a single-threaded runtime, the send below could never run if the receive blocked
        // the worker.
        let handle = tokio::spawn(async move { receiver.receive(Some(Duration::from_secs(5))).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.send(b"wake".to_vec(), 0, None).await.unwrap();

        assert_eq!(handle.await.unwrap().unwrap().payload, b"wake");
    }

    #[tokio::test]
    #[rstest::rstest]
    async fn receive_timeout(#[allow(unused)] log_stdout: (), queue_name: TempName) {
        let queue = queue(&queue_name).await;
        assert_matches::assert_matches!(
            queue.receive(Some(Duration::from_millis(20))).await,
            Err(MqError::TimedOut { op: Operation::Receive, .. })
        );
    }

    #[tokio::test]
    #[rstest::rstest]
    async fn notified(#[allow(unused)] log_stdout: (), queue_name: TempName) {
        let queue = queue(&queue_name).await;

        let notified = queue.notified();
        futures::pin_mut!(notified);
        // The first poll registers
        assert!(futures::poll!(notified.as_mut()).is_pending());
        assert_matches::assert_matches!(
            queue.get_ref().unwrap().notify(Some(Notification::callback(|| ()))),
            Err(MqError::AlreadyRegistered { .. })
        );

        queue.send(b"hi".to_vec(), 0, None).await.unwrap();
        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(5), notified).await.unwrap());
    }

    #[tokio::test]
    #[rstest::rstest]
    async fn notified_twice(#[allow(unused)] log_stdout: (), queue_name: TempName) {
        let queue = queue(&queue_name).await;

        let first = queue.notified();
        futures::pin_mut!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert_matches::assert_matches!(queue.notified().await, Err(MqError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    #[rstest::rstest]
    async fn stream(#[allow(unused)] log_stdout: (), queue_name: TempName) {
        let queue = queue(&queue_name).await;
        for (i, priority) in [1, 3, 2].into_iter().enumerate() {
            queue.send(vec![i as u8], priority, None).await.unwrap();
        }

        let messages: Vec<_> = queue.into_stream(Some(Duration::from_millis(20))).collect().await;
        let priorities: Vec<_> = messages.iter().filter_map(|m| m.as_ref().ok()).map(|m| m.priority).collect();
        assert_eq!(priorities, [3, 2, 1]);
        assert_eq!(messages.len(), 4);
        assert_matches::assert_matches!(messages.last(), Some(Err(MqError::TimedOut { .. })));
    }

    #[tokio::test]
    #[rstest::rstest]
    async fn close(#[allow(unused)] log_stdout: (), queue_name: TempName) {
        let mut queue = queue(&queue_name).await;

        tokio_test::assert_ok!(queue.close().await);
        assert!(queue.is_closed());
        assert!(queue.get_ref().is_none());
        assert_matches::assert_matches!(queue.close().await, Err(MqError::UseAfterClose { op: Operation::Close }));
        assert_matches::assert_matches!(
            queue.send(b"late".to_vec(), 0, None).await,
            Err(MqError::UseAfterClose { op: Operation::Send })
        );
        assert_matches::assert_matches!(queue.receive(None).await, Err(MqError::UseAfterClose { .. }));
        assert_matches::assert_matches!(queue.notified().await, Err(MqError::UseAfterClose { .. }));
    }
}
