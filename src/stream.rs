//! Byte-stream helpers on top of a message queue.
//!
//! A stream is carried as a sequence of messages of at most [`max_message_size`] bytes each, and
//! terminated by a zero-length message. All messages of a stream share the same priority so that
//! the kernel delivers them in order.
//!
//! [`max_message_size`]: MessageQueue::max_message_size

use crate::error::MqError;
use crate::macros::*;
use crate::queue::MessageQueue;

/// Sends the whole of `buf` as consecutive messages, removing each chunk from the front of `buf`
/// once it has been queued. If this fails midway, `buf` holds exactly the bytes which were not
/// sent.
#[cfg_attr(test, tracing::instrument(skip(queue, buf), fields(len = buf.len())))]
pub fn fill(queue: &MessageQueue, buf: &mut Vec<u8>, priority: u32) -> Result<(), MqError> {
    let chunk = queue.max_message_size().max(1);
    let mut sent = 0;

    let res = loop {
        if sent == buf.len() {
            break Ok(());
        }

        let size = (buf.len() - sent).min(chunk);
        if let Err(e) = queue.send(&buf[sent..sent + size], priority, None) {
            break Err(e);
        }
        sent += size;
    };

    debug!(sent, remaining = buf.len() - sent, "Filled message queue");
    buf.drain(..sent);
    res
}

/// Receives the messages currently pending on the queue (at least one), appending their payloads
/// to `buf`.
///
/// Returns `true` if the end of the stream was reached, in which case the end-of-stream marker is
/// consumed and nothing after it is read. On a blocking handle with an empty queue, this waits for
/// one message.
#[cfg_attr(test, tracing::instrument(skip(queue, buf)))]
pub fn drain(queue: &MessageQueue, buf: &mut Vec<u8>) -> Result<bool, MqError> {
    let pending = queue.attributes()?.current_messages.max(1);
    let mut scratch = vec![0; queue.max_message_size()];

    for _ in 0..pending {
        let (len, _) = queue.receive_into(&mut scratch, None)?;
        if len == 0 {
            debug!("Reached end of stream");
            return Ok(true);
        }
        buf.extend_from_slice(&scratch[..len]);
    }

    Ok(false)
}

/// Marks the end of a stream.
pub fn send_eof(queue: &MessageQueue, priority: u32) -> Result<(), MqError> {
    queue.send(&[], priority, None)
}
