use std::{
    fmt::Write as _,
    pin::Pin,
    sync::{Mutex, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cantaloupe_proto::Subject;
use futures_core::Stream;
use rand::RngCore;
use tokio::sync::mpsc;

const SUBSCRIPTION_CHANNEL_SIZE: usize = 256;
const BATCH_RECEIVE_SIZE: usize = 16;

/// A single frame moving over the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: Subject,
    /// Subject the receiver may answer on, for request/reply
    pub reply: Option<Subject>,
    pub payload: Bytes,
}

/// An error encountered while talking to the bus
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BusError {
    /// The bus connection has been closed
    #[error("bus closed")]
    Closed,
    /// A request got no reply within its timeout
    #[error("request timed out")]
    Timeout,
}

/// The subject-based message bus the broker runs on
///
/// The broker requires publish, subscribe-with-stream and
/// request/reply; everything else about the bus is opaque to it.
/// Control and data framing are carried entirely in payloads.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish a message
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// Subscribe to all messages matching `filter`
    ///
    /// `*` matches exactly one token, a trailing `>` matches one or
    /// more.
    async fn subscribe(&self, filter: Subject) -> Result<BusSubscription, BusError>;

    /// Publish on `subject` and wait for a reply on a fresh inbox
    async fn request(
        &self,
        subject: Subject,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, BusError>;

    /// Create a unique inbox subject
    fn new_inbox(&self) -> Subject;
}

/// Messages delivered to one bus subscription
///
/// Messages are yielded via the [`Stream`] implementation as they are
/// received. The subscription must be polled continuously; if it is
/// not, the internal buffer fills up and further messages are dropped
/// by the bus (redelivery timers make up for lost data frames).
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct BusSubscription {
    receiver: mpsc::Receiver<BusMessage>,
    receiver_queue: Vec<BusMessage>,
}

impl BusSubscription {
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            receiver,
            receiver_queue: Vec::with_capacity(BATCH_RECEIVE_SIZE),
        }
    }
}

impl Stream for BusSubscription {
    type Item = BusMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(msg) = this.receiver_queue.pop() {
            return Poll::Ready(Some(msg));
        }

        match Pin::new(&mut this.receiver).poll_recv_many(
            cx,
            &mut this.receiver_queue,
            BATCH_RECEIVE_SIZE,
        ) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(n @ 1..) => {
                debug_assert_eq!(n, this.receiver_queue.len());
                this.receiver_queue.reverse();
                Poll::Ready(this.receiver_queue.pop())
            }
            Poll::Ready(0) => Poll::Ready(None),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.receiver_queue.len(), None)
    }
}

/// An in-process [`Bus`]
///
/// Runs entirely on tokio channels, giving embedders and tests a bus
/// with the same subject semantics the broker expects from a real
/// deployment. Delivery to a subscriber whose buffer is full drops
/// the frame.
#[derive(Debug, Default)]
pub struct MemoryBus {
    entries: Mutex<Vec<BusEntry>>,
}

#[derive(Debug)]
struct BusEntry {
    filter: Subject,
    sender: mpsc::Sender<BusMessage>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| !entry.sender.is_closed());

        for entry in entries.iter() {
            if !subject_matches(&entry.filter, &message.subject) {
                continue;
            }

            if entry.sender.try_send(message.clone()).is_err() {
                tracing::warn!(
                    subject = %message.subject,
                    filter = %entry.filter,
                    "dropping frame for slow subscriber",
                );
            }
        }

        Ok(())
    }

    async fn subscribe(&self, filter: Subject) -> Result<BusSubscription, BusError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BusEntry { filter, sender });
        Ok(BusSubscription::new(receiver))
    }

    async fn request(
        &self,
        subject: Subject,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        let inbox = self.new_inbox();
        let mut replies = self.subscribe(inbox.clone()).await?;
        self.publish(BusMessage {
            subject,
            reply: Some(inbox),
            payload,
        })
        .await?;

        match tokio::time::timeout(timeout, replies.receiver.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    fn new_inbox(&self) -> Subject {
        create_inbox_subject("_INBOX")
    }
}

pub(crate) fn create_inbox_subject(prefix: &str) -> Subject {
    let mut suffix = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut suffix);

    let mut subject = String::with_capacity(prefix.len() + ".".len() + (suffix.len() * 2));
    write!(&mut subject, "{}.{:x}", prefix, u128::from_ne_bytes(suffix)).expect("infallible write");

    Subject::from_dangerous_value(subject.into())
}

fn subject_matches(filter: &Subject, subject: &Subject) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(filter_token), Some(subject_token)) if filter_token == subject_token => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use cantaloupe_proto::Subject;
    use claims::{assert_matches, assert_none, assert_ok, assert_some};
    use futures_util::StreamExt;

    use super::{subject_matches, Bus, BusError, BusMessage, MemoryBus};

    fn matches(filter: &'static str, subject: &'static str) -> bool {
        subject_matches(&Subject::from_static(filter), &Subject::from_static(subject))
    }

    #[test]
    fn subject_matching() {
        assert!(matches("foo", "foo"));
        assert!(matches("foo.bar", "foo.bar"));
        assert!(matches("foo.*", "foo.bar"));
        assert!(matches("foo.>", "foo.bar"));
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(matches("*.bar", "foo.bar"));

        assert!(!matches("foo", "bar"));
        assert!(!matches("foo.bar", "foo"));
        assert!(!matches("foo.*", "foo"));
        assert!(!matches("foo.*", "foo.bar.baz"));
        assert!(!matches("foo.>", "foo"));
        assert!(!matches("foo.bar", "foo.bar.baz"));
    }

    #[tokio::test]
    async fn publish_subscribe() {
        let bus = MemoryBus::new();

        let mut sub = assert_ok!(bus.subscribe(Subject::from_static("events.>")).await);
        assert_ok!(
            bus.publish(BusMessage {
                subject: Subject::from_static("events.a"),
                reply: None,
                payload: Bytes::from_static(b"1"),
            })
            .await
        );
        assert_ok!(
            bus.publish(BusMessage {
                subject: Subject::from_static("other"),
                reply: None,
                payload: Bytes::from_static(b"2"),
            })
            .await
        );
        assert_ok!(
            bus.publish(BusMessage {
                subject: Subject::from_static("events.b.c"),
                reply: None,
                payload: Bytes::from_static(b"3"),
            })
            .await
        );

        let first = assert_some!(sub.next().await);
        assert_eq!(Bytes::from_static(b"1"), first.payload);
        let second = assert_some!(sub.next().await);
        assert_eq!(Bytes::from_static(b"3"), second.payload);
    }

    #[tokio::test]
    async fn request_reply() {
        let bus = std::sync::Arc::new(MemoryBus::new());

        let mut service = assert_ok!(bus.subscribe(Subject::from_static("service")).await);
        let bus2 = std::sync::Arc::clone(&bus);
        tokio::spawn(async move {
            while let Some(msg) = service.next().await {
                let reply = msg.reply.expect("request carries a reply subject");
                bus2.publish(BusMessage {
                    subject: reply,
                    reply: None,
                    payload: Bytes::from_static(b"pong"),
                })
                .await
                .unwrap();
            }
        });

        let reply = assert_ok!(
            bus.request(
                Subject::from_static("service"),
                Bytes::from_static(b"ping"),
                Duration::from_secs(1),
            )
            .await
        );
        assert_eq!(Bytes::from_static(b"pong"), reply.payload);
    }

    #[tokio::test]
    async fn request_times_out() {
        let bus = MemoryBus::new();

        let err = bus
            .request(
                Subject::from_static("nobody.home"),
                Bytes::new(),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_matches!(err, BusError::Timeout);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = MemoryBus::new();

        let sub = assert_ok!(bus.subscribe(Subject::from_static("a")).await);
        drop(sub);

        assert_ok!(
            bus.publish(BusMessage {
                subject: Subject::from_static("a"),
                reply: None,
                payload: Bytes::new(),
            })
            .await
        );
        assert_none!(bus
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.filter.as_str() == "a"));
    }
}
