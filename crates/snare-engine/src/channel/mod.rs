//! Ordered, bidirectional message pipe between the controller and the
//! instrumentation running for an attached process.
//!
//! Messages sent from one endpoint are received by the other one in the
//! order they were sent. Delivery is at-most-once: once the link is closed,
//! nothing can be sent anymore. Each endpoint observes a single
//! [ChannelEvent::Closed] event, after which [Endpoint::recv] returns `None`.

mod codec;
mod message;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

pub use self::codec::{CodecError, MessageCodec};
pub use self::message::{Command, LogLevel, Message};
use crate::backend::ExitReason;

/// Error returned when sending over a closed channel.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("control channel closed")]
pub struct ChannelClosed;

/// Reason for which a channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The session was detached.
    Detached,

    /// The attached process exited.
    TargetExited(ExitReason),

    /// One endpoint was dropped.
    EndpointDropped,
}

/// Event received from a channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent<T> {
    /// Message sent by the other endpoint.
    Message(T),

    /// The channel was closed.
    Closed(CloseReason),
}

enum Frame<T> {
    Data(T),
    Closed(CloseReason),
}

/// State shared by both endpoints of a channel.
struct Link<A, B> {
    closed: AtomicBool,
    to_a: mpsc::UnboundedSender<Frame<A>>,
    to_b: mpsc::UnboundedSender<Frame<B>>,
}

impl<A, B> Link<A, B> {
    /// Closes the link, returning `false` if it was already closed.
    fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        tracing::debug!(?reason, "control channel closed");

        let _ = self.to_a.send(Frame::Closed(reason));
        let _ = self.to_b.send(Frame::Closed(reason));

        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Creates a new channel.
///
/// The first endpoint receives `A` and sends `B`, the second one does the
/// opposite.
pub fn channel<A, B>() -> (Endpoint<A, B>, Endpoint<B, A>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let (to_a, from_b) = mpsc::unbounded_channel();
    let (to_b, from_a) = mpsc::unbounded_channel();

    let link = Arc::new(Link {
        closed: AtomicBool::new(false),
        to_a: to_a.clone(),
        to_b: to_b.clone(),
    });

    let a = Endpoint {
        tx: Sender {
            tx: to_b,
            link: LinkRef(link.clone()),
        },
        rx: from_b,
        finished: false,
    };

    let b = Endpoint {
        tx: Sender {
            tx: to_a,
            link: LinkRef(link),
        },
        rx: from_a,
        finished: false,
    };

    (a, b)
}

/// Endpoint receiving `In` messages and sending `Out` messages.
pub struct Endpoint<In, Out> {
    tx: Sender<Out>,
    rx: mpsc::UnboundedReceiver<Frame<In>>,
    finished: bool,
}

impl<In, Out> Endpoint<In, Out> {
    /// Sends a message to the other endpoint.
    pub fn send(&self, message: Out) -> Result<(), ChannelClosed> {
        self.tx.send(message)
    }

    /// Returns a cloneable sending half of this endpoint.
    pub fn sender(&self) -> Sender<Out> {
        self.tx.clone()
    }

    /// Receives the next event.
    ///
    /// Returns `None` once the [ChannelEvent::Closed] event was received.
    pub async fn recv(&mut self) -> Option<ChannelEvent<In>> {
        if self.finished {
            return None;
        }

        let frame = self.rx.recv().await;
        self.on_frame(frame)
    }

    /// Receives the next event, if any is pending.
    pub fn try_recv(&mut self) -> Option<ChannelEvent<In>> {
        if self.finished {
            return None;
        }

        match self.rx.try_recv() {
            Ok(frame) => self.on_frame(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.on_frame(None),
        }
    }

    /// Closes the channel for both endpoints.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.link.0.close(reason)
    }

    /// Returns whether the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.tx.link.0.is_closed()
    }

    pub(crate) fn closer(&self) -> Closer {
        Closer(self.tx.link.clone())
    }

    fn on_frame(&mut self, frame: Option<Frame<In>>) -> Option<ChannelEvent<In>> {
        match frame {
            Some(Frame::Data(message)) => Some(ChannelEvent::Message(message)),
            Some(Frame::Closed(reason)) => {
                self.finished = true;
                Some(ChannelEvent::Closed(reason))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl<In, Out> std::fmt::Debug for Endpoint<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("closed", &self.is_closed())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<In, Out> Drop for Endpoint<In, Out> {
    fn drop(&mut self) {
        self.tx.link.0.close(CloseReason::EndpointDropped);
    }
}

/// Sending half of an [Endpoint].
pub struct Sender<T> {
    tx: mpsc::UnboundedSender<Frame<T>>,
    link: LinkRef,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            link: self.link.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T> Sender<T> {
    /// Sends a message to the other endpoint.
    pub fn send(&self, message: T) -> Result<(), ChannelClosed> {
        if self.link.0.is_closed() {
            return Err(ChannelClosed);
        }

        self.tx.send(Frame::Data(message)).map_err(|_| ChannelClosed)
    }

    /// Returns whether the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.link.0.is_closed()
    }
}

/// Type-erased reference to a [Link].
#[derive(Clone)]
struct LinkRef(Arc<dyn CloseLink>);

trait CloseLink: Send + Sync {
    fn close(&self, reason: CloseReason) -> bool;
    fn is_closed(&self) -> bool;
}

impl<A: Send, B: Send> CloseLink for Link<A, B> {
    fn close(&self, reason: CloseReason) -> bool {
        Link::close(self, reason)
    }

    fn is_closed(&self) -> bool {
        Link::is_closed(self)
    }
}

/// Handle closing a channel from outside of its endpoints (e.g., when the
/// attached process exits).
#[derive(Clone)]
pub(crate) struct Closer(LinkRef);

impl Closer {
    pub fn close(&self, reason: CloseReason) -> bool {
        self.0.0.close(reason)
    }
}
