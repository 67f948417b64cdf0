//! Coordinate shutdown across tasks.

use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A one-time broadcast that can be awaited by many tasks.
///
/// Resolves with the value passed to [Signaler::signal]. If the [Signaler] is dropped
/// without signaling, the [Signal] resolves with [oneshot::Canceled].
///
/// _Polling the same `Signal` after it has resolved will panic. When waiting on a reference
/// to a `Signal` in a loop, stop polling it once it has yielded a result._
#[derive(Clone)]
pub struct Signal {
    inner: Shared<oneshot::Receiver<i32>>,
}

impl Future for Signal {
    type Output = Result<i32, oneshot::Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

/// Resolves every [Signal] created alongside it.
pub struct Signaler {
    tx: oneshot::Sender<i32>,
}

impl Signaler {
    /// Create a new [Signaler] and the [Signal] it resolves.
    pub fn new() -> (Self, Signal) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, Signal { inner: rx.shared() })
    }

    /// Resolve all [Signal]s associated with this [Signaler].
    pub fn signal(self, value: i32) {
        let _ = self.tx.send(value);
    }
}
