use super::{Error, Outcome};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Messages that can be sent to the [Actor](super::Actor).
pub enum Message {
    /// Run one install cycle.
    ///
    /// The responder is sent the result once the cycle has finished.
    Cycle {
        responder: oneshot::Sender<Result<Outcome, Error>>,
    },
}

/// Ingress mailbox for the [Actor](super::Actor).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    installing: Arc<AtomicBool>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>, installing: Arc<AtomicBool>) -> Self {
        Self { sender, installing }
    }

    /// Request a cycle and wait for its result.
    ///
    /// Cycles are queued: a cycle requested while another one runs starts once it finishes.
    pub async fn cycle(&mut self) -> Result<Outcome, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Cycle { responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }

    /// Whether a cycle is restarting the service or waiting to reconnect.
    ///
    /// While set, a failing subscription is expected and will be replaced.
    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::Acquire)
    }
}
