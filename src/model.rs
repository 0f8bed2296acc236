use derive_more::From;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Receiving end of a worker's inbound queue.
#[derive(Debug, From)]
pub struct EventSource<M>(UnboundedReceiver<M>);

impl<M> EventSource<M> {
    pub async fn next(&mut self) -> crate::Result<M> {
        self.0
            .recv()
            .await
            .ok_or(crate::err!("unexpected event source closing"))
    }
}

#[derive(Debug, From)]
pub struct EventSender<M>(UnboundedSender<M>);

impl<M> Clone for EventSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M> EventSender<M> {
    pub fn send(&self, event: impl Into<M>) -> crate::Result<()> {
        self.0
            .send(event.into())
            .map_err(|_| crate::err!("unexpected event channel closing"))
    }
}

/// Unbounded, so an event is never dropped and queue position is the
/// position at `send` time.
pub fn event_channel<M>() -> (EventSender<M>, EventSource<M>) {
    let (sender, receiver) = unbounded_channel();
    (EventSender(sender), EventSource(receiver))
}
