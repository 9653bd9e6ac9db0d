use futures::Stream;
use log::{trace, warn};
use tokio::sync::broadcast;

use super::Status;
use crate::models::MediaItemId;

/// Multicast stream of status transitions without replay.
///
/// Each subscriber owns a ring buffer of `capacity` transitions. A subscriber
/// that falls behind loses its oldest undelivered transitions; publishers and
/// other subscribers are never held up by it.
#[derive(Clone)]
pub struct StatusBroadcaster {
    sender: broadcast::Sender<Status>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to every current subscriber and returns how many there are.
    pub fn publish(&self, status: Status) -> usize {
        trace!("Publishing {:?} for {}", status.state, status.media_item_id);
        // No subscribers is normal.
        self.sender.send(status).unwrap_or(0)
    }

    pub fn subscribe(&self) -> StatusSubscriber {
        StatusSubscriber {
            receiver: self.sender.subscribe(),
            filter: None,
        }
    }

    /// Subscription that only yields transitions of one media item.
    pub fn subscribe_to(&self, id: MediaItemId) -> StatusSubscriber {
        StatusSubscriber {
            receiver: self.sender.subscribe(),
            filter: Some(id),
        }
    }
}

pub struct StatusSubscriber {
    receiver: broadcast::Receiver<Status>,
    filter: Option<MediaItemId>,
}

impl StatusSubscriber {
    fn matches(&self, status: &Status) -> bool {
        self.filter.as_ref().map_or(true, |id| *id == status.media_item_id)
    }

    /// Next transition, or `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Status> {
        loop {
            match self.receiver.recv().await {
                Ok(status) if self.matches(&status) => return Some(status),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Status subscriber fell behind, dropped {} oldest transitions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered transition, without waiting.
    pub fn try_recv(&mut self) -> Option<Status> {
        loop {
            match self.receiver.try_recv() {
                Ok(status) if self.matches(&status) => return Some(status),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Status subscriber fell behind, dropped {} oldest transitions", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Status> {
        futures::stream::unfold(self, |mut subscriber| async move {
            subscriber.recv().await.map(|status| (status, subscriber))
        })
    }
}
