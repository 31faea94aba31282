//! In-process change feeds. Row feeds are keyed by `(namespace, physical
//! table)`, schema feeds by project. Postgres notifications are forwarded
//! into the hub by [`PostgresFeedBridge`](crate::store::PostgresFeedBridge).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::model::{Id, RowChangeEvent, SchemaChangeEvent, SubscriptionState};

/// What a subscriber sees when it polls its feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage<T> {
    Event(T),
    /// The subscriber fell behind and missed this many events
    Lagged(u64),
    Closed,
}

pub struct FeedSubscription<T> {
    receiver: broadcast::Receiver<T>,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl<T: Clone> FeedSubscription<T> {
    pub async fn recv(&mut self) -> FeedMessage<T> {
        match self.receiver.recv().await {
            Ok(event) => FeedMessage::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => FeedMessage::Lagged(missed),
            Err(broadcast::error::RecvError::Closed) => {
                self.state.send_replace(SubscriptionState::Closed);
                FeedMessage::Closed
            }
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Watch handle on this subscription's lifecycle
    pub fn state_watch(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Wait until the feed confirmed the subscription. Returns false if it
    /// closed first.
    pub async fn wait_active(&self) -> bool {
        let mut watch = self.state.subscribe();
        loop {
            match *watch.borrow_and_update() {
                SubscriptionState::Active => return true,
                SubscriptionState::Closed => return false,
                _ => {}
            }
            if watch.changed().await.is_err() {
                return false;
            }
        }
    }
}

#[derive(Clone)]
pub struct ChangeFeedHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    capacity: usize,
    confirm_delay: Duration,
    rows: Mutex<HashMap<(String, String), broadcast::Sender<RowChangeEvent>>>,
    schema: Mutex<HashMap<Id, broadcast::Sender<SchemaChangeEvent>>>,
}

impl ChangeFeedHub {
    /// `confirm_delay` models the window in which a subscription is joined
    /// but not yet confirmed; zero confirms immediately.
    pub fn new(capacity: usize, confirm_delay: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                confirm_delay,
                rows: Mutex::new(HashMap::new()),
                schema: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe_rows(&self, namespace: &str, table: &str) -> FeedSubscription<RowChangeEvent> {
        let receiver = {
            let mut rows = self.inner.rows.lock();
            rows.retain(|_, sender| sender.receiver_count() > 0);
            rows.entry((namespace.to_string(), table.to_string()))
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        self.join(receiver)
    }

    pub fn subscribe_schema(&self, project_id: &Id) -> FeedSubscription<SchemaChangeEvent> {
        let receiver = {
            let mut schema = self.inner.schema.lock();
            schema.retain(|_, sender| sender.receiver_count() > 0);
            schema
                .entry(project_id.clone())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        self.join(receiver)
    }

    /// Returns the number of subscribers the event reached. A channel whose
    /// subscribers are all gone is dropped.
    pub fn publish_row(&self, event: RowChangeEvent) -> usize {
        let key = (event.namespace.clone(), event.table.clone());
        let mut rows = self.inner.rows.lock();
        let Some(sender) = rows.get(&key) else {
            return 0;
        };
        match sender.send(event) {
            Ok(reached) => reached,
            Err(_) => {
                rows.remove(&key);
                0
            }
        }
    }

    pub fn publish_schema(&self, event: SchemaChangeEvent) -> usize {
        let mut schema = self.inner.schema.lock();
        let Some(sender) = schema.get(&event.project_id) else {
            return 0;
        };
        let project_id = event.project_id.clone();
        match sender.send(event) {
            Ok(reached) => reached,
            Err(_) => {
                schema.remove(&project_id);
                0
            }
        }
    }

    /// Drop channels nobody listens on anymore. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut removed = 0;
        self.inner.rows.lock().retain(|_, sender| {
            let keep = sender.receiver_count() > 0;
            removed += usize::from(!keep);
            keep
        });
        self.inner.schema.lock().retain(|_, sender| {
            let keep = sender.receiver_count() > 0;
            removed += usize::from(!keep);
            keep
        });
        removed
    }

    /// Open row and schema channels
    pub fn channel_count(&self) -> usize {
        self.inner.rows.lock().len() + self.inner.schema.lock().len()
    }

    /// Drop every channel; subscribers observe `Closed`.
    pub fn close(&self) {
        self.inner.rows.lock().clear();
        self.inner.schema.lock().clear();
    }

    fn join<T: Clone + Send + 'static>(
        &self,
        receiver: broadcast::Receiver<T>,
    ) -> FeedSubscription<T> {
        let (state, _) = watch::channel(SubscriptionState::Joining);
        let state = Arc::new(state);
        state.send_replace(SubscriptionState::Joined);

        if self.inner.confirm_delay.is_zero() {
            state.send_replace(SubscriptionState::Active);
        } else {
            let confirm = state.clone();
            let delay = self.inner.confirm_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                confirm.send_if_modified(|current| {
                    if *current == SubscriptionState::Joined {
                        *current = SubscriptionState::Active;
                        true
                    } else {
                        false
                    }
                });
            });
        }

        FeedSubscription { receiver, state }
    }
}

impl Default for ChangeFeedHub {
    fn default() -> Self {
        Self::new(256, Duration::ZERO)
    }
}
