use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{
    dispatcher::FeedHandler,
    types::{FeedKey, ListenerId, RequestId, SubscriptionId},
};

/// One logical feed: at most one upstream subscription, any number of
/// local listeners.
#[derive(Debug)]
pub(crate) struct FeedSubscription {
    pub(crate) key: FeedKey,
    pub(crate) upstream_id: Option<SubscriptionId>,
    pub(crate) pending: Option<RequestId>,
    listeners: Vec<(ListenerId, FeedHandler)>,
}

impl FeedSubscription {
    fn new(key: FeedKey) -> Self {
        Self {
            key,
            upstream_id: None,
            pending: None,
            listeners: Vec::new(),
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn handlers(&self) -> impl Iterator<Item = &FeedHandler> {
        self.listeners.iter().map(|(_, handler)| handler)
    }

    fn insert_listener(&mut self, listener: ListenerId, handler: FeedHandler) {
        if let Some(slot) = self.listeners.iter_mut().find(|(id, _)| *id == listener) {
            slot.1 = handler;
        } else {
            self.listeners.push((listener, handler));
        }
    }
}

/// Whether attaching a listener requires a subscribe frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attach {
    Subscribe,
    Shared,
}

/// What a bulk forget has to put on the wire.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Drained {
    pub(crate) forget: Vec<SubscriptionId>,
    pub(crate) in_flight: usize,
}

/// Feed key to subscription state, plus the index of in-flight subscribe
/// requests used to attach server-assigned ids.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    feeds: BTreeMap<FeedKey, FeedSubscription>,
    in_flight: HashMap<RequestId, FeedKey>,
    // Subscribe requests dropped before their ack; the ack gets forgotten on arrival.
    orphans: HashSet<RequestId>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `key`, creating the feed on first use.
    pub(crate) fn attach(&mut self, key: FeedKey, listener: ListenerId, handler: FeedHandler) -> Attach {
        let attach = self.ensure(key.clone());
        if let Some(feed) = self.feeds.get_mut(&key) {
            feed.insert_listener(listener, handler);
        }
        attach
    }

    /// Make sure the feed exists without adding a listener.
    pub(crate) fn ensure(&mut self, key: FeedKey) -> Attach {
        if self.feeds.contains_key(&key) {
            return Attach::Shared;
        }
        self.feeds.insert(key.clone(), FeedSubscription::new(key));
        Attach::Subscribe
    }

    /// Record the subscribe request sent for a feed.
    pub(crate) fn mark_pending(&mut self, key: &FeedKey, req_id: RequestId) {
        if let Some(feed) = self.feeds.get_mut(key) {
            feed.pending = Some(req_id);
            self.in_flight.insert(req_id, key.clone());
        }
    }

    pub(crate) fn is_subscribe_request(&self, req_id: RequestId) -> bool {
        self.in_flight.contains_key(&req_id)
    }

    /// First frame of a stream: store the upstream id so it can be forgotten later.
    pub(crate) fn acknowledge(
        &mut self,
        req_id: RequestId,
        upstream_id: Option<SubscriptionId>,
    ) -> Option<FeedKey> {
        let key = self.in_flight.remove(&req_id)?;
        let feed = self.feeds.get_mut(&key)?;
        feed.pending = None;
        if upstream_id.is_some() {
            feed.upstream_id = upstream_id;
        }
        Some(key)
    }

    /// The server refused the subscription; drop the feed entirely.
    pub(crate) fn reject(&mut self, req_id: RequestId) -> Option<FeedSubscription> {
        let key = self.in_flight.remove(&req_id)?;
        self.feeds.remove(&key)
    }

    /// True when `req_id` belonged to a subscribe dropped by [`drain`](Self::drain).
    pub(crate) fn claim_orphan(&mut self, req_id: RequestId) -> bool {
        self.orphans.remove(&req_id)
    }

    pub(crate) fn get(&self, key: &FeedKey) -> Option<&FeedSubscription> {
        self.feeds.get(key)
    }

    /// Remove a listener from every feed. Returns the keys left without
    /// listeners; the upstream subscriptions stay active.
    pub(crate) fn detach(&mut self, listener: &ListenerId) -> Vec<FeedKey> {
        let mut idle = Vec::new();
        for feed in self.feeds.values_mut() {
            let before = feed.listeners.len();
            feed.listeners.retain(|(id, _)| id != listener);
            if before != feed.listeners.len() && feed.listeners.is_empty() {
                idle.push(feed.key.clone());
            }
        }
        idle
    }

    /// Drop a feed that has no listeners, returning its upstream id.
    /// A feed still waiting for its ack becomes an orphan instead.
    pub(crate) fn remove_idle(&mut self, key: &FeedKey) -> Option<SubscriptionId> {
        if self.feeds.get(key)?.listener_count() > 0 {
            return None;
        }
        let feed = self.feeds.remove(key)?;
        if let Some(req_id) = feed.pending {
            self.in_flight.remove(&req_id);
            self.orphans.insert(req_id);
        }
        feed.upstream_id
    }

    /// Empty the registry for a bulk forget on a live socket.
    pub(crate) fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();
        for (_, feed) in std::mem::take(&mut self.feeds) {
            if let Some(id) = feed.upstream_id {
                drained.forget.push(id);
            }
        }
        drained.in_flight = self.in_flight.len();
        self.orphans.extend(self.in_flight.drain().map(|(req_id, _)| req_id));
        drained
    }

    /// Forget everything without wire traffic; used when the socket is gone.
    pub(crate) fn clear(&mut self) {
        self.feeds.clear();
        self.in_flight.clear();
        self.orphans.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.feeds.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}
