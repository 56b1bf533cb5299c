use std::{collections::HashMap, time::Duration};

use tokio::{sync::oneshot, time::Instant};

use crate::{
    errors::{Error, Result},
    protocol::{Inbound, Request, RequestKind},
    types::RequestId,
};

pub(crate) type Resolver = oneshot::Sender<Result<Inbound>>;

/// A request awaiting exactly one correlated response.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) request: Request,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Instant,
    resolver: Resolver,
}

impl PendingRequest {
    pub(crate) fn kind(&self) -> RequestKind {
        self.request.kind()
    }

    /// Hand the outcome to the waiting caller. Returns false when the caller
    /// has already gone away.
    pub(crate) fn resolve(self, outcome: Result<Inbound>) -> bool {
        self.resolver.send(outcome).is_ok()
    }
}

/// Allocates request ids and tracks in-flight one-shot requests.
///
/// Each entry leaves the table exactly once: either through [`take`] when
/// its response arrives or through [`expire`] when its deadline passes.
///
/// [`take`]: RequestCorrelator::take
/// [`expire`]: RequestCorrelator::expire
#[derive(Debug, Default)]
pub(crate) struct RequestCorrelator {
    last_id: u64,
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestCorrelator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Next id that is not held by any outstanding request.
    pub(crate) fn next_id(&mut self) -> RequestId {
        loop {
            self.last_id = self.last_id.checked_add(1).unwrap_or(1);
            let candidate = RequestId(self.last_id);
            if !self.pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn register(
        &mut self,
        request: Request,
        timeout: Duration,
        now: Instant,
    ) -> (RequestId, oneshot::Receiver<Result<Inbound>>) {
        let id = self.next_id();
        let (resolver, receiver) = oneshot::channel();
        tracing::trace!(req_id = %id, kind = %request.kind(), ?timeout, "request registered");
        self.pending.insert(
            id,
            PendingRequest {
                request,
                created_at: now,
                deadline: now + timeout,
                resolver,
            },
        );
        (id, receiver)
    }

    /// Remove the entry matching a response. A second response for the same
    /// id finds nothing.
    pub(crate) fn take(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Evict every request whose deadline has passed, rejecting it with a
    /// timeout. Returns the number of evicted entries.
    pub(crate) fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(pending) = self.pending.remove(id) {
                let kind = pending.kind();
                let after = pending.deadline - pending.created_at;
                tracing::warn!(req_id = %id, %kind, ?after, "request timed out");
                pending.resolve(Err(Error::RequestTimeout { kind, after }));
            }
        }
        expired.len()
    }

    /// Reject everything outstanding, e.g. when the socket goes away.
    pub(crate) fn fail_all<F>(&mut self, mut error: F) -> usize
    where
        F: FnMut() -> Error,
    {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.resolve(Err(error()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
