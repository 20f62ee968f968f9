//! Identifier table for in-flight calls and subscriptions.
//!
//! Tracks which request identifier is owned by which operation, plus a
//! reverse index from server-assigned subscription ids to local ids so
//! pushes can be routed. Not synchronized itself; the engine wraps it in a
//! mutex and never runs callbacks while holding it.

use crate::error::{EngineError, Result};
use crate::options::CallOptions;
use crate::subscription::{SubscriptionHandler, SubscriptionState};
use chainrpc_protocol::{RemoteId, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) type RawCompletion = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

pub(crate) struct PendingCall {
    pub method: String,
    pub options: CallOptions,
    pub completion: Option<RawCompletion>,
}

pub(crate) struct ActiveSubscription {
    pub method: String,
    pub unsubscribe_method: Option<String>,
    pub resend_on_reconnect: bool,
    pub state: SubscriptionState,
    pub handler: Arc<dyn SubscriptionHandler>,
    /// Cleared on teardown so deliveries already queued are skipped
    pub live: Arc<AtomicBool>,
}

pub(crate) enum EntryKind {
    Call(PendingCall),
    Subscription(ActiveSubscription),
}

pub(crate) struct Entry {
    /// Engine-wide sequence number, distinguishes owners of a reused id
    pub seq: u64,
    pub frame: String,
    /// Frame handed to the current connection
    pub written: bool,
    /// Frame must be replayed on the next connection
    pub needs_resend: bool,
    pub kind: EntryKind,
}

impl Entry {
    pub fn method(&self) -> &str {
        match &self.kind {
            EntryKind::Call(call) => &call.method,
            EntryKind::Subscription(sub) => &sub.method,
        }
    }
}

/// Outcome of a caller-requested cancel
pub(crate) enum Canceled {
    Owner(Entry),
    /// A completion was already queued; it has been withdrawn
    QueuedCompletion,
    Unknown,
}

pub(crate) struct Registry {
    entries: HashMap<RequestId, Entry>,
    remote_index: HashMap<RemoteId, RequestId>,
    /// Calls whose completion is queued but has not run, by sequence number
    completing: HashMap<RequestId, u64>,
    /// Subscribes canceled after being written; maps to the unsubscribe
    /// method owed once the node acknowledges
    orphans: HashMap<RequestId, String>,
    next_id: RequestId,
    next_seq: u64,
    closed: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            remote_index: HashMap::new(),
            completing: HashMap::new(),
            orphans: HashMap::new(),
            next_id: 1,
            next_seq: 1,
            closed: false,
        }
    }

    /// Pick the next identifier not currently owned.
    ///
    /// Walks forward from the last handed-out id, wrapping through the full
    /// `u16` range. Ids with a queued completion or an awaited late ack
    /// count as owned. Fails only when every identifier is owned.
    pub fn allocate(&mut self) -> Result<RequestId> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        for _ in 0..=u32::from(u16::MAX) {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.is_owned(candidate) {
                return Ok(candidate);
            }
        }
        Err(EngineError::IdentifiersExhausted)
    }

    /// Register an operation under an identifier returned by `allocate`.
    pub fn insert(&mut self, id: RequestId, frame: String, kind: EntryKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id,
            Entry {
                seq,
                frame,
                written: false,
                needs_resend: false,
                kind,
            },
        );
        seq
    }

    pub fn get(&self, id: RequestId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    fn is_owned(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
            || self.completing.contains_key(&id)
            || self.orphans.contains_key(&id)
    }

    /// Remove an entry and any remote index pointing at it.
    ///
    /// Subscriptions are marked not live so queued deliveries are dropped.
    /// Calls with a completion stay withdrawable by `cancel` until
    /// `finish_completion` runs.
    pub fn remove(&mut self, id: RequestId) -> Option<Entry> {
        let entry = self.detach(id)?;
        if let EntryKind::Call(PendingCall {
            completion: Some(_),
            ..
        }) = &entry.kind
        {
            self.completing.insert(id, entry.seq);
        }
        Some(entry)
    }

    /// Drop whatever owns `id` on behalf of the caller.
    ///
    /// A subscribe already written but not yet acknowledged leaves an
    /// orphan so the late ack can be answered with its unsubscribe method.
    pub fn cancel(&mut self, id: RequestId) -> Canceled {
        if let Some(entry) = self.detach(id) {
            if let EntryKind::Subscription(sub) = &entry.kind {
                if entry.written && sub.state == SubscriptionState::Pending {
                    if let Some(method) = &sub.unsubscribe_method {
                        self.orphans.insert(id, method.clone());
                    }
                }
            }
            return Canceled::Owner(entry);
        }
        if self.completing.remove(&id).is_some() {
            return Canceled::QueuedCompletion;
        }
        Canceled::Unknown
    }

    /// Called by a queued completion before it runs; false if it was
    /// withdrawn by `cancel` in the meantime
    pub fn finish_completion(&mut self, id: RequestId, seq: u64) -> bool {
        match self.completing.get(&id) {
            Some(queued) if *queued == seq => {
                self.completing.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Unsubscribe method owed for a late ack of a canceled subscribe
    pub fn take_orphan(&mut self, id: RequestId) -> Option<String> {
        self.orphans.remove(&id)
    }

    fn detach(&mut self, id: RequestId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if let EntryKind::Subscription(sub) = &entry.kind {
            sub.live.store(false, Ordering::Release);
            if let SubscriptionState::Acknowledged(remote) = &sub.state {
                self.remote_index.remove(remote);
            }
        }
        Some(entry)
    }

    /// Remove only if the entry still belongs to the owner with `seq`
    pub fn remove_if_seq(&mut self, id: RequestId, seq: u64) -> Option<Entry> {
        match self.entries.get(&id) {
            Some(entry) if entry.seq == seq => self.remove(id),
            _ => None,
        }
    }

    /// Frame to put on the wire for `id`, marking it written.
    ///
    /// Returns `None` if the owner was removed (or replaced) since the frame
    /// was queued, so canceled requests never reach the node.
    pub fn take_for_write(&mut self, id: RequestId, seq: u64) -> Option<String> {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.seq == seq && !entry.written => {
                entry.written = true;
                Some(entry.frame.clone())
            }
            _ => None,
        }
    }

    /// Record the server-assigned id for a pending subscription.
    pub fn acknowledge(&mut self, id: RequestId, remote: RemoteId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let EntryKind::Subscription(sub) = &mut entry.kind else {
            return false;
        };
        if sub.state != SubscriptionState::Pending {
            return false;
        }
        sub.state = SubscriptionState::Acknowledged(remote.clone());
        self.remote_index.insert(remote, id);
        true
    }

    pub fn lookup_remote(&self, remote: &RemoteId) -> Option<RequestId> {
        self.remote_index.get(remote).copied()
    }

    pub fn subscription_state(&self, id: RequestId) -> Option<SubscriptionState> {
        match &self.entries.get(&id)?.kind {
            EntryKind::Subscription(sub) => Some(sub.state.clone()),
            EntryKind::Call(_) => None,
        }
    }

    /// Split written entries on connection loss.
    ///
    /// Resendable ones stay registered and are flagged for replay;
    /// subscriptions among them go back to `Pending`. The rest are removed
    /// and returned so the caller can fail them. Unwritten entries are left
    /// alone; their frames are still queued.
    pub fn on_connection_lost(&mut self) -> ConnectionLoss {
        // Node-side subscriptions died with the connection
        self.orphans.clear();
        let mut loss = ConnectionLoss::default();
        let written: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.written)
            .map(|(id, _)| *id)
            .collect();

        for id in written {
            let resend = match self.entries.get(&id).map(|e| &e.kind) {
                Some(EntryKind::Call(call)) => call.options.resend_on_reconnect,
                Some(EntryKind::Subscription(sub)) => sub.resend_on_reconnect,
                None => continue,
            };

            if !resend {
                if let Some(entry) = self.remove(id) {
                    loss.dropped.push((id, entry));
                }
                continue;
            }

            let mut stale_remote = None;
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.written = false;
                entry.needs_resend = true;
                if let EntryKind::Subscription(sub) = &mut entry.kind {
                    if let SubscriptionState::Acknowledged(remote) =
                        std::mem::replace(&mut sub.state, SubscriptionState::Pending)
                    {
                        stale_remote = Some(remote);
                    }
                    loss.interrupted.push((Arc::clone(&sub.handler), Arc::clone(&sub.live)));
                }
            }
            if let Some(remote) = stale_remote {
                self.remote_index.remove(&remote);
            }
        }
        loss
    }

    /// Frames to replay on a fresh connection, in original issue order.
    pub fn take_resend_frames(&mut self) -> Vec<(RequestId, String)> {
        let mut frames: Vec<(u64, RequestId, String)> = self
            .entries
            .iter_mut()
            .filter(|(_, entry)| entry.needs_resend)
            .map(|(id, entry)| {
                entry.needs_resend = false;
                entry.written = true;
                (entry.seq, *id, entry.frame.clone())
            })
            .collect();
        frames.sort_by_key(|(seq, _, _)| *seq);
        frames.into_iter().map(|(_, id, frame)| (id, frame)).collect()
    }

    /// Refuse further allocations and hand back every remaining entry.
    pub fn close(&mut self) -> Vec<(RequestId, Entry)> {
        self.closed = true;
        self.orphans.clear();
        let ids: Vec<RequestId> = self.entries.keys().copied().collect();
        let mut drained: Vec<(RequestId, Entry)> = ids
            .into_iter()
            .filter_map(|id| self.remove(id).map(|entry| (id, entry)))
            .collect();
        drained.sort_by_key(|(_, entry)| entry.seq);
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_calls(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.kind, EntryKind::Call(_)))
            .count()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.kind, EntryKind::Subscription(_)))
            .count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Entries affected by a dropped connection
#[derive(Default)]
pub(crate) struct ConnectionLoss {
    /// Removed; must be failed terminally
    pub dropped: Vec<(RequestId, Entry)>,
    /// Subscriptions kept for resend; told about the interruption
    pub interrupted: Vec<(Arc<dyn SubscriptionHandler>, Arc<AtomicBool>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use proptest::prelude::*;
    use std::collections::HashSet;

    struct NullHandler;

    impl SubscriptionHandler for NullHandler {
        fn handle_data(&self, _data: Value) -> std::result::Result<(), HandlerError> {
            Ok(())
        }

        fn handle_error(&self, _error: EngineError, _unsubscribed: bool) {}
    }

    fn call(resend: bool) -> EntryKind {
        EntryKind::Call(PendingCall {
            method: "chain_getHeader".into(),
            options: CallOptions {
                resend_on_reconnect: resend,
                timeout: None,
            },
            completion: None,
        })
    }

    fn subscription(resend: bool) -> (EntryKind, Arc<AtomicBool>) {
        let live = Arc::new(AtomicBool::new(true));
        let kind = EntryKind::Subscription(ActiveSubscription {
            method: "chain_subscribeNewHeads".into(),
            unsubscribe_method: Some("chain_unsubscribeNewHeads".into()),
            resend_on_reconnect: resend,
            state: SubscriptionState::Pending,
            handler: Arc::new(NullHandler),
            live: Arc::clone(&live),
        });
        (kind, live)
    }

    fn register(registry: &mut Registry, kind: EntryKind) -> (RequestId, u64) {
        let id = registry.allocate().unwrap();
        let seq = registry.insert(id, format!("frame-{}", id), kind);
        (id, seq)
    }

    #[test]
    fn test_first_identifier_is_one() {
        let mut registry = Registry::new();
        assert_eq!(registry.allocate().unwrap(), 1);
    }

    #[test]
    fn test_identifiers_skip_owned_after_wrap() {
        let mut registry = Registry::new();
        let (first, _) = register(&mut registry, call(false));
        assert_eq!(first, 1);

        registry.next_id = u16::MAX;
        let (last, _) = register(&mut registry, call(false));
        assert_eq!(last, u16::MAX);

        // Wraps to 0, then must skip 1 which is still owned
        assert_eq!(registry.allocate().unwrap(), 0);
        let (next, _) = register(&mut registry, call(false));
        assert_eq!(next, 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut registry = Registry::new();
        for _ in 0..=u32::from(u16::MAX) {
            register(&mut registry, call(false));
        }
        assert_eq!(registry.allocate(), Err(EngineError::IdentifiersExhausted));

        registry.remove(500);
        assert_eq!(registry.allocate().unwrap(), 500);
    }

    #[test]
    fn test_remove_clears_remote_index_and_live_flag() {
        let mut registry = Registry::new();
        let (kind, live) = subscription(true);
        let (id, _) = register(&mut registry, kind);

        assert!(registry.acknowledge(id, RemoteId::from("A1")));
        assert_eq!(registry.lookup_remote(&RemoteId::from("A1")), Some(id));

        registry.remove(id);
        assert_eq!(registry.lookup_remote(&RemoteId::from("A1")), None);
        assert!(!live.load(Ordering::Acquire));
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_acknowledge_only_once() {
        let mut registry = Registry::new();
        let (kind, _) = subscription(true);
        let (id, _) = register(&mut registry, kind);

        assert!(registry.acknowledge(id, RemoteId::from("A1")));
        assert!(!registry.acknowledge(id, RemoteId::from("B2")));
        assert_eq!(
            registry.subscription_state(id),
            Some(SubscriptionState::Acknowledged(RemoteId::from("A1")))
        );

        let (call_id, _) = register(&mut registry, call(false));
        assert!(!registry.acknowledge(call_id, RemoteId::from("C3")));
    }

    #[test]
    fn test_remove_if_seq_ignores_new_owner() {
        let mut registry = Registry::new();
        let (id, old_seq) = register(&mut registry, call(false));
        registry.remove(id);
        registry.next_id = id;
        let (same_id, new_seq) = register(&mut registry, call(false));
        assert_eq!(same_id, id);
        assert_ne!(old_seq, new_seq);

        assert!(registry.remove_if_seq(id, old_seq).is_none());
        assert!(registry.contains(id));
        assert!(registry.remove_if_seq(id, new_seq).is_some());
    }

    #[test]
    fn test_take_for_write_once() {
        let mut registry = Registry::new();
        let (id, seq) = register(&mut registry, call(false));
        assert_eq!(registry.take_for_write(id, seq).as_deref(), Some("frame-1"));
        assert!(registry.take_for_write(id, seq).is_none());

        let (canceled, seq) = register(&mut registry, call(false));
        registry.remove(canceled);
        assert!(registry.take_for_write(canceled, seq).is_none());
    }

    #[test]
    fn test_connection_lost_splits_entries() {
        let mut registry = Registry::new();
        let (keep_call, keep_seq) = register(&mut registry, call(true));
        let (drop_call, drop_seq) = register(&mut registry, call(false));
        let (unwritten, _) = register(&mut registry, call(false));
        let (kind, live) = subscription(true);
        let (sub, sub_seq) = register(&mut registry, kind);

        registry.take_for_write(keep_call, keep_seq);
        registry.take_for_write(drop_call, drop_seq);
        registry.take_for_write(sub, sub_seq);
        registry.acknowledge(sub, RemoteId::from("A1"));

        let loss = registry.on_connection_lost();
        let dropped: Vec<RequestId> = loss.dropped.iter().map(|(id, _)| *id).collect();
        assert_eq!(dropped, vec![drop_call]);
        assert_eq!(loss.interrupted.len(), 1);

        assert!(registry.contains(keep_call));
        assert!(registry.contains(unwritten));
        assert_eq!(
            registry.subscription_state(sub),
            Some(SubscriptionState::Pending)
        );
        assert_eq!(registry.lookup_remote(&RemoteId::from("A1")), None);
        assert!(live.load(Ordering::Acquire));

        let frames: Vec<RequestId> = registry
            .take_resend_frames()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(frames, vec![keep_call, sub]);
        assert!(registry.take_resend_frames().is_empty());
    }

    #[test]
    fn test_close_drains_and_refuses() {
        let mut registry = Registry::new();
        register(&mut registry, call(false));
        let (kind, live) = subscription(false);
        register(&mut registry, kind);

        let drained = registry.close();
        assert_eq!(drained.len(), 2);
        assert!(!live.load(Ordering::Acquire));
        assert_eq!(registry.allocate(), Err(EngineError::Closed));
        assert_eq!(registry.pending_calls(), 0);
        assert_eq!(registry.active_subscriptions(), 0);
    }

    fn call_with_completion() -> EntryKind {
        EntryKind::Call(PendingCall {
            method: "chain_getHeader".into(),
            options: CallOptions::default(),
            completion: Some(Box::new(|_: Result<Value>| {})),
        })
    }

    #[test]
    fn test_cancel_withdraws_queued_completion() {
        let mut registry = Registry::new();
        let (id, seq) = register(&mut registry, call_with_completion());

        // Response removed the call and queued its completion
        assert!(registry.remove(id).is_some());
        assert_eq!(registry.pending_calls(), 0);
        // Still reserved until the completion runs
        assert_ne!(registry.allocate().unwrap(), id);

        assert!(matches!(registry.cancel(id), Canceled::QueuedCompletion));
        assert!(!registry.finish_completion(id, seq));
        assert!(matches!(registry.cancel(id), Canceled::Unknown));

        let (other, other_seq) = register(&mut registry, call_with_completion());
        registry.remove(other);
        assert!(registry.finish_completion(other, other_seq));
        assert!(matches!(registry.cancel(other), Canceled::Unknown));
    }

    #[test]
    fn test_cancel_written_pending_subscribe_leaves_orphan() {
        let mut registry = Registry::new();
        let (kind, live) = subscription(true);
        let (id, seq) = register(&mut registry, kind);
        registry.take_for_write(id, seq);

        assert!(matches!(registry.cancel(id), Canceled::Owner(_)));
        assert!(!live.load(Ordering::Acquire));
        registry.next_id = id;
        assert_ne!(registry.allocate().unwrap(), id);

        assert_eq!(
            registry.take_orphan(id).as_deref(),
            Some("chain_unsubscribeNewHeads")
        );
        assert!(registry.take_orphan(id).is_none());
    }

    #[test]
    fn test_unwritten_or_lost_subscribe_leaves_no_orphan() {
        let mut registry = Registry::new();
        let (kind, _) = subscription(true);
        let (unwritten, _) = register(&mut registry, kind);
        registry.cancel(unwritten);
        assert!(registry.take_orphan(unwritten).is_none());

        let (kind, _) = subscription(false);
        let (written, seq) = register(&mut registry, kind);
        registry.take_for_write(written, seq);
        registry.cancel(written);
        registry.on_connection_lost();
        assert!(registry.take_orphan(written).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Issue,
        Complete(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Issue),
            2 => any::<usize>().prop_map(Op::Complete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn identifiers_unique_while_owned(ops in prop::collection::vec(op_strategy(), 1..300)) {
            let mut registry = Registry::new();
            let mut owned: Vec<RequestId> = Vec::new();

            for op in ops {
                match op {
                    Op::Issue => {
                        let (id, _) = register(&mut registry, call(false));
                        prop_assert!(!owned.contains(&id), "id {} handed out twice", id);
                        owned.push(id);
                    }
                    Op::Complete(pick) => {
                        if !owned.is_empty() {
                            let id = owned.remove(pick % owned.len());
                            prop_assert!(registry.remove(id).is_some());
                        }
                    }
                }
            }

            let unique: HashSet<RequestId> = owned.iter().copied().collect();
            prop_assert_eq!(unique.len(), owned.len());
            prop_assert_eq!(registry.pending_calls(), owned.len());
        }
    }
}
