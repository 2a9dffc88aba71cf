//! In-flight `run` calls awaiting their result.
//!
//! Every entry leaves the table through exactly one of: a matching result
//! ([`CorrelationTable::complete`]), deadline expiry
//! ([`CorrelationTable::expire`]), callee disconnect
//! ([`CorrelationTable::remove_for_callee`]) or caller disconnect
//! ([`CorrelationTable::remove_for_caller`]).

use std::collections::HashMap;
use std::time::Instant;

use plugbus_core::{ConnectionId, PluginKey};

#[derive(Clone, Debug)]
pub struct PendingCall {
    /// Broker-allocated id, used as the msgid of the forwarded request.
    pub call_id: u64,
    pub caller: ConnectionId,
    /// msgid of the caller's original `run` request.
    pub caller_request_id: u64,
    pub callee_key: PluginKey,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("call id {0} is already pending")]
    Duplicate(u64),
    #[error("no pending call with id {0}")]
    Unknown(u64),
    #[error("call {0} is not addressed to this plugin")]
    WrongCallee(u64),
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    calls: HashMap<u64, PendingCall>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call: PendingCall) -> Result<(), CorrelationError> {
        if self.calls.contains_key(&call.call_id) {
            return Err(CorrelationError::Duplicate(call.call_id));
        }
        self.calls.insert(call.call_id, call);
        Ok(())
    }

    /// Remove and return the call if `responder` is its callee. A mismatched
    /// responder leaves the entry in place.
    pub fn complete(&mut self, call_id: u64, responder: &PluginKey) -> Result<PendingCall, CorrelationError> {
        match self.calls.get(&call_id) {
            None => Err(CorrelationError::Unknown(call_id)),
            Some(call) if call.callee_key != *responder => Err(CorrelationError::WrongCallee(call_id)),
            Some(_) => self.calls.remove(&call_id).ok_or(CorrelationError::Unknown(call_id)),
        }
    }

    /// Remove every call whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingCall> {
        self.drain_where(|call| call.deadline.is_some_and(|d| d <= now))
    }

    pub fn remove_for_callee(&mut self, key: &PluginKey) -> Vec<PendingCall> {
        self.drain_where(|call| call.callee_key == *key)
    }

    pub fn remove_for_caller(&mut self, conn: &ConnectionId) -> Vec<PendingCall> {
        self.drain_where(|call| call.caller == *conn)
    }

    fn drain_where(&mut self, pred: impl Fn(&PendingCall) -> bool) -> Vec<PendingCall> {
        let ids: Vec<u64> = self
            .calls
            .values()
            .filter(|call| pred(call))
            .map(|call| call.call_id)
            .collect();
        ids.into_iter().filter_map(|id| self.calls.remove(&id)).collect()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, call_id: u64) -> bool {
        self.calls.contains_key(&call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn call(call_id: u64, caller: &ConnectionId, callee: PluginKey, deadline: Option<Instant>) -> PendingCall {
        PendingCall {
            call_id,
            caller: caller.clone(),
            caller_request_id: call_id + 1000,
            callee_key: callee,
            created_at: Instant::now(),
            deadline,
        }
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut table = CorrelationTable::new();
        let conn = ConnectionId::new();
        let callee = PluginKey::generate();
        table.insert(call(1, &conn, callee, None)).unwrap();
        assert_eq!(
            table.insert(call(1, &conn, callee, None)).unwrap_err(),
            CorrelationError::Duplicate(1)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn complete_removes_exactly_once() {
        let mut table = CorrelationTable::new();
        let conn = ConnectionId::new();
        let callee = PluginKey::generate();
        table.insert(call(7, &conn, callee, None)).unwrap();

        let done = table.complete(7, &callee).unwrap();
        assert_eq!(done.caller_request_id, 1007);
        assert_eq!(table.complete(7, &callee).unwrap_err(), CorrelationError::Unknown(7));
        assert!(table.is_empty());
    }

    #[test]
    fn wrong_callee_leaves_entry() {
        let mut table = CorrelationTable::new();
        let conn = ConnectionId::new();
        let callee = PluginKey::generate();
        table.insert(call(3, &conn, callee, None)).unwrap();

        let intruder = PluginKey::generate();
        assert_eq!(table.complete(3, &intruder).unwrap_err(), CorrelationError::WrongCallee(3));
        assert!(table.contains(3));
        assert!(table.complete(3, &callee).is_ok());
    }

    #[test]
    fn expire_only_past_deadlines() {
        let mut table = CorrelationTable::new();
        let conn = ConnectionId::new();
        let callee = PluginKey::generate();
        let now = Instant::now();
        table.insert(call(1, &conn, callee, Some(now))).unwrap();
        table.insert(call(2, &conn, callee, Some(now + Duration::from_secs(60)))).unwrap();
        table.insert(call(3, &conn, callee, None)).unwrap();

        let expired = table.expire(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].call_id, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn disconnect_purges_by_role() {
        let mut table = CorrelationTable::new();
        let caller_a = ConnectionId::new();
        let caller_b = ConnectionId::new();
        let callee_x = PluginKey::generate();
        let callee_y = PluginKey::generate();
        table.insert(call(1, &caller_a, callee_x, None)).unwrap();
        table.insert(call(2, &caller_b, callee_x, None)).unwrap();
        table.insert(call(3, &caller_b, callee_y, None)).unwrap();

        let orphaned = table.remove_for_callee(&callee_x);
        assert_eq!(orphaned.len(), 2);
        let dropped = table.remove_for_caller(&caller_b);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].call_id, 3);
        assert!(table.is_empty());
    }
}
