//! SIP transaction state machines (RFC 3261 §17) and the keyed store that
//! indexes them (component D, transaction half).
//!
//! Each of the four transaction kinds follows its own diagram, but they
//! share one execution shape — the same one `rvoip-transaction-core`'s
//! `run_transaction_loop` used to drive generically over an async channel:
//! receive an event (a response, an ACK, a timer firing), look at the
//! current state, decide the next state and what to do. Here that shape is a
//! synchronous `on_response`/`on_timer`/`on_ack` method returning an
//! [`Action`] list for `Agent::loop_once` to carry out, since spec §5
//! forbids a spawned task per transaction.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, trace};

use super::message::{Method, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Calling,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Lookup key: `(branch, cseq-method, role)` per spec §4.3, where role
/// disambiguates a UAC's and a UAS's view of the same branch (RFC 3261
/// allows a stateful proxy/UA to hold both for the same request).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub is_server: bool,
}

/// A side effect for `Agent::loop_once` to carry out. Keeping transactions
/// free of direct transport/timer access is what makes `on_response` etc.
/// synchronous, pure, and unit-testable without a fake socket.
#[derive(Debug, Clone)]
pub enum Action {
    /// Re-send the last-sent bytes verbatim (spec §9 "Retransmit storage":
    /// never re-serialize from headers).
    Retransmit,
    /// Schedule the next retransmit/timeout check this many ms from now.
    ScheduleTimer { delay_ms: u64 },
    /// Send `bytes` (a newly constructed message, e.g. an ACK) to `to`.
    Send { bytes: Vec<u8>, to: SocketAddr },
    /// Notify the transaction user a final/provisional response arrived.
    NotifyResponse(Response),
    /// The transaction hit its retransmit budget with no final response.
    NotifyTimeout,
    /// The transaction is now `Terminated`; the store may reap it after
    /// timer K / timer J / timer I elapses.
    Terminated,
}

pub struct Transaction {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub destination: SocketAddr,
    pub dialog_call_id: Option<String>,
    /// The dialog's local tag, stored alongside `dialog_call_id` so a
    /// timeout/termination callback can resolve a [`super::dialog::DialogHandle`]
    /// without the response headers a normal reply would carry.
    pub dialog_local_tag: Option<String>,
    pub state: TransactionState,
    last_sent: Vec<u8>,
    retransmit_count: u32,
    retransmit_interval_ms: u64,
    t1_ms: u64,
    t2_ms: u64,
    t4_ms: u64,
    started_at_ms: u64,
    terminated_at_ms: Option<u64>,
}

impl Transaction {
    pub fn new_client(
        key: TransactionKey,
        kind: TransactionKind,
        destination: SocketAddr,
        request_bytes: Vec<u8>,
        now_ms: u64,
        t1_ms: u64,
        t2_ms: u64,
        t4_ms: u64,
    ) -> Self {
        let state = match kind {
            TransactionKind::InviteClient => TransactionState::Calling,
            TransactionKind::NonInviteClient => TransactionState::Trying,
            _ => panic!("new_client used for a server transaction kind"),
        };
        Transaction {
            key,
            kind,
            destination,
            dialog_call_id: None,
            dialog_local_tag: None,
            state,
            last_sent: request_bytes,
            retransmit_count: 0,
            retransmit_interval_ms: t1_ms,
            t1_ms,
            t2_ms,
            t4_ms,
            started_at_ms: now_ms,
            terminated_at_ms: None,
        }
    }

    pub fn new_server(
        key: TransactionKey,
        kind: TransactionKind,
        destination: SocketAddr,
        now_ms: u64,
        t1_ms: u64,
        t2_ms: u64,
        t4_ms: u64,
    ) -> Self {
        Transaction {
            key,
            kind,
            destination,
            dialog_call_id: None,
            dialog_local_tag: None,
            state: TransactionState::Trying,
            last_sent: Vec::new(),
            retransmit_count: 0,
            retransmit_interval_ms: t1_ms,
            t1_ms,
            t2_ms,
            t4_ms,
            started_at_ms: now_ms,
            terminated_at_ms: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }

    /// Deadline after which a server transaction's store entry may be
    /// reaped: Timer J (non-INVITE) / Timer I (INVITE), both `64*T1` in the
    /// default profile, matching the client side's final deadline.
    pub fn reapable_at_ms(&self, timer_k_ms: u64) -> Option<u64> {
        self.terminated_at_ms.map(|t| t + timer_k_ms)
    }

    fn mark_terminated(&mut self, now_ms: u64) -> Action {
        self.state = TransactionState::Terminated;
        self.terminated_at_ms = Some(now_ms);
        Action::Terminated
    }

    /// Set the byte-identical request this transaction retransmits. Called
    /// once, right after the first send.
    pub fn set_sent_bytes(&mut self, bytes: Vec<u8>) {
        self.last_sent = bytes;
    }

    pub fn sent_bytes(&self) -> &[u8] {
        &self.last_sent
    }

    /// Timer-driven retransmit/timeout check (spec §4.4's T1-doubling
    /// schedule, capped at T2 for non-INVITE, and the `64*T1` final
    /// deadline common to both client kinds).
    pub fn on_timer(&mut self, now_ms: u64) -> Vec<Action> {
        let elapsed = now_ms.saturating_sub(self.started_at_ms);
        match self.kind {
            TransactionKind::InviteClient | TransactionKind::NonInviteClient => {
                if matches!(self.state, TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding)
                {
                    if elapsed >= 64 * self.t1_ms {
                        return vec![self.mark_terminated(now_ms), Action::NotifyTimeout];
                    }
                    self.retransmit_count += 1;
                    let cap = if self.kind == TransactionKind::NonInviteClient {
                        self.t2_ms
                    } else {
                        u64::MAX
                    };
                    self.retransmit_interval_ms = (self.retransmit_interval_ms * 2).min(cap);
                    trace!(branch = %self.key.branch, count = self.retransmit_count, "retransmitting request");
                    vec![
                        Action::Retransmit,
                        Action::ScheduleTimer {
                            delay_ms: self.retransmit_interval_ms,
                        },
                    ]
                } else {
                    Vec::new()
                }
            }
            TransactionKind::InviteServer => {
                if self.state == TransactionState::Completed {
                    if elapsed >= 64 * self.t1_ms {
                        return vec![self.mark_terminated(now_ms)];
                    }
                    self.retransmit_interval_ms = (self.retransmit_interval_ms * 2).min(self.t2_ms);
                    vec![
                        Action::Retransmit,
                        Action::ScheduleTimer {
                            delay_ms: self.retransmit_interval_ms,
                        },
                    ]
                } else {
                    Vec::new()
                }
            }
            TransactionKind::NonInviteServer => Vec::new(),
        }
    }

    /// A final/provisional response arrived on the client side for this
    /// transaction's request.
    pub fn on_response(&mut self, response: Response, now_ms: u64) -> Vec<Action> {
        let mut actions = vec![Action::NotifyResponse(response.clone())];
        match self.kind {
            TransactionKind::InviteClient => {
                if response.is_provisional() {
                    self.state = TransactionState::Proceeding;
                } else if response.is_success() {
                    // 2xx terminates the client transaction immediately;
                    // ACK for 2xx is a new transaction, built by the dialog
                    // layer, not retransmitted by this one.
                    actions.push(self.mark_terminated(now_ms));
                } else {
                    // non-2xx final: caller constructs the ACK for this
                    // branch; this transaction completes and drains.
                    self.state = TransactionState::Completed;
                    self.retransmit_interval_ms = 0;
                }
            }
            TransactionKind::NonInviteClient => {
                if response.is_provisional() {
                    self.state = TransactionState::Proceeding;
                } else {
                    self.state = TransactionState::Completed;
                    actions.push(self.mark_terminated(now_ms));
                }
            }
            TransactionKind::InviteServer | TransactionKind::NonInviteServer => {
                debug!("on_response called on a server transaction; ignoring");
            }
        }
        actions
    }

    /// ACK received for a non-2xx final response on an INVITE server
    /// transaction (RFC 3261 §17.2.1): stop retransmitting the final
    /// response and move to Confirmed, draining for Timer I.
    pub fn on_ack(&mut self, now_ms: u64) -> Vec<Action> {
        if self.kind == TransactionKind::InviteServer && self.state == TransactionState::Completed {
            self.state = TransactionState::Confirmed;
            vec![Action::ScheduleTimer { delay_ms: self.t4_ms }]
        } else {
            Vec::new()
        }
    }

    /// Timer I/J grace period elapsed after Confirmed/Completed; drain to
    /// Terminated.
    pub fn on_drain_timer(&mut self, now_ms: u64) -> Vec<Action> {
        match self.state {
            TransactionState::Confirmed | TransactionState::Completed => {
                vec![self.mark_terminated(now_ms)]
            }
            _ => Vec::new(),
        }
    }

    /// Send a provisional or final response on a server transaction.
    pub fn send_server_response(&mut self, response: &Response, bytes: Vec<u8>, now_ms: u64) -> Vec<Action> {
        self.last_sent = bytes.clone();
        match self.kind {
            TransactionKind::InviteServer => {
                if response.is_provisional() {
                    self.state = TransactionState::Proceeding;
                    vec![Action::Send { bytes, to: self.destination }]
                } else {
                    self.state = TransactionState::Completed;
                    vec![
                        Action::Send { bytes, to: self.destination },
                        Action::ScheduleTimer { delay_ms: self.t1_ms },
                    ]
                }
            }
            TransactionKind::NonInviteServer => {
                if response.is_provisional() {
                    self.state = TransactionState::Proceeding;
                } else {
                    self.state = TransactionState::Completed;
                }
                vec![
                    Action::Send { bytes, to: self.destination },
                    Action::ScheduleTimer { delay_ms: self.t4_ms },
                ]
            }
            _ => Vec::new(),
        }
    }
}

/// Transactions keyed by `(branch, cseq-method, role)` for O(1) lookup on
/// inbound (spec §4.3).
#[derive(Default)]
pub struct TransactionStore {
    transactions: HashMap<TransactionKey, Transaction>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, transaction: Transaction) {
        self.transactions.insert(transaction.key.clone(), transaction);
    }

    pub fn find(&self, key: &TransactionKey) -> Option<&Transaction> {
        self.transactions.get(key)
    }

    pub fn find_mut(&mut self, key: &TransactionKey) -> Option<&mut Transaction> {
        self.transactions.get_mut(key)
    }

    pub fn remove(&mut self, key: &TransactionKey) -> Option<Transaction> {
        self.transactions.remove(key)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Remove every transaction that terminated at least `timer_k_ms` ago.
    pub fn reap_expired(&mut self, now_ms: u64, timer_k_ms: u64) -> usize {
        let expired: Vec<TransactionKey> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.reapable_at_ms(timer_k_ms).map_or(false, |d| d <= now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.transactions.remove(&key);
        }
        count
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Transaction> {
        self.transactions.values_mut()
    }

    /// Drop every tracked transaction unconditionally, for `Agent::stop`
    /// (spec §5 "Cancellation").
    pub fn clear(&mut self) {
        self.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::Headers;

    fn addr() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    fn key() -> TransactionKey {
        TransactionKey {
            branch: "z9hG4bK1".to_string(),
            method: Method::Invite,
            is_server: false,
        }
    }

    #[test]
    fn invite_client_retransmits_with_t1_doubling() {
        let mut txn = Transaction::new_client(
            key(),
            TransactionKind::InviteClient,
            addr(),
            b"INVITE ...".to_vec(),
            0,
            500,
            4000,
            5000,
        );
        let actions = txn.on_timer(500);
        assert!(matches!(actions[0], Action::Retransmit));
        assert!(matches!(actions[1], Action::ScheduleTimer { delay_ms: 1000 }));
    }

    #[test]
    fn invite_client_times_out_after_64_t1() {
        let mut txn = Transaction::new_client(
            key(),
            TransactionKind::InviteClient,
            addr(),
            b"INVITE ...".to_vec(),
            0,
            500,
            4000,
            5000,
        );
        let actions = txn.on_timer(64 * 500);
        assert!(actions.iter().any(|a| matches!(a, Action::NotifyTimeout)));
        assert!(txn.is_terminated());
    }

    #[test]
    fn success_response_terminates_invite_client_immediately() {
        let mut txn = Transaction::new_client(
            key(),
            TransactionKind::InviteClient,
            addr(),
            b"INVITE ...".to_vec(),
            0,
            500,
            4000,
            5000,
        );
        let resp = Response {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: Headers::default(),
            body: Vec::new(),
        };
        let actions = txn.on_response(resp, 100);
        assert!(txn.is_terminated());
        assert!(actions.iter().any(|a| matches!(a, Action::Terminated)));
    }

    #[test]
    fn no_wire_bytes_tagged_with_terminated_branch() {
        // Once Terminated, on_timer must not emit further Retransmit/Send
        // actions for this branch (spec §8 invariant).
        let mut txn = Transaction::new_client(
            key(),
            TransactionKind::NonInviteClient,
            addr(),
            b"REGISTER ...".to_vec(),
            0,
            500,
            4000,
            5000,
        );
        let resp = Response {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: Headers::default(),
            body: Vec::new(),
        };
        txn.on_response(resp, 10);
        assert!(txn.is_terminated());
        let actions = txn.on_timer(10_000);
        assert!(actions.is_empty());
    }
}
