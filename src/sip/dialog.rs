//! Dialog model and store (component D, dialog half). RFC 3261 §12.
//!
//! A dialog is identified by `(Call-ID, local-tag, remote-tag)`; before the
//! remote tag is known (an early client dialog, between sending INVITE and
//! receiving a tagged response) it is looked up by `(Call-ID, local-tag)`
//! alone, per spec §4.3.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminating,
    Terminated,
}

/// Full key once both tags are known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

/// Opaque handle to a [`Dialog`] (spec §9 "opaque handles and ownership").
/// `call_id`/`local_tag` are a stable identity for the dialog's whole
/// lifetime — assigned once, before the remote tag is even known — so a
/// plain newtype over them serves as the handle without a separate
/// generational arena; fields stay crate-private so callers outside this
/// crate can copy and compare a handle but never construct or inspect one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogHandle {
    pub(crate) call_id: String,
    pub(crate) local_tag: String,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_cseq: u32,
    pub remote_cseq: Option<u32>,
    pub peer_uri: String,
    pub local_uri: String,
    pub contact_uri: String,
    /// Ordered Record-Route set, nearest proxy first.
    pub route_set: Vec<String>,
    pub state: DialogState,
    /// Weak reference to the media session bound to this dialog (spec §3:
    /// "associated session handle (weak)"), stored as the session's opaque
    /// handle rather than an owned value so the session's lifecycle stays
    /// independent until the dialog terminates.
    pub session: Option<crate::media::SessionHandle>,
    /// Whether a non-ACK client transaction is currently in flight for this
    /// dialog (spec §3 invariant: at most one at a time).
    pub client_transaction_in_flight: bool,
    /// The key of the in-flight client transaction (INVITE while Early, BYE
    /// while tearing down), if any — lets `hangup`/`cancel` find the right
    /// transaction to act on without a separate index.
    pub client_transaction_key: Option<super::transaction::TransactionKey>,
    /// The key of the server-side INVITE transaction answering this dialog's
    /// incoming call, if we are the UAS — `ringing`/`answer_call`/
    /// `reject_call` all act on this transaction.
    pub server_invite_transaction_key: Option<super::transaction::TransactionKey>,
}

impl Dialog {
    pub fn key(&self) -> DialogKey {
        DialogKey {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone(),
        }
    }

    pub fn handle(&self) -> DialogHandle {
        DialogHandle {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
        }
    }

    /// Advance the local CSeq, enforcing spec §3's strict-monotonic
    /// invariant.
    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Validate and record an inbound request's CSeq, rejecting anything
    /// that does not strictly increase (spec §3 invariant; out-of-order
    /// retransmits of the *same* CSeq are the transaction layer's concern,
    /// not a protocol violation here).
    pub fn observe_remote_cseq(&mut self, cseq: u32) -> Result<()> {
        if let Some(last) = self.remote_cseq {
            if cseq <= last {
                return Err(Error::SipProtocolViolation(format!(
                    "non-monotonic remote CSeq: {cseq} <= {last}"
                )));
            }
        }
        self.remote_cseq = Some(cseq);
        Ok(())
    }
}

/// Dialogs keyed by `(Call-ID, local-tag, remote-tag)`; early dialogs are
/// additionally reachable by `(Call-ID, local-tag)` alone until confirmed
/// (spec §4.3).
#[derive(Default)]
pub struct DialogStore {
    confirmed: HashMap<(String, String, String), Dialog>,
    early: HashMap<(String, String), Dialog>,
}

impl DialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_early(&mut self, dialog: Dialog) {
        debug_assert_eq!(dialog.state, DialogState::Early);
        let key = (dialog.call_id.clone(), dialog.local_tag.clone());
        self.early.insert(key, dialog);
    }

    /// Promote an early dialog to Confirmed once the remote tag is known.
    pub fn confirm(&mut self, call_id: &str, local_tag: &str, remote_tag: String) -> Option<&mut Dialog> {
        let mut dialog = self.early.remove(&(call_id.to_string(), local_tag.to_string()))?;
        dialog.remote_tag = Some(remote_tag.clone());
        dialog.state = DialogState::Confirmed;
        let key = (call_id.to_string(), local_tag.to_string(), remote_tag);
        self.confirmed.insert(key.clone(), dialog);
        self.confirmed.get_mut(&key)
    }

    pub fn find_early_mut(&mut self, call_id: &str, local_tag: &str) -> Option<&mut Dialog> {
        self.early.get_mut(&(call_id.to_string(), local_tag.to_string()))
    }

    pub fn find_confirmed_mut(
        &mut self,
        call_id: &str,
        local_tag: &str,
        remote_tag: &str,
    ) -> Option<&mut Dialog> {
        self.confirmed
            .get_mut(&(call_id.to_string(), local_tag.to_string(), remote_tag.to_string()))
    }

    /// Look up a dialog by Call-ID and either tag, regardless of
    /// confirmation state — used when routing an inbound request/response
    /// whose direction (and therefore which tag is "local") is not yet known
    /// to the caller.
    pub fn find_by_call_id_and_tags(
        &mut self,
        call_id: &str,
        tag_a: &str,
        tag_b: Option<&str>,
    ) -> Option<&mut Dialog> {
        if let Some(remote) = tag_b {
            if let Some(d) = self
                .confirmed
                .get_mut(&(call_id.to_string(), tag_a.to_string(), remote.to_string()))
            {
                return Some(d);
            }
            if let Some(d) = self
                .confirmed
                .get_mut(&(call_id.to_string(), remote.to_string(), tag_a.to_string()))
            {
                return Some(d);
            }
        }
        self.early.get_mut(&(call_id.to_string(), tag_a.to_string()))
    }

    pub fn remove_confirmed(&mut self, key: &(String, String, String)) -> Option<Dialog> {
        self.confirmed.remove(key)
    }

    /// Resolve an opaque [`DialogHandle`] regardless of confirmation state:
    /// checks the early map first (most calls resolve a handle right after
    /// creating it, before any 2xx), then scans the confirmed map for a
    /// matching `(call_id, local_tag)` pair. The scan is linear in the
    /// number of confirmed dialogs, which this crate's target scale (an
    /// embedded UA with a handful of concurrent calls) makes negligible.
    pub fn find_by_handle_mut(&mut self, handle: &DialogHandle) -> Option<&mut Dialog> {
        if self.early.contains_key(&(handle.call_id.clone(), handle.local_tag.clone())) {
            return self.early.get_mut(&(handle.call_id.clone(), handle.local_tag.clone()));
        }
        self.confirmed
            .values_mut()
            .find(|d| d.call_id == handle.call_id && d.local_tag == handle.local_tag)
    }

    /// Remove a dialog by handle from whichever map currently holds it,
    /// transitioning it to `Terminated` first (spec §3: `Terminated` is a
    /// real state in the Dialog lifecycle, not just "absent from the
    /// store") so a caller holding the returned `Dialog` observes the
    /// terminal state rather than whatever it was mid-teardown.
    pub fn remove_by_handle(&mut self, handle: &DialogHandle) -> Option<Dialog> {
        if let Some(mut d) = self.early.remove(&(handle.call_id.clone(), handle.local_tag.clone())) {
            d.state = DialogState::Terminated;
            return Some(d);
        }
        let key = self
            .confirmed
            .iter()
            .find(|(_, d)| d.call_id == handle.call_id && d.local_tag == handle.local_tag)
            .map(|(k, _)| k.clone())?;
        let mut d = self.confirmed.remove(&key)?;
        d.state = DialogState::Terminated;
        Some(d)
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.early.len()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Dialog> {
        self.confirmed.values_mut().chain(self.early.values_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dialog() -> Dialog {
        Dialog {
            call_id: "callid".to_string(),
            local_tag: "local1".to_string(),
            remote_tag: None,
            local_cseq: 1,
            remote_cseq: None,
            peer_uri: "sip:bob@example.com".to_string(),
            local_uri: "sip:alice@example.com".to_string(),
            contact_uri: "sip:alice@pc33.example.com".to_string(),
            route_set: Vec::new(),
            state: DialogState::Early,
            session: None,
            client_transaction_in_flight: true,
            client_transaction_key: None,
            server_invite_transaction_key: None,
        }
    }

    #[test]
    fn early_dialog_confirms_and_becomes_lookupable_by_full_key() {
        let mut store = DialogStore::new();
        store.insert_early(sample_dialog());
        assert!(store.find_early_mut("callid", "local1").is_some());

        let confirmed = store.confirm("callid", "local1", "remote1".to_string()).unwrap();
        assert_eq!(confirmed.state, DialogState::Confirmed);
        assert!(store.find_early_mut("callid", "local1").is_none());
        assert!(store.find_confirmed_mut("callid", "local1", "remote1").is_some());
    }

    #[test]
    fn cseq_must_strictly_increase() {
        let mut dialog = sample_dialog();
        dialog.observe_remote_cseq(1).unwrap();
        dialog.observe_remote_cseq(2).unwrap();
        let err = dialog.observe_remote_cseq(2).unwrap_err();
        assert!(matches!(err, Error::SipProtocolViolation(_)));
    }
}
