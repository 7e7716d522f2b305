//! The SIP agent (component S): synchronous call-control logic over the
//! transaction/dialog layer (spec §4.4).
//!
//! Grounded on `sip-client/src/simple.rs`'s call-control surface
//! (register/make_call/answer/hangup/cancel naming and sequencing) and
//! `dialog-core`'s transaction-to-dialog wiring, restructured so every
//! operation is a synchronous method returning a [`SipAction`] list instead
//! of a spawned task — this module never touches a socket or a timer
//! directly; `crate::agent::Agent` (component G) carries the actions out.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};

use rand::RngCore;
use tracing::{debug, warn};

use crate::auth::{self, AuthEngine};
use crate::config::AgentConfig;
use crate::error::{Error, Result};

use super::codec::{DefaultSipCodec, SipCodec};
use super::dialog::{Dialog, DialogHandle, DialogState, DialogStore};
use super::message::{CSeq, Header, Headers, Message, Method, NamedUri, Request, Response, ViaHeader};
use super::transaction::{Action, Transaction, TransactionKey, TransactionKind, TransactionState, TransactionStore};

/// Registration lifecycle (spec §3 "Registration" data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    None,
    Registering,
    Registered,
    Unregistering,
    Unregistered,
    Failed,
}

/// Call-control state surfaced through `on_call_state` (spec §8 scenarios
/// name these exact states: Ringing, Hangup, Failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// INVITE sent, no response yet.
    Initiating,
    /// A 1xx (other than Trying) was received for an outgoing call, or a
    /// provisional response was sent for an incoming one.
    Ringing,
    /// A 2xx final response was exchanged and the ACK sent/received.
    Connected,
    /// The dialog ended by a BYE exchanged in either direction.
    Hangup,
    /// The call ended due to a `CANCEL`.
    Cancelled,
    /// A non-2xx final response ended the call, or the transaction timed
    /// out without a final response (`code` is 0 for the latter).
    Failed { code: u16 },
}

/// Everything `crate::agent::Agent` translates into a user-facing callback
/// (spec §6 "Event outputs surfaced to callers").
#[derive(Debug, Clone)]
pub enum AgentEvent {
    RegistrationStateChanged { state: RegistrationState, code: u16 },
    CallStateChanged { dialog: DialogHandle, state: CallState },
    IncomingCall { dialog: DialogHandle, from: String, to: String, remote_sdp: Option<String> },
    /// A 2xx response to an outgoing INVITE carried an SDP body. There is no
    /// public `on_*` callback for this (spec §4.4's "remote-SDP-available"
    /// is an internal signal for incoming calls it folds into
    /// `IncomingCall::remote_sdp`); `crate::agent::Agent` consumes this
    /// purely to drive the media coordinator for the offerer side.
    RemoteSdpAvailable { dialog: DialogHandle, sdp: String },
    IncomingMessage { from: String, to: String, content: String },
    Error { error: Error },
}

/// What fires a scheduled timer back into this module (spec §4.7's timer
/// wheel is generic over a callback; this is the payload the facade closes
/// over so `Agent::loop_once` can route a firing back to the right method).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Re-check a transaction's retransmit/timeout/drain schedule.
    TransactionCheck(TransactionKey),
    /// Registration's granted expiry is half elapsed; refresh it.
    RegistrationRefresh,
}

/// A side effect for `Agent::loop_once` to carry out, the SIP-agent-level
/// analogue of [`super::transaction::Action`].
#[derive(Debug, Clone)]
pub enum SipAction {
    Send { bytes: Vec<u8>, to: SocketAddr },
    ScheduleTimer { delay_ms: u64, kind: TimerKind },
    Event(AgentEvent),
}

/// Registration bookkeeping: the REGISTER dialog never confirms (no 2xx
/// `To` tag is required by RFC 3261 §10 to be treated as dialog-forming),
/// so this is tracked separately from [`DialogStore`].
struct RegistrationInfo {
    state: RegistrationState,
    call_id: String,
    local_tag: String,
    cseq: u32,
}

impl Default for RegistrationInfo {
    fn default() -> Self {
        RegistrationInfo {
            state: RegistrationState::None,
            call_id: String::new(),
            local_tag: String::new(),
            cseq: 0,
        }
    }
}

pub struct SipAgent {
    identity_uri: String,
    server_uri: String,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    contact_uri: String,
    expires_requested: u32,
    username: String,
    password: String,
    t1_ms: u64,
    t2_ms: u64,
    t4_ms: u64,
    codec: DefaultSipCodec,
    transactions: TransactionStore,
    dialogs: DialogStore,
    auth: AuthEngine,
    registration: RegistrationInfo,
    /// One outstanding incoming call at a time (SPEC_FULL.md §11 decision
    /// 1): a second inbound INVITE while this is set is auto-rejected with
    /// 486 Busy Here.
    pending_incoming: Option<DialogHandle>,
    /// `(Call-ID, CSeq)` pairs that already consumed their one permitted
    /// auth retry (spec §4.2/§8 "maximum one auth retry per original
    /// request").
    auth_retried: HashSet<(String, u32)>,
}

impl SipAgent {
    pub fn new(config: &AgentConfig, local_addr: SocketAddr) -> Result<SipAgent> {
        let server_addr = (config.server_host.as_str(), config.server_port)
            .to_socket_addrs()
            .map_err(|e| Error::TransportInit(format!("could not resolve {}: {e}", config.server_host)))?
            .next()
            .ok_or_else(|| Error::TransportInit(format!("no address for {}", config.server_host)))?;

        let identity_uri = format!("sip:{}@{}", config.identity.username, config.server_host);
        let server_uri = format!("sip:{}", config.server_host);
        let contact_uri = format!(
            "sip:{}@{}:{}",
            config.identity.username,
            local_addr.ip(),
            local_addr.port()
        );

        Ok(SipAgent {
            identity_uri,
            server_uri,
            server_addr,
            local_addr,
            contact_uri,
            expires_requested: config.expires,
            username: config.identity.username.clone(),
            password: config.identity.password.clone(),
            t1_ms: config.t1_ms,
            t2_ms: config.t2_ms,
            t4_ms: config.t4_ms,
            codec: DefaultSipCodec,
            transactions: TransactionStore::new(),
            dialogs: DialogStore::new(),
            auth: AuthEngine::new(),
            registration: RegistrationInfo::default(),
            pending_incoming: None,
            auth_retried: HashSet::new(),
        })
    }

    pub fn identity_uri(&self) -> &str {
        &self.identity_uri
    }

    pub fn contact_uri(&self) -> &str {
        &self.contact_uri
    }

    pub fn dialog_peer_uri(&mut self, handle: &DialogHandle) -> Option<String> {
        self.dialogs.find_by_handle_mut(handle).map(|d| d.peer_uri.clone())
    }

    /// Every dialog currently tracked, early or confirmed (used by
    /// `Agent::stop` to transition all of them to Terminated — spec §5
    /// "Cancellation").
    pub fn dialog_handles(&mut self) -> Vec<DialogHandle> {
        self.dialogs.all_mut().map(|d| d.handle()).collect()
    }

    /// The current state of a tracked dialog, used by `crate::agent::Agent`
    /// to pick between BYE and CANCEL in its unified `hangup` (spec §4.4:
    /// "if Confirmed send BYE ...; if Early ... send CANCEL").
    pub fn dialog_state(&mut self, handle: &DialogHandle) -> Option<DialogState> {
        self.dialogs.find_by_handle_mut(handle).map(|d| d.state)
    }

    // ---- registration -----------------------------------------------

    pub fn register(&mut self, now_ms: u64) -> Vec<SipAction> {
        self.registration = RegistrationInfo {
            state: RegistrationState::Registering,
            call_id: new_call_id(),
            local_tag: new_tag(),
            cseq: 1,
        };
        let branch = new_branch();
        let call_id = self.registration.call_id.clone();
        let local_tag = self.registration.local_tag.clone();
        let request = self.build_register_request(&call_id, &local_tag, 1, &branch, self.expires_requested, None);
        self.send_client_request(
            Method::Register,
            TransactionKind::NonInviteClient,
            branch,
            request,
            Some(call_id),
            Some(local_tag),
            self.server_addr,
            now_ms,
        )
    }

    pub fn unregister(&mut self, now_ms: u64) -> Vec<SipAction> {
        if matches!(self.registration.state, RegistrationState::None | RegistrationState::Unregistered) {
            return Vec::new();
        }
        self.registration.state = RegistrationState::Unregistering;
        self.registration.cseq += 1;
        let branch = new_branch();
        let call_id = self.registration.call_id.clone();
        let local_tag = self.registration.local_tag.clone();
        let cseq = self.registration.cseq;
        let request = self.build_register_request(&call_id, &local_tag, cseq, &branch, 0, None);
        self.send_client_request(
            Method::Register,
            TransactionKind::NonInviteClient,
            branch,
            request,
            Some(call_id),
            Some(local_tag),
            self.server_addr,
            now_ms,
        )
    }

    /// Re-send REGISTER at the refresh timer fired by `RegistrationRefresh`.
    pub fn refresh_registration(&mut self, now_ms: u64) -> Vec<SipAction> {
        if self.registration.state != RegistrationState::Registered {
            return Vec::new();
        }
        self.registration.cseq += 1;
        let branch = new_branch();
        let call_id = self.registration.call_id.clone();
        let local_tag = self.registration.local_tag.clone();
        let cseq = self.registration.cseq;
        let request = self.build_register_request(&call_id, &local_tag, cseq, &branch, self.expires_requested, None);
        self.send_client_request(
            Method::Register,
            TransactionKind::NonInviteClient,
            branch,
            request,
            Some(call_id),
            Some(local_tag),
            self.server_addr,
            now_ms,
        )
    }

    fn build_register_request(
        &self,
        call_id: &str,
        local_tag: &str,
        cseq: u32,
        branch: &str,
        expires: u32,
        authorization: Option<String>,
    ) -> Request {
        let mut headers = Headers {
            via: vec![self.via(branch)],
            from: Some(NamedUri::new(self.identity_uri.clone()).with_tag(local_tag)),
            to: Some(NamedUri::new(self.identity_uri.clone())),
            call_id: Some(call_id.to_string()),
            cseq: Some(CSeq { seq: cseq, method: Method::Register }),
            contact: Some(self.contact_uri.clone()),
            expires: Some(expires),
            authorization,
            ..Default::default()
        };
        headers.extra.push(Header::new("Max-Forwards", "70"));
        Request {
            method: Method::Register,
            request_uri: self.server_uri.clone(),
            headers,
            body: Vec::new(),
        }
    }

    // ---- outgoing calls -----------------------------------------------

    /// Allocate a dialog for an outgoing call. The INVITE itself is not
    /// sent until [`SipAgent::send_invite`] is called once the offer SDP is
    /// ready (spec §8 scenario 2: `sdp_ready` precedes the INVITE on the
    /// wire).
    pub fn make_call(&mut self, peer_uri: &str) -> DialogHandle {
        let dialog = Dialog {
            call_id: new_call_id(),
            local_tag: new_tag(),
            remote_tag: None,
            local_cseq: 0,
            remote_cseq: None,
            peer_uri: peer_uri.to_string(),
            local_uri: self.identity_uri.clone(),
            contact_uri: self.contact_uri.clone(),
            route_set: Vec::new(),
            state: DialogState::Early,
            session: None,
            client_transaction_in_flight: false,
            client_transaction_key: None,
            server_invite_transaction_key: None,
        };
        let handle = dialog.handle();
        self.dialogs.insert_early(dialog);
        handle
    }

    pub fn set_dialog_session(&mut self, handle: &DialogHandle, session: crate::media::SessionHandle) {
        if let Some(dialog) = self.dialogs.find_by_handle_mut(handle) {
            dialog.session = Some(session);
        }
    }

    pub fn dialog_session(&mut self, handle: &DialogHandle) -> Option<crate::media::SessionHandle> {
        self.dialogs.find_by_handle_mut(handle).and_then(|d| d.session)
    }

    /// Send the INVITE for `handle` once its offer SDP is ready.
    pub fn send_invite(&mut self, handle: &DialogHandle, sdp: String, now_ms: u64) -> Result<Vec<SipAction>> {
        let branch = new_branch();
        let (request, call_id, local_tag) = {
            let Some(dialog) = self.dialogs.find_by_handle_mut(handle) else {
                return Err(Error::InvalidState("no such dialog".into()));
            };
            if dialog.client_transaction_in_flight {
                return Err(Error::InvalidState("a client transaction is already in flight".into()));
            }
            let cseq = dialog.next_local_cseq();
            let mut headers = Headers {
                via: vec![self.via(&branch)],
                from: Some(NamedUri::new(dialog.local_uri.clone()).with_tag(&dialog.local_tag)),
                to: Some(NamedUri::new(dialog.peer_uri.clone())),
                call_id: Some(dialog.call_id.clone()),
                cseq: Some(CSeq { seq: cseq, method: Method::Invite }),
                contact: Some(dialog.contact_uri.clone()),
                content_type: Some("application/sdp".to_string()),
                ..Default::default()
            };
            headers.extra.push(Header::new("Max-Forwards", "70"));
            let request = Request {
                method: Method::Invite,
                request_uri: dialog.peer_uri.clone(),
                headers,
                body: sdp.into_bytes(),
            };
            dialog.client_transaction_in_flight = true;
            (request, dialog.call_id.clone(), dialog.local_tag.clone())
        };

        let actions = self.send_client_request(
            Method::Invite,
            TransactionKind::InviteClient,
            branch.clone(),
            request,
            Some(call_id.clone()),
            Some(local_tag.clone()),
            self.server_addr,
            now_ms,
        );
        if let Some(dialog) = self.dialogs.find_by_handle_mut(handle) {
            dialog.client_transaction_key = Some(TransactionKey { branch, method: Method::Invite, is_server: false });
        }
        Ok(actions)
    }

    pub fn hangup(&mut self, handle: &DialogHandle, now_ms: u64) -> Result<Vec<SipAction>> {
        let (request, branch, call_id, local_tag) = {
            let Some(dialog) = self.dialogs.find_by_handle_mut(handle) else {
                return Err(Error::InvalidState("no such dialog".into()));
            };
            if dialog.state != DialogState::Confirmed {
                return Err(Error::InvalidState(format!("hangup requires Confirmed, was {:?}", dialog.state)));
            }
            if dialog.client_transaction_in_flight {
                return Err(Error::InvalidState("a client transaction is already in flight".into()));
            }
            let branch = new_branch();
            let cseq = dialog.next_local_cseq();
            let mut headers = Headers {
                via: vec![self.via(&branch)],
                from: Some(NamedUri::new(dialog.local_uri.clone()).with_tag(&dialog.local_tag)),
                to: Some(NamedUri::new(dialog.peer_uri.clone()).with_tag(dialog.remote_tag.clone().unwrap_or_default())),
                call_id: Some(dialog.call_id.clone()),
                cseq: Some(CSeq { seq: cseq, method: Method::Bye }),
                ..Default::default()
            };
            headers.extra.push(Header::new("Max-Forwards", "70"));
            let request = Request { method: Method::Bye, request_uri: dialog.peer_uri.clone(), headers, body: Vec::new() };
            dialog.client_transaction_in_flight = true;
            dialog.state = DialogState::Terminating;
            (request, branch, dialog.call_id.clone(), dialog.local_tag.clone())
        };
        let actions = self.send_client_request(
            Method::Bye,
            TransactionKind::NonInviteClient,
            branch.clone(),
            request,
            Some(call_id),
            Some(local_tag),
            self.server_addr,
            now_ms,
        );
        if let Some(dialog) = self.dialogs.find_by_handle_mut(handle) {
            dialog.client_transaction_key = Some(TransactionKey { branch, method: Method::Bye, is_server: false });
        }
        Ok(actions)
    }

    /// Cancel an outgoing INVITE before a final response arrives (spec §8
    /// scenario 5).
    pub fn cancel(&mut self, handle: &DialogHandle, now_ms: u64) -> Result<Vec<SipAction>> {
        let Some(dialog) = self.dialogs.find_by_handle_mut(handle) else {
            return Err(Error::InvalidState("no such dialog".into()));
        };
        if dialog.state != DialogState::Early {
            return Err(Error::InvalidState("cancel requires an early (unanswered) dialog".into()));
        }
        let Some(invite_key) = dialog.client_transaction_key.clone() else {
            return Err(Error::InvalidState("no INVITE transaction to cancel".into()));
        };
        let Some(invite_txn) = self.transactions.find(&invite_key) else {
            return Err(Error::InvalidState("INVITE transaction already gone".into()));
        };
        if invite_txn.state != TransactionState::Proceeding && invite_txn.state != TransactionState::Calling {
            return Err(Error::InvalidState("CANCEL is only valid before a final response".into()));
        }

        let cseq = dialog.local_cseq;
        let mut headers = Headers {
            via: vec![self.via(&invite_key.branch)],
            from: Some(NamedUri::new(dialog.local_uri.clone()).with_tag(&dialog.local_tag)),
            to: Some(NamedUri::new(dialog.peer_uri.clone())),
            call_id: Some(dialog.call_id.clone()),
            cseq: Some(CSeq { seq: cseq, method: Method::Cancel }),
            ..Default::default()
        };
        headers.extra.push(Header::new("Max-Forwards", "70"));
        let request = Request { method: Method::Cancel, request_uri: dialog.peer_uri.clone(), headers, body: Vec::new() };
        let call_id = dialog.call_id.clone();
        let local_tag = dialog.local_tag.clone();
        dialog.state = DialogState::Terminating;

        Ok(self.send_client_request(
            Method::Cancel,
            TransactionKind::NonInviteClient,
            invite_key.branch,
            request,
            Some(call_id),
            Some(local_tag),
            self.server_addr,
            now_ms,
        ))
    }

    pub fn send_message(&mut self, peer_uri: &str, content: &str, now_ms: u64) -> Vec<SipAction> {
        let branch = new_branch();
        let call_id = new_call_id();
        let local_tag = new_tag();
        let mut headers = Headers {
            via: vec![self.via(&branch)],
            from: Some(NamedUri::new(self.identity_uri.clone()).with_tag(&local_tag)),
            to: Some(NamedUri::new(peer_uri)),
            call_id: Some(call_id.clone()),
            cseq: Some(CSeq { seq: 1, method: Method::Message }),
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        headers.extra.push(Header::new("Max-Forwards", "70"));
        let request = Request {
            method: Method::Message,
            request_uri: peer_uri.to_string(),
            headers,
            body: content.as_bytes().to_vec(),
        };
        self.send_client_request(
            Method::Message,
            TransactionKind::NonInviteClient,
            branch,
            request,
            Some(call_id),
            Some(local_tag),
            self.server_addr,
            now_ms,
        )
    }

    // ---- incoming calls -------------------------------------------------

    pub fn ringing(&mut self, handle: &DialogHandle, now_ms: u64) -> Result<Vec<SipAction>> {
        self.send_uas_response(handle, 180, "Ringing", Vec::new(), None, now_ms)
    }

    pub fn answer_call(&mut self, handle: &DialogHandle, sdp_answer: String, now_ms: u64) -> Result<Vec<SipAction>> {
        let mut actions = self.send_uas_response(handle, 200, "OK", sdp_answer.into_bytes(), Some("application/sdp".to_string()), now_ms)?;
        if let Some(dialog) = self.dialogs.find_early_mut(&handle.call_id, &handle.local_tag) {
            let remote_tag = dialog.remote_tag.clone().unwrap_or_default();
            self.dialogs.confirm(&handle.call_id, &handle.local_tag, remote_tag);
            actions.push(SipAction::Event(AgentEvent::CallStateChanged {
                dialog: handle.clone(),
                state: CallState::Connected,
            }));
        }
        Ok(actions)
    }

    pub fn reject_call(&mut self, handle: &DialogHandle, code: u16, now_ms: u64) -> Result<Vec<SipAction>> {
        if !(300..700).contains(&code) {
            return Err(Error::InvalidState(format!("{code} is not a final non-2xx status code")));
        }
        let mut actions = self.send_uas_response(handle, code, reason_for(code), Vec::new(), None, now_ms)?;
        if self.pending_incoming.as_ref() == Some(handle) {
            self.pending_incoming = None;
        }
        self.dialogs.remove_by_handle(handle);
        actions.push(SipAction::Event(AgentEvent::CallStateChanged {
            dialog: handle.clone(),
            state: CallState::Failed { code },
        }));
        Ok(actions)
    }

    fn send_uas_response(
        &mut self,
        handle: &DialogHandle,
        status_code: u16,
        reason: &str,
        body: Vec<u8>,
        content_type: Option<String>,
        now_ms: u64,
    ) -> Result<Vec<SipAction>> {
        let Some(dialog) = self.dialogs.find_early_mut(&handle.call_id, &handle.local_tag) else {
            return Err(Error::InvalidState("no such incoming dialog".into()));
        };
        let Some(key) = dialog.server_invite_transaction_key.clone() else {
            return Err(Error::InvalidState("no server INVITE transaction for this dialog".into()));
        };
        let mut headers = Headers {
            from: Some(NamedUri::new(dialog.peer_uri.clone()).with_tag(dialog.remote_tag.clone().unwrap_or_default())),
            to: Some(NamedUri::new(dialog.local_uri.clone()).with_tag(&dialog.local_tag)),
            call_id: Some(dialog.call_id.clone()),
            cseq: Some(CSeq { seq: dialog.remote_cseq.unwrap_or(0), method: Method::Invite }),
            contact: Some(dialog.contact_uri.clone()),
            content_type,
            ..Default::default()
        };
        headers.via = dialog.route_set.iter().map(|_| self.via("reused")).collect();
        let response = Response { status_code, reason_phrase: reason.to_string(), headers, body };
        let bytes = self.codec.encode(&Message::Response(response.clone()));

        let Some(txn) = self.transactions.find_mut(&key) else {
            return Err(Error::InvalidState("server INVITE transaction already gone".into()));
        };
        let txn_actions = txn.send_server_response(&response, bytes, now_ms);
        Ok(self.translate_txn_actions(&key, txn_actions, now_ms))
    }

    // ---- inbound message dispatch ---------------------------------------

    /// Parse and dispatch one inbound SIP frame.
    pub fn on_frame(&mut self, bytes: &[u8], from: SocketAddr, now_ms: u64) -> Vec<SipAction> {
        let message = match self.codec.parse(bytes) {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "dropping unparsable SIP frame");
                return vec![SipAction::Event(AgentEvent::Error { error: err })];
            }
        };
        match message {
            Message::Request(req) => self.handle_request(req, from, now_ms),
            Message::Response(resp) => self.handle_response(resp, now_ms),
        }
    }

    fn handle_response(&mut self, resp: Response, now_ms: u64) -> Vec<SipAction> {
        let Some(via) = resp.headers.via.first() else {
            debug!("response missing Via; dropping");
            return Vec::new();
        };
        let method = resp.headers.cseq.map(|c| c.method).unwrap_or(Method::Other);
        let key = TransactionKey { branch: via.branch.clone(), method, is_server: false };
        let Some(txn) = self.transactions.find_mut(&key) else {
            debug!(branch = %key.branch, "response for unknown transaction; dropping");
            return Vec::new();
        };
        let txn_actions = txn.on_response(resp, now_ms);
        self.translate_txn_actions(&key, txn_actions, now_ms)
    }

    fn translate_txn_actions(&mut self, key: &TransactionKey, actions: Vec<Action>, now_ms: u64) -> Vec<SipAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                Action::Retransmit => {
                    if let Some(txn) = self.transactions.find(key) {
                        out.push(SipAction::Send { bytes: txn.sent_bytes().to_vec(), to: txn.destination });
                    }
                }
                Action::ScheduleTimer { delay_ms } => {
                    out.push(SipAction::ScheduleTimer { delay_ms, kind: TimerKind::TransactionCheck(key.clone()) });
                }
                Action::Send { bytes, to } => out.push(SipAction::Send { bytes, to }),
                Action::NotifyResponse(resp) => out.extend(self.route_response(key, resp, now_ms)),
                Action::NotifyTimeout => out.extend(self.route_timeout(key, now_ms)),
                Action::Terminated => {}
            }
        }
        out
    }

    fn route_response(&mut self, key: &TransactionKey, resp: Response, now_ms: u64) -> Vec<SipAction> {
        match key.method {
            Method::Register => self.handle_register_response(resp, now_ms),
            Method::Invite => self.handle_invite_response(key, resp, now_ms),
            Method::Bye => self.handle_bye_response(resp, now_ms),
            Method::Cancel => Vec::new(),
            Method::Message => self.handle_message_response(resp),
            _ => Vec::new(),
        }
    }

    fn handle_register_response(&mut self, resp: Response, now_ms: u64) -> Vec<SipAction> {
        if resp.is_auth_challenge() {
            return self.retry_register_with_auth(resp, now_ms);
        }
        if resp.is_success() {
            let expires = resp.headers.expires.unwrap_or(self.expires_requested);
            if expires == 0 {
                self.registration.state = RegistrationState::Unregistered;
                return vec![SipAction::Event(AgentEvent::RegistrationStateChanged {
                    state: RegistrationState::Unregistered,
                    code: resp.status_code,
                })];
            }
            self.registration.state = RegistrationState::Registered;
            let refresh_ms = (u64::from(expires) * 1000) / 2;
            vec![
                SipAction::Event(AgentEvent::RegistrationStateChanged { state: RegistrationState::Registered, code: resp.status_code }),
                SipAction::ScheduleTimer { delay_ms: refresh_ms, kind: TimerKind::RegistrationRefresh },
            ]
        } else {
            self.registration.state = RegistrationState::Failed;
            vec![SipAction::Event(AgentEvent::RegistrationStateChanged { state: RegistrationState::Failed, code: resp.status_code })]
        }
    }

    fn retry_register_with_auth(&mut self, resp: Response, now_ms: u64) -> Vec<SipAction> {
        let call_id = self.registration.call_id.clone();
        let cseq = self.registration.cseq;
        let uri = self.server_uri.clone();
        match self.authorize_retry(&call_id, cseq, Method::Register, &uri, b"", &resp) {
            Ok(digest) => {
                self.registration.cseq += 1;
                let branch = new_branch();
                let local_tag = self.registration.local_tag.clone();
                let new_cseq = self.registration.cseq;
                let request =
                    self.build_register_request(&call_id, &local_tag, new_cseq, &branch, self.expires_requested, Some(digest.header_value));
                self.send_client_request(
                    Method::Register,
                    TransactionKind::NonInviteClient,
                    branch,
                    request,
                    Some(call_id),
                    Some(local_tag),
                    self.server_addr,
                    now_ms,
                )
            }
            Err(err) => {
                self.registration.state = RegistrationState::Failed;
                vec![
                    SipAction::Event(AgentEvent::Error { error: err }),
                    SipAction::Event(AgentEvent::RegistrationStateChanged { state: RegistrationState::Failed, code: resp.status_code }),
                ]
            }
        }
    }

    /// Authorize a retried request against a 401/407, enforcing spec
    /// §4.2/§8's "at most one retry per original request" rule via
    /// `auth_retried`.
    fn authorize_retry(
        &mut self,
        call_id: &str,
        cseq: u32,
        method: Method,
        uri: &str,
        body: &[u8],
        resp: &Response,
    ) -> Result<auth::DigestResponse> {
        if !self.auth_retried.insert((call_id.to_string(), cseq)) {
            return Err(Error::AuthReject(format!("second challenge for {method} {call_id}")));
        }
        let header_value = resp
            .headers
            .www_authenticate
            .clone()
            .or_else(|| resp.headers.proxy_authenticate.clone())
            .ok_or_else(|| Error::AuthReject("challenge missing WWW-Authenticate/Proxy-Authenticate".into()))?;
        let challenge = auth::parse_challenge(&header_value)?;
        self.auth.authorize(&self.username, &self.password, &challenge, method.as_str(), uri, body)
    }

    fn handle_invite_response(&mut self, key: &TransactionKey, resp: Response, now_ms: u64) -> Vec<SipAction> {
        let call_id = resp.headers.call_id.clone().unwrap_or_default();
        let local_tag = resp.headers.from.as_ref().and_then(|f| f.tag.clone()).unwrap_or_default();
        let remote_tag = resp.headers.to.as_ref().and_then(|t| t.tag.clone());

        if resp.is_provisional() {
            if let Some(dialog) = self.dialogs.find_early_mut(&call_id, &local_tag) {
                if dialog.remote_tag.is_none() {
                    dialog.remote_tag = remote_tag;
                }
                if resp.status_code > 100 {
                    let handle = dialog.handle();
                    return vec![SipAction::Event(AgentEvent::CallStateChanged { dialog: handle, state: CallState::Ringing })];
                }
            }
            return Vec::new();
        }

        if resp.is_success() {
            let Some(remote_tag) = remote_tag else {
                warn!("2xx response to INVITE missing To tag; cannot confirm dialog");
                return Vec::new();
            };
            let ack_branch = new_branch();
            let mut ack = self.ack_headers(&call_id, &local_tag, &remote_tag, &ack_branch, resp.headers.cseq.map(|c| c.seq).unwrap_or(1));
            ack.contact = None;
            let ack_request = Request { method: Method::Ack, request_uri: String::new(), headers: ack, body: Vec::new() };
            let mut actions = Vec::new();
            if let Some(dialog) = self.dialogs.confirm(&call_id, &local_tag, remote_tag) {
                dialog.client_transaction_in_flight = false;
                let handle = dialog.handle();
                let mut ack_request = ack_request;
                ack_request.request_uri = dialog.peer_uri.clone();
                let bytes = self.codec.encode(&Message::Request(ack_request));
                actions.push(SipAction::Send { bytes, to: self.server_addr });
                if !resp.body.is_empty() {
                    if let Ok(sdp) = String::from_utf8(resp.body.clone()) {
                        actions.push(SipAction::Event(AgentEvent::RemoteSdpAvailable { dialog: handle.clone(), sdp }));
                    }
                }
                actions.push(SipAction::Event(AgentEvent::CallStateChanged { dialog: handle, state: CallState::Connected }));
            }
            return actions;
        }

        // Final non-2xx: ACK it, reusing the INVITE branch (RFC 3261 §17.1.1.3).
        let mut actions = Vec::new();
        let mut ack = self.ack_headers(&call_id, &local_tag, &remote_tag.clone().unwrap_or_default(), &key.branch, resp.headers.cseq.map(|c| c.seq).unwrap_or(1));
        ack.contact = None;
        let request_uri = self
            .dialogs
            .find_early_mut(&call_id, &local_tag)
            .map(|d| d.peer_uri.clone())
            .unwrap_or_default();
        let ack_request = Request { method: Method::Ack, request_uri, headers: ack, body: Vec::new() };
        let bytes = self.codec.encode(&Message::Request(ack_request));
        actions.push(SipAction::Send { bytes, to: self.server_addr });

        let handle = DialogHandle { call_id: call_id.clone(), local_tag: local_tag.clone() };
        self.dialogs.remove_by_handle(&handle);
        let state = if resp.status_code == 487 { CallState::Cancelled } else { CallState::Failed { code: resp.status_code } };
        actions.push(SipAction::Event(AgentEvent::CallStateChanged { dialog: handle, state }));
        actions
    }

    fn ack_headers(&self, call_id: &str, local_tag: &str, remote_tag: &str, branch: &str, cseq: u32) -> Headers {
        let mut headers = Headers {
            via: vec![self.via(branch)],
            from: Some(NamedUri::new(self.identity_uri.clone()).with_tag(local_tag)),
            to: Some(NamedUri::new(self.identity_uri.clone()).with_tag(remote_tag)),
            call_id: Some(call_id.to_string()),
            cseq: Some(CSeq { seq: cseq, method: Method::Ack }),
            contact: Some(self.contact_uri.clone()),
            ..Default::default()
        };
        headers.extra.push(Header::new("Max-Forwards", "70"));
        headers
    }

    fn handle_bye_response(&mut self, resp: Response, _now_ms: u64) -> Vec<SipAction> {
        let call_id = resp.headers.call_id.clone().unwrap_or_default();
        let local_tag = resp.headers.from.as_ref().and_then(|f| f.tag.clone()).unwrap_or_default();
        let remote_tag = resp.headers.to.as_ref().and_then(|t| t.tag.clone());
        let handle = DialogHandle { call_id: call_id.clone(), local_tag: local_tag.clone() };

        if let Some((rt, dialog)) = remote_tag.clone().and_then(|rt| {
            self.dialogs.find_confirmed_mut(&call_id, &local_tag, &rt).map(|d| (rt, d))
        }) {
            let _ = rt;
            dialog.client_transaction_in_flight = false;
        }
        self.dialogs.remove_by_handle(&handle);
        vec![SipAction::Event(AgentEvent::CallStateChanged { dialog: handle, state: CallState::Hangup })]
    }

    fn handle_message_response(&mut self, resp: Response) -> Vec<SipAction> {
        if !resp.is_success() {
            warn!(code = resp.status_code, "MESSAGE rejected by peer");
            return vec![SipAction::Event(AgentEvent::Error {
                error: Error::CallFailed { code: resp.status_code, reason: resp.reason_phrase },
            })];
        }
        Vec::new()
    }

    fn route_timeout(&mut self, key: &TransactionKey, _now_ms: u64) -> Vec<SipAction> {
        let Some(txn) = self.transactions.find(key) else { return Vec::new() };
        let dialog_call_id = txn.dialog_call_id.clone();
        let dialog_local_tag = txn.dialog_local_tag.clone();

        if key.method == Method::Register {
            self.registration.state = RegistrationState::Failed;
            return vec![
                SipAction::Event(AgentEvent::Error { error: Error::Timeout }),
                SipAction::Event(AgentEvent::RegistrationStateChanged { state: RegistrationState::Failed, code: 0 }),
            ];
        }

        let (Some(call_id), Some(local_tag)) = (dialog_call_id, dialog_local_tag) else {
            return vec![SipAction::Event(AgentEvent::Error { error: Error::Timeout })];
        };
        let handle = DialogHandle { call_id, local_tag };
        self.dialogs.remove_by_handle(&handle);
        vec![
            SipAction::Event(AgentEvent::Error { error: Error::Timeout }),
            SipAction::Event(AgentEvent::CallStateChanged { dialog: handle, state: CallState::Failed { code: 0 } }),
        ]
    }

    fn handle_request(&mut self, req: Request, from: SocketAddr, now_ms: u64) -> Vec<SipAction> {
        match req.method {
            Method::Invite => self.handle_incoming_invite(req, from, now_ms),
            Method::Ack => self.handle_incoming_ack(req, now_ms),
            Method::Bye => self.handle_incoming_bye(req, from, now_ms),
            Method::Cancel => self.handle_incoming_cancel(req, from, now_ms),
            Method::Message => self.handle_incoming_message(req, from, now_ms),
            _ => Vec::new(),
        }
    }

    fn handle_incoming_invite(&mut self, req: Request, from: SocketAddr, now_ms: u64) -> Vec<SipAction> {
        let Some(via) = req.headers.via.first().cloned() else { return Vec::new() };
        let call_id = req.headers.call_id.clone().unwrap_or_default();
        let remote_tag = req.headers.from.as_ref().and_then(|f| f.tag.clone()).unwrap_or_default();
        let peer_uri = req.headers.from.as_ref().map(|f| f.uri.clone()).unwrap_or_default();
        let to_uri = req.headers.to.as_ref().map(|t| t.uri.clone()).unwrap_or_default();
        let cseq = req.headers.cseq.map(|c| c.seq).unwrap_or(1);

        let key = TransactionKey { branch: via.branch.clone(), method: Method::Invite, is_server: true };
        let mut txn = Transaction::new_server(key.clone(), TransactionKind::InviteServer, from, now_ms, self.t1_ms, self.t2_ms, self.t4_ms);
        txn.dialog_call_id = Some(call_id.clone());

        if self.pending_incoming.is_some() {
            txn.dialog_local_tag = None;
            let response = Response {
                status_code: 486,
                reason_phrase: "Busy Here".to_string(),
                headers: Headers { call_id: Some(call_id), cseq: req.headers.cseq, ..Default::default() },
                body: Vec::new(),
            };
            let bytes = self.codec.encode(&Message::Response(response.clone()));
            let actions = txn.send_server_response(&response, bytes, now_ms);
            self.transactions.insert(txn);
            return self.translate_txn_actions(&key, actions, now_ms);
        }

        let local_tag = new_tag();
        txn.dialog_local_tag = Some(local_tag.clone());
        let dialog = Dialog {
            call_id: call_id.clone(),
            local_tag: local_tag.clone(),
            remote_tag: Some(remote_tag.clone()),
            local_cseq: 0,
            remote_cseq: Some(cseq),
            peer_uri: peer_uri.clone(),
            local_uri: to_uri.clone(),
            contact_uri: self.contact_uri.clone(),
            route_set: Vec::new(),
            state: DialogState::Early,
            session: None,
            client_transaction_in_flight: false,
            client_transaction_key: None,
            server_invite_transaction_key: Some(key.clone()),
        };
        let handle = dialog.handle();
        self.dialogs.insert_early(dialog);
        self.pending_incoming = Some(handle.clone());
        self.transactions.insert(txn);

        let remote_sdp = if req.body.is_empty() { None } else { String::from_utf8(req.body.clone()).ok() };
        vec![SipAction::Event(AgentEvent::IncomingCall { dialog: handle, from: peer_uri, to: to_uri, remote_sdp })]
    }

    fn handle_incoming_ack(&mut self, req: Request, now_ms: u64) -> Vec<SipAction> {
        let Some(via) = req.headers.via.first() else { return Vec::new() };
        let key = TransactionKey { branch: via.branch.clone(), method: Method::Invite, is_server: true };
        let Some(txn) = self.transactions.find_mut(&key) else { return Vec::new() };
        let actions = txn.on_ack(now_ms);
        self.translate_txn_actions(&key, actions, now_ms)
    }

    fn handle_incoming_bye(&mut self, req: Request, from: SocketAddr, now_ms: u64) -> Vec<SipAction> {
        let Some(via) = req.headers.via.first().cloned() else { return Vec::new() };
        let call_id = req.headers.call_id.clone().unwrap_or_default();
        let to_tag = req.headers.to.as_ref().and_then(|t| t.tag.clone()).unwrap_or_default();
        let from_tag = req.headers.from.as_ref().and_then(|f| f.tag.clone()).unwrap_or_default();

        let Some(dialog) = self.dialogs.find_by_call_id_and_tags(&call_id, &to_tag, Some(&from_tag)) else {
            return Vec::new();
        };
        let handle = dialog.handle();

        let key = TransactionKey { branch: via.branch, method: Method::Bye, is_server: true };
        let mut txn = Transaction::new_server(key.clone(), TransactionKind::NonInviteServer, from, now_ms, self.t1_ms, self.t2_ms, self.t4_ms);
        txn.dialog_call_id = Some(call_id.clone());
        txn.dialog_local_tag = Some(handle.local_tag.clone());
        let response = Response {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: Headers { call_id: Some(call_id), cseq: req.headers.cseq, ..Default::default() },
            body: Vec::new(),
        };
        let bytes = self.codec.encode(&Message::Response(response.clone()));
        let txn_actions = txn.send_server_response(&response, bytes, now_ms);
        self.transactions.insert(txn);

        self.dialogs.remove_by_handle(&handle);
        let mut actions = self.translate_txn_actions(&key, txn_actions, now_ms);
        actions.push(SipAction::Event(AgentEvent::CallStateChanged { dialog: handle, state: CallState::Hangup }));
        actions
    }

    fn handle_incoming_cancel(&mut self, req: Request, from: SocketAddr, now_ms: u64) -> Vec<SipAction> {
        let Some(via) = req.headers.via.first().cloned() else { return Vec::new() };
        let call_id = req.headers.call_id.clone().unwrap_or_default();
        let invite_key = TransactionKey { branch: via.branch.clone(), method: Method::Invite, is_server: true };

        let mut actions = Vec::new();
        if let Some(invite_txn) = self.transactions.find_mut(&invite_key) {
            let local_tag = invite_txn.dialog_local_tag.clone().unwrap_or_default();
            let response_487 = Response {
                status_code: 487,
                reason_phrase: "Request Terminated".to_string(),
                headers: Headers { call_id: Some(call_id.clone()), ..Default::default() },
                body: Vec::new(),
            };
            let bytes = self.codec.encode(&Message::Response(response_487.clone()));
            let txn_actions = invite_txn.send_server_response(&response_487, bytes, now_ms);
            actions.extend(self.translate_txn_actions(&invite_key, txn_actions, now_ms));

            let handle = DialogHandle { call_id: call_id.clone(), local_tag };
            self.dialogs.remove_by_handle(&handle);
            if self.pending_incoming.as_ref() == Some(&handle) {
                self.pending_incoming = None;
            }
            actions.push(SipAction::Event(AgentEvent::CallStateChanged { dialog: handle, state: CallState::Cancelled }));
        }

        let cancel_key = TransactionKey { branch: via.branch, method: Method::Cancel, is_server: true };
        let mut cancel_txn = Transaction::new_server(cancel_key.clone(), TransactionKind::NonInviteServer, from, now_ms, self.t1_ms, self.t2_ms, self.t4_ms);
        let response_200 = Response {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: Headers { call_id: Some(call_id), cseq: req.headers.cseq, ..Default::default() },
            body: Vec::new(),
        };
        let bytes = self.codec.encode(&Message::Response(response_200.clone()));
        let txn_actions = cancel_txn.send_server_response(&response_200, bytes, now_ms);
        self.transactions.insert(cancel_txn);
        actions.extend(self.translate_txn_actions(&cancel_key, txn_actions, now_ms));
        actions
    }

    fn handle_incoming_message(&mut self, req: Request, from: SocketAddr, now_ms: u64) -> Vec<SipAction> {
        let Some(via) = req.headers.via.first().cloned() else { return Vec::new() };
        let from_uri = req.headers.from.as_ref().map(|f| f.uri.clone()).unwrap_or_default();
        let to_uri = req.headers.to.as_ref().map(|t| t.uri.clone()).unwrap_or_default();
        let content = String::from_utf8_lossy(&req.body).into_owned();

        let key = TransactionKey { branch: via.branch, method: Method::Message, is_server: true };
        let mut txn = Transaction::new_server(key.clone(), TransactionKind::NonInviteServer, from, now_ms, self.t1_ms, self.t2_ms, self.t4_ms);
        let response = Response {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: Headers { call_id: req.headers.call_id.clone(), cseq: req.headers.cseq, ..Default::default() },
            body: Vec::new(),
        };
        let bytes = self.codec.encode(&Message::Response(response.clone()));
        let txn_actions = txn.send_server_response(&response, bytes, now_ms);
        self.transactions.insert(txn);

        let mut actions = self.translate_txn_actions(&key, txn_actions, now_ms);
        actions.push(SipAction::Event(AgentEvent::IncomingMessage { from: from_uri, to: to_uri, content }));
        actions
    }

    // ---- timers ----------------------------------------------------------

    pub fn on_timer(&mut self, kind: &TimerKind, now_ms: u64) -> Vec<SipAction> {
        match kind {
            TimerKind::TransactionCheck(key) => self.transaction_timer_fired(key, now_ms),
            TimerKind::RegistrationRefresh => self.refresh_registration(now_ms),
        }
    }

    fn transaction_timer_fired(&mut self, key: &TransactionKey, now_ms: u64) -> Vec<SipAction> {
        let Some(txn) = self.transactions.find_mut(key) else { return Vec::new() };
        let use_drain = matches!(
            (txn.kind, txn.state),
            (TransactionKind::InviteServer, TransactionState::Confirmed)
                | (TransactionKind::NonInviteServer, TransactionState::Completed)
        );
        let actions = if use_drain { txn.on_drain_timer(now_ms) } else { txn.on_timer(now_ms) };
        self.translate_txn_actions(key, actions, now_ms)
    }

    /// Reap terminated transactions past their drain deadline. Called once
    /// per `Agent::loop_once` (spec §4.4 `loop` phase 2).
    pub fn reap_transactions(&mut self, now_ms: u64) -> usize {
        self.transactions.reap_expired(now_ms, self.t4_ms)
    }

    /// Forcefully terminate every tracked dialog and drop every tracked
    /// transaction, for `Agent::stop` (spec §5: "transitions all dialogs to
    /// Terminated"). Returns the handles that were live, so the caller can
    /// emit a disconnect event per affected session before dropping it.
    pub fn terminate_all(&mut self) -> Vec<DialogHandle> {
        let handles = self.dialog_handles();
        for handle in &handles {
            self.dialogs.remove_by_handle(handle);
        }
        self.transactions.clear();
        self.pending_incoming = None;
        if !matches!(self.registration.state, RegistrationState::None | RegistrationState::Unregistered) {
            self.registration.state = RegistrationState::Unregistered;
        }
        handles
    }

    fn via(&self, branch: &str) -> ViaHeader {
        ViaHeader {
            protocol: "SIP/2.0/UDP".to_string(),
            sent_by: format!("{}:{}", self.local_addr.ip(), self.local_addr.port()),
            branch: branch.to_string(),
        }
    }
}

fn reason_for(code: u16) -> &'static str {
    match code {
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        603 => "Decline",
        404 => "Not Found",
        480 => "Temporarily Unavailable",
        _ => "Call Failed",
    }
}

fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn new_tag() -> String {
    random_token(8)
}

fn new_branch() -> String {
    format!("z9hG4bK{}", random_token(12))
}

fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl SipAgent {
    fn send_client_request(
        &mut self,
        method: Method,
        kind: TransactionKind,
        branch: String,
        request: Request,
        dialog_call_id: Option<String>,
        dialog_local_tag: Option<String>,
        destination: SocketAddr,
        now_ms: u64,
    ) -> Vec<SipAction> {
        let bytes = self.codec.encode(&Message::Request(request));
        let key = TransactionKey { branch, method, is_server: false };
        let mut txn = Transaction::new_client(key.clone(), kind, destination, bytes.clone(), now_ms, self.t1_ms, self.t2_ms, self.t4_ms);
        txn.dialog_call_id = dialog_call_id;
        txn.dialog_local_tag = dialog_local_tag;
        self.transactions.insert(txn);
        vec![
            SipAction::Send { bytes, to: destination },
            SipAction::ScheduleTimer { delay_ms: self.t1_ms, kind: TimerKind::TransactionCheck(key) },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::net::{IpAddr, Ipv4Addr};

    fn agent() -> SipAgent {
        let config = AgentConfig::builder()
            .server("127.0.0.1", 5060)
            .identity("alice", "secret")
            .build()
            .unwrap();
        SipAgent::new(&config, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 15060)).unwrap()
    }

    #[test]
    fn register_sends_a_request_and_schedules_t1() {
        let mut agent = agent();
        let actions = agent.register(0);
        assert!(matches!(actions[0], SipAction::Send { .. }));
        assert!(matches!(
            actions[1],
            SipAction::ScheduleTimer { kind: TimerKind::TransactionCheck(_), .. }
        ));
    }

    #[test]
    fn register_challenge_retries_exactly_once() {
        let mut agent = agent();
        agent.register(0);
        let call_id = agent.registration.call_id.clone();
        let challenge_resp = |cseq: u32| Response {
            status_code: 401,
            reason_phrase: "Unauthorized".to_string(),
            headers: Headers {
                via: vec![ViaHeader { protocol: "SIP/2.0/UDP".into(), sent_by: "x".into(), branch: "zb1".into() }],
                from: Some(NamedUri::new("sip:alice@127.0.0.1").with_tag("t1")),
                call_id: Some(call_id.clone()),
                cseq: Some(CSeq { seq: cseq, method: Method::Register }),
                www_authenticate: Some("Digest realm=\"example\", nonce=\"xyz\", qop=\"auth\"".to_string()),
                ..Default::default()
            },
            body: Vec::new(),
        };

        let actions = agent.handle_register_response(challenge_resp(1), 0);
        assert!(actions.iter().any(|a| matches!(a, SipAction::Send { .. })));

        let second = agent.handle_register_response(challenge_resp(2), 0);
        assert!(second.iter().any(|a| matches!(
            a,
            SipAction::Event(AgentEvent::RegistrationStateChanged { state: RegistrationState::Failed, .. })
        )));
    }

    #[test]
    fn make_call_then_hangup_requires_confirmed_dialog() {
        let mut agent = agent();
        let dialog = agent.make_call("sip:bob@example.com");
        let err = agent.hangup(&dialog, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn busy_second_incoming_invite_is_auto_rejected() {
        let mut agent = agent();
        agent.pending_incoming = Some(DialogHandle { call_id: "other".into(), local_tag: "tag".into() });
        let req = Request {
            method: Method::Invite,
            request_uri: "sip:alice@127.0.0.1".to_string(),
            headers: Headers {
                via: vec![ViaHeader { protocol: "SIP/2.0/UDP".into(), sent_by: "bob-host".into(), branch: "z9hG4bKbusy".into() }],
                from: Some(NamedUri::new("sip:bob@example.com").with_tag("bobtag")),
                to: Some(NamedUri::new("sip:alice@127.0.0.1")),
                call_id: Some("callid2".to_string()),
                cseq: Some(CSeq { seq: 1, method: Method::Invite }),
                ..Default::default()
            },
            body: Vec::new(),
        };
        let actions = agent.handle_request(req, "127.0.0.1:6000".parse().unwrap(), 0);
        assert!(actions.iter().any(|a| matches!(a, SipAction::Send { .. })));
        assert!(!actions.iter().any(|a| matches!(a, SipAction::Event(AgentEvent::IncomingCall { .. }))));
    }
}
