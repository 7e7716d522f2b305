//! HTTP digest authentication engine (component A).
//!
//! Implements RFC 2617 / RFC 7616 digest response computation:
//!
//! ```text
//! HA1 = MD5(username:realm:password)
//! HA2 = MD5(method:digest-uri)
//! response = MD5(HA1:nonce:nc:cnonce:qop:HA2)          if qop is present
//!          = MD5(HA1:nonce:HA2)                        otherwise
//! ```
//!
//! `MD5-sess` folds the client nonce into HA1 once per nonce; `auth-int`
//! folds the request body's MD5 into HA2. The engine tracks one nonce/cnonce/
//! nc counter per realm so a single agent can hold simultaneous challenges
//! from distinct realms (registrar vs. a proxy), and enforces spec §4.2/§9's
//! "exactly one retry per request" rule one level up, in the SIP agent —
//! this module is a pure function plus a small per-realm nonce cache.

use std::collections::HashMap;

use rand::RngCore;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    fn as_str(self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }

    pub fn parse(s: &str) -> Option<Qop> {
        match s.trim() {
            "auth" => Some(Qop::Auth),
            "auth-int" => Some(Qop::AuthInt),
            _ => None,
        }
    }
}

/// A 401/407 challenge, as extracted from `WWW-Authenticate`/
/// `Proxy-Authenticate`.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<Qop>,
    pub algorithm: Algorithm,
    pub opaque: Option<String>,
    pub stale: bool,
}

/// Per-realm nonce/cnonce/nc state, so a repeat request within the same
/// nonce's lifetime increments `nc` instead of colliding.
#[derive(Debug, Clone, Default)]
struct RealmState {
    nonce: String,
    cnonce: String,
    nc: u32,
}

/// The resulting `Authorization`/`Proxy-Authorization` header value plus the
/// fields the caller needs to rebuild the request (nc, cnonce) for
/// diagnostics.
#[derive(Debug, Clone)]
pub struct DigestResponse {
    pub header_value: String,
}

#[derive(Debug, Default)]
pub struct AuthEngine {
    realms: HashMap<String, RealmState>,
}

impl AuthEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an `Authorization` header value for `username`/`password`
    /// against `challenge`, for a request to `method`/`uri`. Advances the
    /// realm's nonce-count, generating a fresh cnonce on first use or after a
    /// stale-nonce refresh.
    pub fn authorize(
        &mut self,
        username: &str,
        password: &str,
        challenge: &Challenge,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Result<DigestResponse> {
        let state = self.realms.entry(challenge.realm.clone()).or_default();
        if state.nonce != challenge.nonce || challenge.stale || state.cnonce.is_empty() {
            state.nonce = challenge.nonce.clone();
            state.cnonce = generate_cnonce();
            state.nc = 0;
        }
        state.nc += 1;
        let nc = state.nc;
        let cnonce = state.cnonce.clone();

        let ha1 = compute_ha1(username, &challenge.realm, password, challenge.algorithm, &challenge.nonce, &cnonce);
        let ha2 = compute_ha2(method, uri, challenge.qop, body);
        let response = match challenge.qop {
            Some(qop) => compute_response(&ha1, &challenge.nonce, nc, &cnonce, qop, &ha2),
            None => md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce)),
        };

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
            challenge.realm, challenge.nonce
        );
        if challenge.algorithm == Algorithm::Md5Sess {
            header.push_str(", algorithm=MD5-sess");
        }
        if let Some(qop) = challenge.qop {
            header.push_str(&format!(", qop={}, nc={nc:08x}, cnonce=\"{cnonce}\"", qop.as_str()));
        }
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }

        Ok(DigestResponse { header_value: header })
    }

    /// Drop cached nonce state for a realm, e.g. after `AuthReject`.
    pub fn forget(&mut self, realm: &str) {
        self.realms.remove(realm);
    }
}

fn compute_ha1(
    username: &str,
    realm: &str,
    password: &str,
    algorithm: Algorithm,
    nonce: &str,
    cnonce: &str,
) -> String {
    let base = md5_hex(&format!("{username}:{realm}:{password}"));
    match algorithm {
        Algorithm::Md5 => base,
        Algorithm::Md5Sess => md5_hex(&format!("{base}:{nonce}:{cnonce}")),
    }
}

fn compute_ha2(method: &str, uri: &str, qop: Option<Qop>, body: &[u8]) -> String {
    match qop {
        Some(Qop::AuthInt) => {
            let body_hash = md5_hex_bytes(body);
            md5_hex(&format!("{method}:{uri}:{body_hash}"))
        }
        _ => md5_hex(&format!("{method}:{uri}")),
    }
}

/// Pure function per spec §8 "Digest round-trip": for fixed inputs,
/// `compute_response` always yields the same response hash.
pub fn compute_response(ha1: &str, nonce: &str, nc: u32, cnonce: &str, qop: Qop, ha2: &str) -> String {
    md5_hex(&format!(
        "{ha1}:{nonce}:{nc:08x}:{cnonce}:{}:{ha2}",
        qop.as_str()
    ))
}

fn md5_hex(input: &str) -> String {
    md5_hex_bytes(input.as_bytes())
}

fn md5_hex_bytes(input: &[u8]) -> String {
    let digest = md5::compute(input);
    format!("{digest:x}")
}

fn generate_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extract a [`Challenge`] from a raw `WWW-Authenticate`/`Proxy-Authenticate`
/// header value, e.g. `Digest realm="example", nonce="xyz", qop="auth"`.
pub fn parse_challenge(header_value: &str) -> Result<Challenge> {
    let rest = header_value
        .trim()
        .strip_prefix("Digest")
        .ok_or_else(|| Error::SipParse("challenge is not a Digest scheme".into()))?;

    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut algorithm = Algorithm::Md5;
    let mut opaque = None;
    let mut stale = false;

    for part in rest.split(',') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "nonce" => nonce = Some(value.to_string()),
            "qop" => qop = value.split(',').next().and_then(Qop::parse),
            "algorithm" => {
                algorithm = if value.eq_ignore_ascii_case("MD5-sess") {
                    Algorithm::Md5Sess
                } else {
                    Algorithm::Md5
                }
            }
            "opaque" => opaque = Some(value.to_string()),
            "stale" => stale = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    Ok(Challenge {
        realm: realm.ok_or_else(|| Error::SipParse("challenge missing realm".into()))?,
        nonce: nonce.ok_or_else(|| Error::SipParse("challenge missing nonce".into()))?,
        qop,
        algorithm,
        opaque,
        stale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_response_is_a_pure_function() {
        let r1 = compute_response("ha1", "xyz", 1, "cn", Qop::Auth, "ha2");
        let r2 = compute_response("ha1", "xyz", 1, "cn", Qop::Auth, "ha2");
        assert_eq!(r1, r2);
        assert_eq!(r1.len(), 32);
    }

    #[test]
    fn authorize_increments_nc_on_same_realm() {
        let mut engine = AuthEngine::new();
        let challenge = Challenge {
            realm: "example".to_string(),
            nonce: "xyz".to_string(),
            qop: Some(Qop::Auth),
            algorithm: Algorithm::Md5,
            opaque: None,
            stale: false,
        };
        let first = engine
            .authorize("alice", "secret", &challenge, "REGISTER", "sip:sip.example.com", b"")
            .unwrap();
        assert!(first.header_value.contains("nc=00000001"));
        let second = engine
            .authorize("alice", "secret", &challenge, "REGISTER", "sip:sip.example.com", b"")
            .unwrap();
        assert!(second.header_value.contains("nc=00000002"));
    }

    #[test]
    fn stale_nonce_resets_nc() {
        let mut engine = AuthEngine::new();
        let mut challenge = Challenge {
            realm: "example".to_string(),
            nonce: "xyz".to_string(),
            qop: Some(Qop::Auth),
            algorithm: Algorithm::Md5,
            opaque: None,
            stale: false,
        };
        engine
            .authorize("alice", "secret", &challenge, "REGISTER", "sip:sip.example.com", b"")
            .unwrap();
        challenge.nonce = "xyz2".to_string();
        challenge.stale = true;
        let refreshed = engine
            .authorize("alice", "secret", &challenge, "REGISTER", "sip:sip.example.com", b"")
            .unwrap();
        assert!(refreshed.header_value.contains("nc=00000001"));
    }

    #[test]
    fn parses_challenge_header() {
        let challenge = parse_challenge(
            "Digest realm=\"example\", nonce=\"xyz\", qop=\"auth\", algorithm=MD5",
        )
        .unwrap();
        assert_eq!(challenge.realm, "example");
        assert_eq!(challenge.nonce, "xyz");
        assert_eq!(challenge.qop, Some(Qop::Auth));
    }
}
