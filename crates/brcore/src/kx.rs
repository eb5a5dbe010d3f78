//! Key exchange engine (§4.F): direct out-of-band KX, mediated (transitive)
//! KX, and ratchet reset, as one gated-transition state machine per
//! in-flight attempt with timeout cleanup.

use crate::crypto::{dh, generate_dh_keypair};
use crate::error::{CoreError, ProtocolError};
use crate::ratchet::{Ratchet, RvTag};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use x25519_dalek::StaticSecret;

pub type UserId = [u8; 32];

/// Direct-KX state machine per attempt (§4.F): `Idle -> AwaitingReply ->
/// Completing -> Done | Timeout | Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxState {
    Idle,
    AwaitingReply,
    Completing,
    Done,
    TimedOut,
    Aborted,
}

/// The out-of-band invitation blob (§4.F, §3): long-term pubkey, server
/// address, initial RV, and a fresh ephemeral pubkey. Exchanged outside the
/// relay's reach (QR code, pasted text, a mediator courier) since no
/// ratchet exists yet to seal it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KxInvite {
    pub user_id: UserId,
    pub nick: String,
    pub server: String,
    pub initial_rv: RvTag,
    pub long_term_pub: [u8; 32],
    pub ephemeral_pub: [u8; 32],
}

/// The responder's reply, posted at the RV deterministically derived from
/// `initial_rv` (§4.F: "writes a reply at the next RV"). Plaintext is
/// acceptable here — it carries only public key material, same trust model
/// as a published X3DH prekey bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KxReply {
    pub user_id: UserId,
    pub nick: String,
    pub long_term_pub: [u8; 32],
    pub ephemeral_pub: [u8; 32],
}

struct PendingAttempt {
    state: KxState,
    is_initiator: bool,
    our_ephemeral_secret: StaticSecret,
    created_at: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
}

/// Derive a reply RV deterministically from the initial RV so the initiator
/// can pre-register a one-shot handler before the responder ever acts.
pub fn reply_rv(initial_rv: RvTag) -> RvTag {
    RvTag(*blake3::keyed_hash(&initial_rv.0, b"kx-reply").as_bytes())
}

fn combine_secret(dh1: [u8; 32], dh2: [u8; 32]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 32];
    hk.expand(b"bisonrelay-kx-shared-secret", &mut okm)
        .expect("32 bytes is a valid HKDF output length");
    okm
}

/// State machine + bookkeeping for every in-flight KX attempt (direct,
/// mediated, or reset) for one local identity. Keyed by the RV the local
/// side is waiting to hear back on.
pub struct KxEngine {
    attempts: parking_lot::Mutex<HashMap<[u8; 32], PendingAttempt>>,
    timeout: ChronoDuration,
    ratchet_window: u32,
}

impl KxEngine {
    pub fn new(timeout_secs: i64, ratchet_window: u32) -> Self {
        Self {
            attempts: parking_lot::Mutex::new(HashMap::new()),
            timeout: ChronoDuration::seconds(timeout_secs),
            ratchet_window,
        }
    }

    /// Begin a direct KX as the initiator: generates a fresh ephemeral
    /// keypair and an invite the caller hands out-of-band. Registers a
    /// one-shot handler (by the caller, via the RV manager) at
    /// `reply_rv(initial_rv)`.
    pub fn begin_direct(
        &self,
        our_user_id: UserId,
        our_nick: String,
        our_long_term_pub: [u8; 32],
        server: String,
    ) -> KxInvite {
        let (ephemeral_secret, ephemeral_pub) = generate_dh_keypair();
        let mut rv_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut rv_bytes);
        let initial_rv = RvTag(rv_bytes);

        let now = Utc::now();
        self.attempts.lock().insert(
            reply_rv(initial_rv).0,
            PendingAttempt {
                state: KxState::AwaitingReply,
                is_initiator: true,
                our_ephemeral_secret: ephemeral_secret,
                created_at: now,
                timeout_at: now + self.timeout,
            },
        );

        KxInvite {
            user_id: our_user_id,
            nick: our_nick,
            server,
            initial_rv,
            long_term_pub: our_long_term_pub,
            ephemeral_pub: ephemeral_pub.to_bytes(),
        }
    }

    /// Responder side: accept an invite (direct or forwarded by a
    /// mediator), compute the shared secret, and produce the reply to post
    /// at `reply_rv(invite.initial_rv)`. Returns the peer's UserID and a
    /// freshly built ratchet ready for `registry.insert`.
    pub fn accept_invite(
        &self,
        invite: &KxInvite,
        our_user_id: UserId,
        our_nick: String,
        our_long_term_secret: &StaticSecret,
        our_long_term_pub: [u8; 32],
    ) -> Result<(UserId, Ratchet, KxReply), CoreError> {
        let (ephemeral_secret, ephemeral_pub) = generate_dh_keypair();
        let their_long_term = x25519_dalek::PublicKey::from(invite.long_term_pub);
        let their_ephemeral = x25519_dalek::PublicKey::from(invite.ephemeral_pub);

        let dh_static = dh(our_long_term_secret, &their_long_term);
        let dh_ephemeral = dh(&ephemeral_secret, &their_ephemeral);
        let shared = combine_secret(dh_static, dh_ephemeral);

        // Seed the ratchet's own DH keypair with the ephemeral secret just
        // used above: its public half (`ephemeral_pub` in the reply below)
        // is what the peer will bootstrap against, and the peer's ratchet
        // DH public is their `ephemeral_pub`, not their long-term key.
        let mut ratchet = Ratchet::new(&shared, false, self.ratchet_window, ephemeral_secret);
        ratchet.bootstrap_remote_dh(invite.ephemeral_pub);

        let reply = KxReply {
            user_id: our_user_id,
            nick: our_nick,
            long_term_pub: our_long_term_pub,
            ephemeral_pub: ephemeral_pub.to_bytes(),
        };

        Ok((invite.user_id, ratchet, reply))
    }

    /// Initiator side: finalize after receiving the responder's reply at
    /// `reply_rv(initial_rv)`. Removes the pending attempt (it's `Done`
    /// either way — success or a malformed reply is a caller-visible
    /// protocol error, never left half-finished).
    pub fn complete_as_initiator(
        &self,
        initial_rv: RvTag,
        reply: &KxReply,
        our_long_term_secret: &StaticSecret,
    ) -> Result<(UserId, Ratchet), CoreError> {
        let key = reply_rv(initial_rv).0;
        let mut attempts = self.attempts.lock();
        let attempt = attempts
            .remove(&key)
            .ok_or(CoreError::Protocol(ProtocolError::UnknownTag))?;
        if !attempt.is_initiator {
            return Err(CoreError::Protocol(ProtocolError::Malformed(
                "not an initiator attempt".into(),
            )));
        }

        let their_long_term = x25519_dalek::PublicKey::from(reply.long_term_pub);
        let their_ephemeral = x25519_dalek::PublicKey::from(reply.ephemeral_pub);
        let dh_static = dh(our_long_term_secret, &their_long_term);
        let dh_ephemeral = dh(&attempt.our_ephemeral_secret, &their_ephemeral);
        let shared = combine_secret(dh_static, dh_ephemeral);

        let mut ratchet = Ratchet::new(&shared, true, self.ratchet_window, attempt.our_ephemeral_secret);
        ratchet.bootstrap_remote_dh(reply.ephemeral_pub);

        Ok((reply.user_id, ratchet))
    }

    /// Reset flow, initiating side: propose a fresh ratchet with an
    /// existing peer, carried as a `KxStep` RM over the *current* ratchet
    /// (the peer is already trusted, so no out-of-band exchange is
    /// needed). Returns the `(ephemeral_pub, reply_rv)` pair to embed in the
    /// `RoutedMessage::KxStep` payload.
    pub fn begin_reset(&self) -> ([u8; 32], RvTag) {
        let (ephemeral_secret, ephemeral_pub) = generate_dh_keypair();
        let mut rv_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut rv_bytes);
        let reply_rv = RvTag(rv_bytes);
        let now = Utc::now();
        self.attempts.lock().insert(
            reply_rv.0,
            PendingAttempt {
                state: KxState::AwaitingReply,
                is_initiator: true,
                our_ephemeral_secret: ephemeral_secret,
                created_at: now,
                timeout_at: now + self.timeout,
            },
        );
        (ephemeral_pub.to_bytes(), reply_rv)
    }

    /// Reset flow, responding side: given the peer's proposed ephemeral
    /// pubkey, produce our own ephemeral, the new ratchet, and the raw
    /// bytes to post (unsealed — no ratchet yet) at the proposer's
    /// `reply_rv`.
    pub fn accept_reset(
        &self,
        their_ephemeral_pub: [u8; 32],
    ) -> ([u8; 32], StaticSecret) {
        let (ephemeral_secret, ephemeral_pub) = generate_dh_keypair();
        let _ = their_ephemeral_pub;
        (ephemeral_pub.to_bytes(), ephemeral_secret)
    }

    /// Finish building the new ratchet once both ephemeral pubkeys are
    /// known, for either side of a reset.
    pub fn finish_reset(
        &self,
        is_initiator: bool,
        our_ephemeral_secret: StaticSecret,
        their_ephemeral_pub: [u8; 32],
    ) -> Ratchet {
        let their = x25519_dalek::PublicKey::from(their_ephemeral_pub);
        let shared = dh(&our_ephemeral_secret, &their);
        let mut ratchet = Ratchet::new(&shared, is_initiator, self.ratchet_window, our_ephemeral_secret);
        ratchet.bootstrap_remote_dh(their_ephemeral_pub);
        ratchet
    }

    pub fn take_reset_secret(&self, reply_rv: RvTag) -> Option<StaticSecret> {
        self.attempts
            .lock()
            .remove(&reply_rv.0)
            .map(|a| a.our_ephemeral_secret)
    }

    /// Sweep attempts past their deadline; returns the RVs whose pending
    /// one-shot subscriptions the caller must also tear down (§4.F
    /// "Timeout cleans up the pending RV subscriptions").
    pub fn sweep_timeouts(&self) -> Vec<RvTag> {
        let now = Utc::now();
        let mut attempts = self.attempts.lock();
        let expired: Vec<[u8; 32]> = attempts
            .iter()
            .filter(|(_, a)| a.state != KxState::Done && now > a.timeout_at)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            attempts.remove(key);
        }
        expired.into_iter().map(RvTag).collect()
    }

    pub fn abort(&self, key: RvTag) {
        self.attempts.lock().remove(&key.0);
    }

    pub fn pending_count(&self) -> usize {
        self.attempts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_dh_keypair;

    #[test]
    fn direct_kx_round_trip_yields_matching_ratchets() {
        let engine_a = KxEngine::new(30, 50);
        let engine_b = KxEngine::new(30, 50);

        let (alice_lt_secret, alice_lt_pub) = generate_dh_keypair();
        let (bob_lt_secret, bob_lt_pub) = generate_dh_keypair();

        let invite = engine_a.begin_direct(
            [1u8; 32],
            "alice".to_string(),
            alice_lt_pub.to_bytes(),
            "127.0.0.1:443".to_string(),
        );

        let (peer_id, mut bob_ratchet, reply) = engine_b
            .accept_invite(&invite, [2u8; 32], "bob".to_string(), &bob_lt_secret, bob_lt_pub.to_bytes())
            .unwrap();
        assert_eq!(peer_id, [1u8; 32]);

        let (initiator_peer_id, mut alice_ratchet) = engine_a
            .complete_as_initiator(invite.initial_rv, &reply, &alice_lt_secret)
            .unwrap();
        assert_eq!(initiator_peer_id, [2u8; 32]);

        let expected_tag = bob_ratchet.next_tag_recv().unwrap();
        let (tag, header, key) = alice_ratchet.next_tag_send().unwrap();
        assert_eq!(tag, expected_tag);
        let sealed = crate::ratchet::seal(&header, &key, b"hello bob");
        assert_eq!(bob_ratchet.try_decrypt(tag, &sealed).unwrap(), b"hello bob");
    }

    #[test]
    fn unknown_reply_rv_is_an_error() {
        let engine = KxEngine::new(30, 50);
        let (_lt_secret, lt_pub) = generate_dh_keypair();
        let fake_reply = KxReply {
            user_id: [9u8; 32],
            nick: "ghost".to_string(),
            long_term_pub: lt_pub.to_bytes(),
            ephemeral_pub: lt_pub.to_bytes(),
        };
        let (lt_secret, _) = generate_dh_keypair();
        assert!(engine
            .complete_as_initiator(RvTag([7u8; 32]), &fake_reply, &lt_secret)
            .is_err());
    }

    #[test]
    fn sweep_timeouts_evicts_expired_attempts() {
        let engine = KxEngine::new(-1, 50); // already-expired timeout
        let (_secret, pub_key) = generate_dh_keypair();
        engine.begin_direct([1u8; 32], "a".into(), pub_key.to_bytes(), "x".into());
        assert_eq!(engine.pending_count(), 1);
        let expired = engine.sweep_timeouts();
        assert_eq!(expired.len(), 1);
        assert_eq!(engine.pending_count(), 0);
    }
}
