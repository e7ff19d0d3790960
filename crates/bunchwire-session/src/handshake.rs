//! Pre-trust handshake state machine.
//!
//! The server proves that the peer can receive at its claimed address
//! before trusting any traffic from it: a random challenge goes out on the
//! control channel and must come back as a derived digest. The digest is
//! deliberately weak; the handshake establishes reachability and byte
//! order, not cryptographic identity.

use rand::Rng;

/// Server-side handshake progress. `Complete` is terminal for the life of
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// No Hello seen yet; everything but Hello is ignored.
    #[default]
    NotStarted,
    /// Challenge issued, waiting for the matching response.
    ChallengeSent,
    /// Peer verified; application traffic is accepted.
    Complete,
}

/// What to do with an incoming challenge response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseVerdict {
    /// Digest matched; the connection is now trusted.
    Accepted,
    /// Digest mismatched; stay in `ChallengeSent`.
    Rejected,
    /// Too many mismatches; tear the connection down.
    Fatal,
    /// Response arrived in a state that does not expect one; discard.
    Ignored,
}

/// Per-connection handshake state, server side only.
#[derive(Debug, Default)]
pub struct Handshake {
    state: HandshakeState,
    challenge: u32,
    attempts: u32,
}

impl Handshake {
    /// Creates a handshake in `NotStarted`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns true once the peer has been verified.
    pub fn is_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    /// Handles a Hello: in `NotStarted`, generates and stores a random
    /// challenge and returns it for sending; in any other state the Hello
    /// is stale and `None` is returned.
    pub fn on_hello(&mut self) -> Option<u32> {
        if self.state != HandshakeState::NotStarted {
            return None;
        }
        self.challenge = rand::rng().random();
        self.state = HandshakeState::ChallengeSent;
        Some(self.challenge)
    }

    /// Checks a challenge response against the stored challenge.
    pub fn on_response(&mut self, digest: u32, retry_limit: u32) -> ResponseVerdict {
        if self.state != HandshakeState::ChallengeSent {
            return ResponseVerdict::Ignored;
        }
        if digest == expected_response(self.challenge) {
            self.state = HandshakeState::Complete;
            ResponseVerdict::Accepted
        } else {
            self.attempts += 1;
            if self.attempts >= retry_limit {
                ResponseVerdict::Fatal
            } else {
                ResponseVerdict::Rejected
            }
        }
    }
}

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const RESPONSE_KEY: &[u8] = b"bunchwire-handshake-v1";

/// Digest a client derives from a challenge value. Keyed FNV-1a over the
/// challenge bytes; both sides compute it, the server compares.
pub fn expected_response(challenge: u32) -> u32 {
    let mut hash = FNV_OFFSET;
    for &byte in RESPONSE_KEY.iter().chain(challenge.to_be_bytes().iter()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_issues_challenge_once() {
        let mut hs = Handshake::new();
        assert_eq!(hs.state(), HandshakeState::NotStarted);

        let challenge = hs.on_hello().expect("first hello issues a challenge");
        assert_eq!(hs.state(), HandshakeState::ChallengeSent);

        // A replayed Hello neither reissues nor regenerates.
        assert_eq!(hs.on_hello(), None);
        assert_eq!(hs.on_response(expected_response(challenge), 3), ResponseVerdict::Accepted);
    }

    #[test]
    fn test_response_before_hello_is_ignored() {
        let mut hs = Handshake::new();
        assert_eq!(hs.on_response(123, 3), ResponseVerdict::Ignored);
        assert_eq!(hs.state(), HandshakeState::NotStarted);
    }

    #[test]
    fn test_wrong_response_stays_in_challenge_sent() {
        let mut hs = Handshake::new();
        let challenge = hs.on_hello().unwrap();

        let wrong = expected_response(challenge) ^ 1;
        assert_eq!(hs.on_response(wrong, 3), ResponseVerdict::Rejected);
        assert_eq!(hs.state(), HandshakeState::ChallengeSent);

        // The correct response still works after a rejection.
        assert_eq!(hs.on_response(expected_response(challenge), 3), ResponseVerdict::Accepted);
        assert!(hs.is_complete());
    }

    #[test]
    fn test_retry_limit_is_fatal() {
        let mut hs = Handshake::new();
        let challenge = hs.on_hello().unwrap();
        let wrong = expected_response(challenge) ^ 1;

        assert_eq!(hs.on_response(wrong, 3), ResponseVerdict::Rejected);
        assert_eq!(hs.on_response(wrong, 3), ResponseVerdict::Rejected);
        assert_eq!(hs.on_response(wrong, 3), ResponseVerdict::Fatal);
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut hs = Handshake::new();
        let challenge = hs.on_hello().unwrap();
        let digest = expected_response(challenge);
        assert_eq!(hs.on_response(digest, 3), ResponseVerdict::Accepted);

        // Replaying the valid response has no effect.
        assert_eq!(hs.on_response(digest, 3), ResponseVerdict::Ignored);
        assert_eq!(hs.state(), HandshakeState::Complete);
        assert_eq!(hs.on_hello(), None);
    }

    #[test]
    fn test_digest_depends_on_challenge() {
        assert_ne!(expected_response(1), expected_response(2));
        assert_eq!(expected_response(7), expected_response(7));
    }
}
