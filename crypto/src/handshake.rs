use rand_core::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::{CryptoError, EncryptionContext};

/// Result of feeding one incoming handshake message to a [`Ukey2Handshake`].
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send the enclosed bytes to the peer and keep calling `advance`.
    SendAndContinue(Vec<u8>),
    /// Send the enclosed bytes to the peer; the handshake is now complete
    /// on this side.
    SendAndComplete(Vec<u8>, EncryptionContext),
    /// Nothing left to send; the handshake is complete.
    Complete(EncryptionContext),
    /// The handshake cannot proceed.
    Fail(CryptoError),
}

/// The I/O contract the connection core drives the key-agreement handshake
/// through. Implementations exchange raw byte messages over the
/// not-yet-encrypted channel until both sides report a [`HandshakeStep`]
/// that carries an [`EncryptionContext`].
pub trait Ukey2Handshake: std::fmt::Debug + Send {
    /// Produces the first message this side sends, without having received
    /// anything from the peer yet. Returns `None` for the responder, which
    /// only reacts to the initiator's first message.
    fn start(&mut self) -> Option<Vec<u8>>;

    /// Feeds one message received from the peer and returns the next step.
    fn advance(&mut self, incoming: &[u8]) -> HandshakeStep;
}

/// A minimal, real (not simulated) Diffie-Hellman handshake used in place of
/// UKEY2, which is out of scope for this crate. Good enough to exercise the
/// full connection state machine and to derive a working
/// [`EncryptionContext`] end to end.
#[derive(Debug)]
pub struct InProcessHandshake {
    secret: Option<EphemeralSecret>,
    local_public: PublicKey,
    remote_public: Option<[u8; 32]>,
    is_initiator: bool,
    done: bool,
}

impl InProcessHandshake {
    /// Creates a new handshake instance. `is_initiator` determines who sends
    /// the first message; both sides otherwise run identical logic.
    #[must_use]
    pub fn new(is_initiator: bool) -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let local_public = PublicKey::from(&secret);
        Self { secret: Some(secret), local_public, remote_public: None, is_initiator, done: false }
    }

    fn finish(&mut self, incoming: &[u8]) -> HandshakeStep {
        let Ok(remote_bytes): Result<[u8; 32], _> = incoming.try_into() else {
            return HandshakeStep::Fail(CryptoError::MalformedMessage);
        };
        let Some(secret) = self.secret.take() else {
            return HandshakeStep::Fail(CryptoError::AlreadyFinished);
        };
        let remote_public = PublicKey::from(remote_bytes);
        let shared = secret.diffie_hellman(&remote_public);
        if shared.as_bytes().iter().all(|&b| b == 0) {
            return HandshakeStep::Fail(CryptoError::DegenerateSharedSecret);
        }
        self.remote_public = Some(remote_bytes);
        self.done = true;
        let ctx = EncryptionContext::derive(
            shared.as_bytes(),
            self.local_public.as_bytes(),
            &remote_bytes,
        );
        HandshakeStep::Complete(ctx)
    }
}

impl Ukey2Handshake for InProcessHandshake {
    fn start(&mut self) -> Option<Vec<u8>> {
        self.is_initiator.then(|| self.local_public.as_bytes().to_vec())
    }

    fn advance(&mut self, incoming: &[u8]) -> HandshakeStep {
        if self.done {
            return HandshakeStep::Fail(CryptoError::AlreadyFinished);
        }
        if self.is_initiator {
            // The initiator already sent its public key via `start`; the
            // only incoming message it expects is the responder's key.
            self.finish(incoming)
        } else {
            // The responder replies with its own public key and completes
            // in the same step.
            let reply = self.local_public.as_bytes().to_vec();
            match self.finish(incoming) {
                HandshakeStep::Complete(ctx) => HandshakeStep::SendAndComplete(reply, ctx),
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_derives_matching_contexts() {
        let mut initiator = InProcessHandshake::new(true);
        let mut responder = InProcessHandshake::new(false);

        let initiator_msg = initiator.start().expect("initiator sends first");
        assert!(responder.start().is_none());

        let (responder_msg, mut responder_ctx) = match responder.advance(&initiator_msg) {
            HandshakeStep::SendAndComplete(msg, ctx) => (msg, ctx),
            other => panic!("unexpected step: {other:?}"),
        };
        let mut initiator_ctx = match initiator.advance(&responder_msg) {
            HandshakeStep::Complete(ctx) => ctx,
            other => panic!("unexpected step: {other:?}"),
        };

        assert_eq!(initiator_ctx.short_auth_token(), responder_ctx.short_auth_token());

        let mut plaintext = b"hello nearby".to_vec();
        let original = plaintext.clone();
        initiator_ctx.encrypt(&mut plaintext);
        assert_ne!(plaintext, original);
        responder_ctx.decrypt(&mut plaintext);
        assert_eq!(plaintext, original);
    }

    #[test]
    fn malformed_message_fails_cleanly() {
        let mut initiator = InProcessHandshake::new(true);
        let _ = initiator.start();
        match initiator.advance(&[0u8; 4]) {
            HandshakeStep::Fail(CryptoError::MalformedMessage) => {}
            other => panic!("expected MalformedMessage, got {other:?}"),
        }
    }
}
