use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use zeroize::Zeroize;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Session-key material derived from a completed handshake.
///
/// Once installed on a channel, every subsequent outbound frame body is
/// encrypted and every inbound frame body is decrypted in place. The two
/// directions use independent keystreams, each bound to a fixed
/// (sender, receiver) order, so a reflected frame can never decrypt to
/// itself and the two peers always land on the same pair of streams.
pub struct EncryptionContext {
    encrypt: Aes128Ctr,
    decrypt: Aes128Ctr,
    auth_token: String,
}

impl EncryptionContext {
    /// Derives an encryption context from a raw 32-byte shared secret and
    /// the two parties' public keys (used to compute the auth token and to
    /// bind each keystream to a send/receive direction, not to reorder
    /// them — `local`/`remote` already makes the two directions mirror
    /// images of each other: what A encrypts with `H(A,B)` is what B
    /// decrypts with `H(A,B)`).
    #[must_use]
    pub(crate) fn derive(shared_secret: &[u8; 32], local_public: &[u8; 32], remote_public: &[u8; 32]) -> Self {
        use sha2::{Digest, Sha256};

        let mut send_material = Sha256::new();
        send_material.update(b"nearlink-send");
        send_material.update(shared_secret);
        send_material.update(local_public);
        send_material.update(remote_public);
        let send_digest = send_material.finalize();

        let mut recv_material = Sha256::new();
        recv_material.update(b"nearlink-send");
        recv_material.update(shared_secret);
        recv_material.update(remote_public);
        recv_material.update(local_public);
        let recv_digest = recv_material.finalize();

        let (encrypt, decrypt) = (derive_stream(&send_digest), derive_stream(&recv_digest));

        let auth_token = derive_auth_token(shared_secret, local_public, remote_public);
        Self { encrypt, decrypt, auth_token }
    }

    /// Encrypts `buf` in place. Only frame *bodies* pass through this call;
    /// the 4-byte length prefix is never encrypted.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.encrypt.apply_keystream(buf);
    }

    /// Decrypts `buf` in place.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.decrypt.apply_keystream(buf);
    }

    /// Short, human-comparable string derived from the session keys, shown
    /// to the user for out-of-band verification (the "auth token").
    #[must_use]
    pub fn short_auth_token(&self) -> &str {
        &self.auth_token
    }
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("auth_token", &self.auth_token)
            .finish_non_exhaustive()
    }
}

fn derive_stream(digest: &[u8]) -> Aes128Ctr {
    let key: [u8; 16] = digest[..16].try_into().expect("sha256 digest is 32 bytes");
    let iv: [u8; 16] = digest[16..32].try_into().expect("sha256 digest is 32 bytes");
    Aes128Ctr::new(&key.into(), &iv.into())
}

fn derive_auth_token(shared_secret: &[u8; 32], a: &[u8; 32], b: &[u8; 32]) -> String {
    use sha2::{Digest, Sha256};
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(b"nearlink-auth-token");
    hasher.update(shared_secret);
    hasher.update(lo);
    hasher.update(hi);
    let digest = hasher.finalize();
    // Four decimal groups, matching the UKEY2 "visual auth string" convention
    // of a short numeric code the two users read aloud to each other.
    let mut token = String::with_capacity(12);
    for chunk in digest[..4].chunks(1) {
        token.push_str(&format!("{:03}", u16::from(chunk[0])));
    }
    token
}

impl Drop for EncryptionContext {
    fn drop(&mut self) {
        self.auth_token.zeroize();
    }
}
