/// Errors produced by the key-agreement handshake or frame cipher.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// The peer's handshake message was malformed or too short to parse.
    #[error("malformed handshake message")]
    MalformedMessage,
    /// A handshake step was invoked after the handshake already completed
    /// or failed.
    #[error("handshake already finished")]
    AlreadyFinished,
    /// The peer's public key failed the contributory-behaviour check
    /// (all-zero Diffie-Hellman output).
    #[error("key agreement produced a degenerate shared secret")]
    DegenerateSharedSecret,
}
