//! Endpoint identity types (§3, "Endpoint").

use rand::Rng;

use crate::options::Medium;

/// Maximum length, in bytes, of endpoint info (§3).
pub const MAX_ENDPOINT_INFO_LEN: usize = 131;

/// A remote device as seen by this one during one discovery/connection
/// session: exactly 4 printable-ASCII bytes, randomly generated. Endpoints
/// are owned by the PCP controller and referenced by id everywhere else.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointId([u8; 4]);

const ALPHABET: &[u8; 26] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

impl EndpointId {
    /// Generates a new random endpoint id from 4 printable-ASCII
    /// (uppercase letter) bytes.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 4];
        for b in &mut bytes {
            *b = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        Self(bytes)
    }

    /// Wraps an already-known 4-byte id, e.g. one parsed off the wire.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// The raw 4-byte id.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Renders the id as a `str`. Always valid UTF-8 since the alphabet is
    /// restricted to uppercase ASCII letters.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EndpointId({})", self.as_str())
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, human-readable bytes a client associates with its own endpoint
/// (e.g. a device name), capped at [`MAX_ENDPOINT_INFO_LEN`].
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct EndpointInfo(Vec<u8>);

impl EndpointInfo {
    /// Builds endpoint info, truncating to [`MAX_ENDPOINT_INFO_LEN`] bytes
    /// if necessary (the wire encodings use a 1-byte length prefix and can
    /// never carry more).
    #[must_use]
    pub fn new(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(MAX_ENDPOINT_INFO_LEN);
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EndpointInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "EndpointInfo({s:?})"),
            Err(_) => write!(f, "EndpointInfo({} bytes)", self.0.len()),
        }
    }
}

impl From<&str> for EndpointInfo {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

/// Opaque client identity; every API call is parameterized by one. See §3
/// ("Client handle").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Mints a new random client id. Callers hold onto the returned value
    /// and pass it to every subsequent `Core` method for that client.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    #[inline]
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Endpoint data a client learns out-of-band (QR code, NFC tap, or any
/// discovery channel other than this crate's own BLE/NSD scan loop) and
/// hands to `inject_endpoint` (§6.1) as a shortcut past `start_discovery`.
/// `remote_address` is the name the advertiser registered with
/// [`crate::mediums::platform::PlatformMediums::listen`]; normal discovery
/// instead learns it by decoding a [`crate::wire::BleAdvertisement`] found
/// via [`crate::mediums::platform::PlatformMediums::discover`].
#[derive(Clone, Debug)]
pub struct OutOfBandMetadata {
    pub endpoint_id: EndpointId,
    pub endpoint_name: EndpointInfo,
    pub remote_address: String,
    pub mediums: Vec<Medium>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_printable_ascii() {
        for _ in 0..100 {
            let id = EndpointId::generate();
            assert!(id.as_bytes().iter().all(|b| b.is_ascii_uppercase()));
        }
    }

    #[test]
    fn endpoint_info_truncates() {
        let info = EndpointInfo::new(vec![b'x'; 500]);
        assert_eq!(info.as_bytes().len(), MAX_ENDPOINT_INFO_LEN);
    }
}
