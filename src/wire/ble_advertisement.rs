//! BLE advertisement and advertisement-header encodings (§4.1).
//!
//! `BleAdvertisement` is the per-endpoint record broadcast (or placed in a
//! GATT characteristic) during advertising; `BleAdvertisementHeader` is the
//! separate record that carries a Bloom filter over every service id
//! currently advertised on the device, used to anonymize which Nearby
//! service ids are present without listing them (§4.7).

use crate::endpoint::{EndpointId, EndpointInfo, MAX_ENDPOINT_INFO_LEN};
use crate::mediums::bloom_filter::BloomFilter;
use crate::options::Strategy;

const VERSION: u8 = 1;

fn pcp_tag(strategy: Strategy) -> u8 {
    match strategy {
        Strategy::P2pCluster => 1,
        Strategy::P2pStar => 2,
        Strategy::P2pPointToPoint => 3,
    }
}

fn pcp_from_tag(tag: u8) -> Option<Strategy> {
    match tag {
        1 => Some(Strategy::P2pCluster),
        2 => Some(Strategy::P2pStar),
        3 => Some(Strategy::P2pPointToPoint),
        _ => None,
    }
}

/// A single endpoint's BLE advertisement: `[VERSION(3b)|PCP(5b)]
/// [service_id_hash(3)] [endpoint_id(4)] [endpoint_name_size(1)]
/// [endpoint_name(n)] [bluetooth_mac(6)?]` (§4.1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BleAdvertisement {
    pub pcp: Strategy,
    pub service_id_hash: [u8; 3],
    pub endpoint_id: EndpointId,
    pub endpoint_name: EndpointInfo,
    pub bluetooth_mac: Option<[u8; 6]>,
}

impl BleAdvertisement {
    /// Hashes `service_id` down to the 3-byte value placed in the
    /// advertisement, by truncating its SHA-256 digest.
    #[must_use]
    pub fn hash_service_id(service_id: &str) -> [u8; 3] {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(service_id.as_bytes());
        [digest[0], digest[1], digest[2]]
    }

    /// Whether this advertisement's fields are all within encodable bounds.
    /// A name longer than [`MAX_ENDPOINT_INFO_LEN`] is never constructed by
    /// this crate, but the check lives here so it travels with the type.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.endpoint_name.as_bytes().len() <= MAX_ENDPOINT_INFO_LEN
    }

    /// Serializes this advertisement to its compact binary form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.endpoint_name.as_bytes().len() + 6);
        out.push((VERSION << 5) | (pcp_tag(self.pcp) & 0x1F));
        out.extend_from_slice(&self.service_id_hash);
        out.extend_from_slice(self.endpoint_id.as_bytes());
        let name = self.endpoint_name.as_bytes();
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        if let Some(mac) = self.bluetooth_mac {
            out.extend_from_slice(&mac);
        }
        out
    }

    /// Deserializes an advertisement previously produced by
    /// [`BleAdvertisement::to_bytes`].
    ///
    /// Per §4.1 deserialization policy, an unknown version, a wrong length,
    /// or a bad PCP tag fail silently (`None`) rather than panicking — this
    /// covers legacy coexistence with advertisers running older or newer
    /// versions of the protocol.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 1 + 3 + 4 + 1 {
            return None;
        }
        let version = bytes[0] >> 5;
        if version != VERSION {
            return None;
        }
        let pcp = pcp_from_tag(bytes[0] & 0x1F)?;
        let service_id_hash = [bytes[1], bytes[2], bytes[3]];
        let endpoint_id = EndpointId::from_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let name_len = bytes[8] as usize;
        if bytes.len() < 9 + name_len {
            return None;
        }
        let endpoint_name = EndpointInfo::new(bytes[9..9 + name_len].to_vec());
        let rest = &bytes[9 + name_len..];
        let bluetooth_mac = match rest.len() {
            0 => None,
            6 => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(rest);
                Some(mac)
            }
            _ => return None,
        };
        let adv = Self { pcp, service_id_hash, endpoint_id, endpoint_name, bluetooth_mac };
        adv.is_valid().then_some(adv)
    }
}

/// Digest-chaining state used to compute the advertisement header's
/// integrity hash (§4.1): "the first 4 bytes of
/// `SHA256(dummy_id || adv1 || hash1 || adv2 || …)`, chained so that any
/// advertisement change invalidates the digest."
fn chained_advertisement_hash(dummy_service_id: &[u8], advertisements: &[Vec<u8>]) -> [u8; 4] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(dummy_service_id);
    let mut running = Vec::new();
    for adv in advertisements {
        hasher.update(adv);
        running.extend_from_slice(adv);
        let step = Sha256::digest(&running);
        hasher.update(&step);
        running.extend_from_slice(&step);
    }
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// The multi-service advertisement header: `[V(3b)|num_slots(5b)]
/// [service_id_bloom_filter(10)] [advertisement_hash(4)]` (§4.1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BleAdvertisementHeader {
    pub num_slots: u8,
    pub bloom_filter: BloomFilter,
    pub advertisement_hash: [u8; 4],
}

impl BleAdvertisementHeader {
    /// Bloom filter capacity, in bytes, used for the header's service-id
    /// filter (§4.1: a 10-byte filter).
    pub const BLOOM_FILTER_BYTES: usize = 10;

    /// Builds a header over every advertised `service_ids` and the raw
    /// bytes of the corresponding per-endpoint `advertisements`, chaining
    /// the integrity hash as described in §4.1.
    #[must_use]
    pub fn build(
        dummy_service_id: &[u8],
        service_ids: &[String],
        advertisements: &[Vec<u8>],
    ) -> Self {
        let mut bloom_filter = BloomFilter::new(Self::BLOOM_FILTER_BYTES);
        for id in service_ids {
            bloom_filter.insert(id.as_bytes());
        }
        Self {
            num_slots: service_ids.len().min(31) as u8,
            bloom_filter,
            advertisement_hash: chained_advertisement_hash(dummy_service_id, advertisements),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + Self::BLOOM_FILTER_BYTES + 4);
        out.push((VERSION << 5) | (self.num_slots & 0x1F));
        out.extend_from_slice(self.bloom_filter.as_bytes());
        out.extend_from_slice(&self.advertisement_hash);
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 1 + Self::BLOOM_FILTER_BYTES + 4 {
            return None;
        }
        let version = bytes[0] >> 5;
        if version != VERSION {
            return None;
        }
        let num_slots = bytes[0] & 0x1F;
        let bloom_filter = BloomFilter::from_bytes(&bytes[1..1 + Self::BLOOM_FILTER_BYTES]);
        let mut advertisement_hash = [0u8; 4];
        advertisement_hash.copy_from_slice(&bytes[1 + Self::BLOOM_FILTER_BYTES..]);
        Some(Self { num_slots, bloom_filter, advertisement_hash })
    }

    /// Whether `service_id` is possibly one of the ids this header
    /// advertises (§4.7, Bloom filter semantics: false negatives never
    /// occur, false positives are bounded).
    #[must_use]
    pub fn possibly_advertises(&self, service_id: &str) -> bool {
        self.bloom_filter.possibly_contains(service_id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name_len: usize, mac: Option<[u8; 6]>) -> BleAdvertisement {
        BleAdvertisement {
            pcp: Strategy::P2pCluster,
            service_id_hash: BleAdvertisement::hash_service_id("com.example.chat"),
            endpoint_id: EndpointId::from_bytes(*b"ABCD"),
            endpoint_name: EndpointInfo::new(vec![b'x'; name_len]),
            bluetooth_mac: mac,
        }
    }

    #[test]
    fn roundtrips_without_mac() {
        let adv = sample(12, None);
        assert_eq!(BleAdvertisement::from_bytes(&adv.to_bytes()), Some(adv));
    }

    #[test]
    fn roundtrips_with_mac_and_max_name() {
        let adv = sample(MAX_ENDPOINT_INFO_LEN, Some([1, 2, 3, 4, 5, 6]));
        assert_eq!(BleAdvertisement::from_bytes(&adv.to_bytes()), Some(adv));
    }

    #[test]
    fn unknown_version_fails_silently() {
        let adv = sample(4, None);
        let mut bytes = adv.to_bytes();
        bytes[0] = (7 << 5) | (bytes[0] & 0x1F);
        assert_eq!(BleAdvertisement::from_bytes(&bytes), None);
    }

    #[test]
    fn bad_pcp_fails_silently() {
        let adv = sample(4, None);
        let mut bytes = adv.to_bytes();
        bytes[0] = (VERSION << 5) | 0x1F;
        assert_eq!(BleAdvertisement::from_bytes(&bytes), None);
    }

    #[test]
    fn truncated_input_fails_silently() {
        let adv = sample(4, None);
        let bytes = adv.to_bytes();
        assert_eq!(BleAdvertisement::from_bytes(&bytes[..bytes.len() - 2]), None);
    }

    #[test]
    fn header_roundtrips_and_chained_hash_changes_with_content() {
        let advs = vec![sample(4, None).to_bytes(), sample(6, None).to_bytes()];
        let ids = vec!["svc-a".to_string(), "svc-b".to_string()];
        let header = BleAdvertisementHeader::build(b"dummy", &ids, &advs);
        assert_eq!(BleAdvertisementHeader::from_bytes(&header.to_bytes()), Some(header.clone()));
        assert!(header.possibly_advertises("svc-a"));

        let advs2 = vec![sample(4, None).to_bytes(), sample(7, None).to_bytes()];
        let header2 = BleAdvertisementHeader::build(b"dummy", &ids, &advs2);
        assert_ne!(header.advertisement_hash, header2.advertisement_hash);
    }
}
