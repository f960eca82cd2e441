//! Bluetooth classic device name and Wi-Fi LAN service info encodings
//! (§4.1): both are base64 of the same V1 advertisement layout used for
//! BLE, with the Bluetooth classic variant always omitting the MAC field.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::wire::ble_advertisement::BleAdvertisement;

/// NSD/mDNS TXT record key the Wi-Fi LAN service info is carried under
/// (§4.1).
pub const SERVICE_INFO_KEY: &str = "n";

/// Encodes `adv` as a Bluetooth classic device name: base64 of the V1
/// layout with the MAC field stripped.
#[must_use]
pub fn bluetooth_device_name(adv: &BleAdvertisement) -> String {
    let mut without_mac = adv.clone();
    without_mac.bluetooth_mac = None;
    BASE64.encode(without_mac.to_bytes())
}

/// Parses a Bluetooth classic device name produced by
/// [`bluetooth_device_name`]. Per §4.1, malformed input fails silently.
#[must_use]
pub fn parse_bluetooth_device_name(name: &str) -> Option<BleAdvertisement> {
    let bytes = BASE64.decode(name).ok()?;
    BleAdvertisement::from_bytes(&bytes)
}

/// Encodes `adv` as the value of the `"n"` TXT record for Wi-Fi LAN NSD
/// advertising: base64 of the same V1 layout.
#[must_use]
pub fn wifi_lan_service_info(adv: &BleAdvertisement) -> String {
    BASE64.encode(adv.to_bytes())
}

/// Parses Wi-Fi LAN service info produced by [`wifi_lan_service_info`].
#[must_use]
pub fn parse_wifi_lan_service_info(value: &str) -> Option<BleAdvertisement> {
    let bytes = BASE64.decode(value).ok()?;
    BleAdvertisement::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointId, EndpointInfo};
    use crate::options::Strategy;

    fn sample() -> BleAdvertisement {
        BleAdvertisement {
            pcp: Strategy::P2pStar,
            service_id_hash: BleAdvertisement::hash_service_id("com.example.chat"),
            endpoint_id: EndpointId::from_bytes(*b"WXYZ"),
            endpoint_name: EndpointInfo::from("desk lamp"),
            bluetooth_mac: Some([9, 8, 7, 6, 5, 4]),
        }
    }

    #[test]
    fn bluetooth_device_name_strips_mac() {
        let encoded = bluetooth_device_name(&sample());
        let decoded = parse_bluetooth_device_name(&encoded).unwrap();
        assert_eq!(decoded.bluetooth_mac, None);
        assert_eq!(decoded.endpoint_id, sample().endpoint_id);
    }

    #[test]
    fn wifi_lan_service_info_roundtrips() {
        let encoded = wifi_lan_service_info(&sample());
        let decoded = parse_wifi_lan_service_info(&encoded).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn garbage_input_fails_silently() {
        assert!(parse_bluetooth_device_name("not valid base64!!").is_none());
        assert!(parse_wifi_lan_service_info("####").is_none());
    }
}
