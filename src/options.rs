//! Strategy, medium, and per-connection option types (§3, §6).

use bitflags::bitflags;

use crate::status::Status;

/// The topology flavor a client selects at advertise/discover time, fixed
/// for the duration of that client's session. See §4.6.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Strategy {
    /// M:N — no topology constraint.
    P2pCluster,
    /// 1:N — the advertiser accepts many, the discoverer accepts one.
    P2pStar,
    /// 1:1 — both sides reject further requests while connected.
    P2pPointToPoint,
}

impl Strategy {
    /// Maximum simultaneous connections the *advertiser* side accepts under
    /// this strategy, or `None` for "unbounded".
    #[must_use]
    pub const fn advertiser_connection_limit(self) -> Option<usize> {
        match self {
            Self::P2pCluster => None,
            Self::P2pStar => None,
            Self::P2pPointToPoint => Some(1),
        }
    }

    /// Maximum simultaneous *outbound* connections the discoverer side of
    /// this strategy may request.
    #[must_use]
    pub const fn discoverer_connection_limit(self) -> Option<usize> {
        match self {
            Self::P2pCluster => None,
            Self::P2pStar | Self::P2pPointToPoint => Some(1),
        }
    }
}

/// A radio medium a connection or advertisement may use.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Medium {
    Ble,
    Bluetooth,
    WifiLan,
    WebRtc,
}

impl Medium {
    /// All mediums. Use [`Medium::preference_rank`], not declaration order,
    /// to compare throughput.
    pub const ALL: [Medium; 4] = [Medium::Ble, Medium::Bluetooth, Medium::WebRtc, Medium::WifiLan];

    /// Throughput-descending preference rank used by the bandwidth-upgrade
    /// orchestrator to pick the best allowed medium (§4.6): higher is
    /// better.
    #[must_use]
    pub const fn preference_rank(self) -> u8 {
        match self {
            Self::Ble => 0,
            Self::Bluetooth => 1,
            Self::WebRtc => 2,
            Self::WifiLan => 3,
        }
    }

    pub(crate) fn error_status(self) -> Status {
        match self {
            Self::Bluetooth => Status::BluetoothError,
            Self::Ble => Status::BleError,
            Self::WifiLan => Status::WifiLanError,
            Self::WebRtc => Status::Error,
        }
    }
}

bitflags! {
    /// Per-connection capability mask over [`Medium`]. See §3 ("Medium").
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct AllowedMediums: u8 {
        const BLE       = 0b0001;
        const BLUETOOTH = 0b0010;
        const WIFI_LAN  = 0b0100;
        const WEB_RTC   = 0b1000;
    }
}

impl AllowedMediums {
    /// Every medium allowed.
    #[must_use]
    pub const fn all_mediums() -> Self {
        Self::all()
    }

    pub(crate) const fn contains_medium(self, medium: Medium) -> bool {
        match medium {
            Medium::Ble => self.contains(Self::BLE),
            Medium::Bluetooth => self.contains(Self::BLUETOOTH),
            Medium::WifiLan => self.contains(Self::WIFI_LAN),
            Medium::WebRtc => self.contains(Self::WEB_RTC),
        }
    }

    /// The highest-preference medium allowed by this mask, if any.
    #[must_use]
    pub fn best(self) -> Option<Medium> {
        Medium::ALL
            .into_iter()
            .filter(|&m| self.contains_medium(m))
            .max_by_key(Medium::preference_rank)
    }
}

impl From<Medium> for AllowedMediums {
    fn from(m: Medium) -> Self {
        match m {
            Medium::Ble => Self::BLE,
            Medium::Bluetooth => Self::BLUETOOTH,
            Medium::WifiLan => Self::WIFI_LAN,
            Medium::WebRtc => Self::WEB_RTC,
        }
    }
}

/// Default keep-alive interval, in milliseconds (§4.4).
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MILLIS: u64 = 5_000;
/// Default keep-alive timeout, in milliseconds (§4.4).
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_MILLIS: u64 = 30_000;

/// Options supplied to `startAdvertising`/`startDiscovery`/`requestConnection`
/// (§6).
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub strategy: Strategy,
    pub allowed_mediums: AllowedMediums,
    pub auto_upgrade_bandwidth: bool,
    pub enforce_topology_constraints: bool,
    pub low_power: bool,
    pub enable_bluetooth_listening: bool,
    pub enable_webrtc_listening: bool,
    pub is_out_of_band_connection: bool,
    pub remote_bluetooth_mac_address: Option<[u8; 6]>,
    pub fast_advertisement_service_uuid: Option<u128>,
    pub keep_alive_interval_millis: u64,
    pub keep_alive_timeout_millis: u64,
}

impl ConnectionOptions {
    /// Creates options for `strategy` with every other field at its
    /// specified default.
    #[must_use]
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            allowed_mediums: AllowedMediums::all_mediums(),
            auto_upgrade_bandwidth: true,
            enforce_topology_constraints: true,
            low_power: false,
            enable_bluetooth_listening: true,
            enable_webrtc_listening: false,
            is_out_of_band_connection: false,
            remote_bluetooth_mac_address: None,
            fast_advertisement_service_uuid: None,
            keep_alive_interval_millis: DEFAULT_KEEP_ALIVE_INTERVAL_MILLIS,
            keep_alive_timeout_millis: DEFAULT_KEEP_ALIVE_TIMEOUT_MILLIS,
        }
    }

    /// Normalizes keep-alive and medium-mask fields in place, per §4.6:
    /// `keep_alive_interval < keep_alive_timeout` and
    /// `keep_alive_interval > 0`, substituting the defaults otherwise; an
    /// out-of-band connection collapses `allowed_mediums` to a single
    /// medium (Bluetooth, unless already set to exactly one), and an empty
    /// mask expands to all mediums.
    pub fn normalize(&mut self) {
        if self.keep_alive_interval_millis == 0
            || self.keep_alive_interval_millis >= self.keep_alive_timeout_millis
        {
            self.keep_alive_interval_millis = DEFAULT_KEEP_ALIVE_INTERVAL_MILLIS;
            self.keep_alive_timeout_millis = DEFAULT_KEEP_ALIVE_TIMEOUT_MILLIS;
        }
        if self.allowed_mediums.is_empty() {
            self.allowed_mediums = AllowedMediums::all_mediums();
        }
        if self.is_out_of_band_connection && self.allowed_mediums.bits().count_ones() != 1 {
            self.allowed_mediums = AllowedMediums::BLUETOOTH;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_replaces_invalid_keep_alive() {
        let mut opts = ConnectionOptions::new(Strategy::P2pCluster);
        opts.keep_alive_interval_millis = 0;
        opts.normalize();
        assert_eq!(opts.keep_alive_interval_millis, DEFAULT_KEEP_ALIVE_INTERVAL_MILLIS);
        assert_eq!(opts.keep_alive_timeout_millis, DEFAULT_KEEP_ALIVE_TIMEOUT_MILLIS);

        let mut opts = ConnectionOptions::new(Strategy::P2pCluster);
        opts.keep_alive_interval_millis = 10_000;
        opts.keep_alive_timeout_millis = 5_000;
        opts.normalize();
        assert_eq!(opts.keep_alive_interval_millis, DEFAULT_KEEP_ALIVE_INTERVAL_MILLIS);
    }

    #[test]
    fn normalize_expands_empty_mask_and_collapses_oob() {
        let mut opts = ConnectionOptions::new(Strategy::P2pCluster);
        opts.allowed_mediums = AllowedMediums::empty();
        opts.normalize();
        assert_eq!(opts.allowed_mediums, AllowedMediums::all_mediums());

        let mut opts = ConnectionOptions::new(Strategy::P2pCluster);
        opts.is_out_of_band_connection = true;
        opts.normalize();
        assert_eq!(opts.allowed_mediums, AllowedMediums::BLUETOOTH);
    }

    #[test]
    fn best_medium_prefers_wifi_lan() {
        let mask = AllowedMediums::BLE | AllowedMediums::WIFI_LAN | AllowedMediums::BLUETOOTH;
        assert_eq!(mask.best(), Some(Medium::WifiLan));
    }
}
