//! `OfflineFrame` encoding (§4.1, §6).
//!
//! This is a hand-written, length-tagged binary encoding rather than a
//! literal protocol-buffer wire format: the specification permits either,
//! as long as framing and field semantics line up ("a hand-written encoder
//! with identical field numbers and tag-lengths is acceptable"). Every
//! frame variant below corresponds 1:1 to a field of the real `OfflineFrame`
//! / `V1Frame` protobuf message, and the numeric `type` tag values match the
//! field numbers called out in §6 (`connection_request` = 1, `connection_response`
//! = 2, `payload_transfer` = 3, `bandwidth_upgrade_negotiation` = 4,
//! `keep_alive` = 5, `disconnection` = 6).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::endpoint::{EndpointId, EndpointInfo};
use crate::error::{Error, Result};
use crate::options::Medium;
use crate::payload::PayloadKind;

/// Implementation-defined cap on a single frame's length, per §4.1.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const TYPE_CONNECTION_REQUEST: u8 = 1;
const TYPE_CONNECTION_RESPONSE: u8 = 2;
const TYPE_PAYLOAD_TRANSFER: u8 = 3;
const TYPE_BANDWIDTH_UPGRADE_NEGOTIATION: u8 = 4;
const TYPE_KEEP_ALIVE: u8 = 5;
const TYPE_DISCONNECTION: u8 = 6;
const TYPE_AUTHENTICATION_MESSAGE: u8 = 7;

/// Current envelope version. §4.1: "all frames are a versioned envelope;
/// current version is `V1`."
const VERSION_V1: u8 = 1;

/// The wire-level message (§3, "Frame").
#[derive(Clone, Debug, PartialEq)]
pub enum OfflineFrame {
    ConnectionRequest {
        endpoint_id: EndpointId,
        endpoint_name: EndpointInfo,
        nonce: u32,
        mediums: Vec<Medium>,
    },
    ConnectionResponse {
        status: ConnectionResponseStatus,
    },
    KeepAlive,
    Disconnection,
    PayloadTransfer {
        packet_type: PacketType,
        header: PayloadHeader,
        chunk: PayloadChunk,
    },
    BandwidthUpgradeNegotiation {
        event: BandwidthUpgradeEvent,
    },
    /// One opaque key-agreement message, exchanged over the not-yet-
    /// encrypted channel during `PENDING_AUTH` (§4.6, §4.8). The core never
    /// inspects `payload`; it only relays it between the channel and
    /// whichever `Ukey2Handshake` is driving the local side.
    AuthenticationMessage {
        payload: Bytes,
    },
}

/// `CONNECTION_RESPONSE.status` (§4.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionResponseStatus {
    Accept,
    Reject,
}

/// `PAYLOAD_TRANSFER.packet_type` (§4.1): CONTROL carries CANCEL or
/// PAYLOAD_ERROR markers, DATA carries an ordinary chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Data,
    Control(ControlMarker),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlMarker {
    Cancel,
    PayloadError,
}

/// `PAYLOAD_TRANSFER.header` (§4.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PayloadHeader {
    pub id: u64,
    pub kind: PayloadKind,
    pub total_size: u64,
}

/// `PAYLOAD_TRANSFER.chunk` (§4.1). `last` is an explicit marker rather than
/// an inferred `offset == total_size`, since an unknown-length stream
/// (`total_size == u64::MAX`) has no offset at which that equality could
/// ever hold (§4.5).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PayloadChunk {
    pub offset: u64,
    pub body: Bytes,
    pub last: bool,
}

/// `BANDWIDTH_UPGRADE_NEGOTIATION` event payload (§4.1, §4.6).
#[derive(Clone, Debug, PartialEq)]
pub enum BandwidthUpgradeEvent {
    UpgradePathAvailable(UpgradePathInfo),
    ClientIntroduction { endpoint_id: EndpointId },
    LastWriteToPriorChannel,
    SafeToClosePriorChannel,
}

/// Addressing info for the medium being upgraded to (§4.1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpgradePathInfo {
    pub medium: Medium,
    pub ip_address: Option<[u8; 4]>,
    pub port: Option<u16>,
    pub ssid: Option<String>,
    pub credentials: Option<String>,
}

// --- encoding -------------------------------------------------------------

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::MalformedFrame("truncated length prefix".into()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::MalformedFrame("truncated byte field".into()));
    }
    Ok(buf.split_to(len))
}

fn encode_medium(m: Medium) -> u8 {
    match m {
        Medium::Ble => 0,
        Medium::Bluetooth => 1,
        Medium::WifiLan => 2,
        Medium::WebRtc => 3,
    }
}

fn decode_medium(tag: u8) -> Result<Medium> {
    match tag {
        0 => Ok(Medium::Ble),
        1 => Ok(Medium::Bluetooth),
        2 => Ok(Medium::WifiLan),
        3 => Ok(Medium::WebRtc),
        _ => Err(Error::MalformedFrame(format!("unknown medium tag {tag}"))),
    }
}

impl OfflineFrame {
    /// Encodes this frame into its wire body (the part that follows the
    /// 4-byte length prefix written by [`crate::wire::write_framed`]).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(VERSION_V1);
        match self {
            OfflineFrame::ConnectionRequest { endpoint_id, endpoint_name, nonce, mediums } => {
                buf.put_u8(TYPE_CONNECTION_REQUEST);
                buf.put_slice(endpoint_id.as_bytes());
                put_bytes(&mut buf, endpoint_name.as_bytes());
                buf.put_u32(*nonce);
                buf.put_u8(mediums.len() as u8);
                for m in mediums {
                    buf.put_u8(encode_medium(*m));
                }
            }
            OfflineFrame::ConnectionResponse { status } => {
                buf.put_u8(TYPE_CONNECTION_RESPONSE);
                buf.put_u8(matches!(status, ConnectionResponseStatus::Accept) as u8);
            }
            OfflineFrame::KeepAlive => {
                buf.put_u8(TYPE_KEEP_ALIVE);
            }
            OfflineFrame::Disconnection => {
                buf.put_u8(TYPE_DISCONNECTION);
            }
            OfflineFrame::PayloadTransfer { packet_type, header, chunk } => {
                buf.put_u8(TYPE_PAYLOAD_TRANSFER);
                match packet_type {
                    PacketType::Data => buf.put_u8(0),
                    PacketType::Control(ControlMarker::Cancel) => buf.put_u8(1),
                    PacketType::Control(ControlMarker::PayloadError) => buf.put_u8(2),
                }
                buf.put_u64(header.id);
                buf.put_u8(match header.kind {
                    PayloadKind::Bytes => 0,
                    PayloadKind::Stream => 1,
                    PayloadKind::File => 2,
                });
                buf.put_u64(header.total_size);
                buf.put_u64(chunk.offset);
                put_bytes(&mut buf, &chunk.body);
                buf.put_u8(chunk.last as u8);
            }
            OfflineFrame::BandwidthUpgradeNegotiation { event } => {
                buf.put_u8(TYPE_BANDWIDTH_UPGRADE_NEGOTIATION);
                encode_bwu_event(&mut buf, event);
            }
            OfflineFrame::AuthenticationMessage { payload } => {
                buf.put_u8(TYPE_AUTHENTICATION_MESSAGE);
                put_bytes(&mut buf, payload);
            }
        }
        buf.freeze()
    }

    /// Decodes a frame body previously produced by [`OfflineFrame::encode`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(body);
        if buf.remaining() < 2 {
            return Err(Error::MalformedFrame("frame shorter than envelope header".into()));
        }
        let version = buf.get_u8();
        if version != VERSION_V1 {
            return Err(Error::MalformedFrame(format!("unsupported envelope version {version}")));
        }
        let typ = buf.get_u8();
        match typ {
            TYPE_CONNECTION_REQUEST => {
                if buf.remaining() < 4 {
                    return Err(Error::MalformedFrame("truncated connection request".into()));
                }
                let mut id_bytes = [0u8; 4];
                buf.copy_to_slice(&mut id_bytes);
                let endpoint_name = EndpointInfo::new(get_bytes(&mut buf)?.to_vec());
                if buf.remaining() < 4 {
                    return Err(Error::MalformedFrame("truncated nonce".into()));
                }
                let nonce = buf.get_u32();
                if buf.remaining() < 1 {
                    return Err(Error::MalformedFrame("truncated medium list".into()));
                }
                let count = buf.get_u8() as usize;
                let mut mediums = Vec::with_capacity(count);
                for _ in 0..count {
                    if buf.remaining() < 1 {
                        return Err(Error::MalformedFrame("truncated medium list".into()));
                    }
                    mediums.push(decode_medium(buf.get_u8())?);
                }
                Ok(OfflineFrame::ConnectionRequest {
                    endpoint_id: EndpointId::from_bytes(id_bytes),
                    endpoint_name,
                    nonce,
                    mediums,
                })
            }
            TYPE_CONNECTION_RESPONSE => {
                if buf.remaining() < 1 {
                    return Err(Error::MalformedFrame("truncated connection response".into()));
                }
                let status = if buf.get_u8() == 1 {
                    ConnectionResponseStatus::Accept
                } else {
                    ConnectionResponseStatus::Reject
                };
                Ok(OfflineFrame::ConnectionResponse { status })
            }
            TYPE_KEEP_ALIVE => Ok(OfflineFrame::KeepAlive),
            TYPE_DISCONNECTION => Ok(OfflineFrame::Disconnection),
            TYPE_PAYLOAD_TRANSFER => {
                if buf.remaining() < 1 + 8 + 1 + 8 + 8 {
                    return Err(Error::MalformedFrame("truncated payload transfer".into()));
                }
                let packet_type = match buf.get_u8() {
                    0 => PacketType::Data,
                    1 => PacketType::Control(ControlMarker::Cancel),
                    2 => PacketType::Control(ControlMarker::PayloadError),
                    other => {
                        return Err(Error::MalformedFrame(format!("unknown packet type {other}")))
                    }
                };
                let id = buf.get_u64();
                let kind = match buf.get_u8() {
                    0 => PayloadKind::Bytes,
                    1 => PayloadKind::Stream,
                    2 => PayloadKind::File,
                    other => return Err(Error::MalformedFrame(format!("unknown payload kind {other}"))),
                };
                let total_size = buf.get_u64();
                let offset = buf.get_u64();
                let body = get_bytes(&mut buf)?;
                if buf.remaining() < 1 {
                    return Err(Error::MalformedFrame("truncated last-chunk marker".into()));
                }
                let last = buf.get_u8() != 0;
                Ok(OfflineFrame::PayloadTransfer {
                    packet_type,
                    header: PayloadHeader { id, kind, total_size },
                    chunk: PayloadChunk { offset, body, last },
                })
            }
            TYPE_BANDWIDTH_UPGRADE_NEGOTIATION => {
                let event = decode_bwu_event(&mut buf)?;
                Ok(OfflineFrame::BandwidthUpgradeNegotiation { event })
            }
            TYPE_AUTHENTICATION_MESSAGE => {
                let payload = get_bytes(&mut buf)?;
                Ok(OfflineFrame::AuthenticationMessage { payload })
            }
            other => Err(Error::MalformedFrame(format!("unknown frame type {other}"))),
        }
    }
}

fn encode_bwu_event(buf: &mut BytesMut, event: &BandwidthUpgradeEvent) {
    match event {
        BandwidthUpgradeEvent::UpgradePathAvailable(info) => {
            buf.put_u8(0);
            buf.put_u8(encode_medium(info.medium));
            buf.put_u8(info.ip_address.is_some() as u8);
            if let Some(ip) = info.ip_address {
                buf.put_slice(&ip);
            }
            buf.put_u8(info.port.is_some() as u8);
            if let Some(port) = info.port {
                buf.put_u16(port);
            }
            put_bytes(buf, info.ssid.as_deref().unwrap_or("").as_bytes());
            put_bytes(buf, info.credentials.as_deref().unwrap_or("").as_bytes());
            buf.put_u8(info.ssid.is_some() as u8);
            buf.put_u8(info.credentials.is_some() as u8);
        }
        BandwidthUpgradeEvent::ClientIntroduction { endpoint_id } => {
            buf.put_u8(1);
            buf.put_slice(endpoint_id.as_bytes());
        }
        BandwidthUpgradeEvent::LastWriteToPriorChannel => buf.put_u8(2),
        BandwidthUpgradeEvent::SafeToClosePriorChannel => buf.put_u8(3),
    }
}

fn decode_bwu_event(buf: &mut Bytes) -> Result<BandwidthUpgradeEvent> {
    if buf.remaining() < 1 {
        return Err(Error::MalformedFrame("truncated bwu event".into()));
    }
    match buf.get_u8() {
        0 => {
            if buf.remaining() < 2 {
                return Err(Error::MalformedFrame("truncated upgrade path info".into()));
            }
            let medium = decode_medium(buf.get_u8())?;
            let has_ip = buf.get_u8() == 1;
            let ip_address = if has_ip {
                if buf.remaining() < 4 {
                    return Err(Error::MalformedFrame("truncated ip address".into()));
                }
                let mut ip = [0u8; 4];
                buf.copy_to_slice(&mut ip);
                Some(ip)
            } else {
                None
            };
            if buf.remaining() < 1 {
                return Err(Error::MalformedFrame("truncated upgrade path info".into()));
            }
            let has_port = buf.get_u8() == 1;
            let port = if has_port {
                if buf.remaining() < 2 {
                    return Err(Error::MalformedFrame("truncated port".into()));
                }
                Some(buf.get_u16())
            } else {
                None
            };
            let ssid_bytes = get_bytes(buf)?;
            let credentials_bytes = get_bytes(buf)?;
            if buf.remaining() < 2 {
                return Err(Error::MalformedFrame("truncated upgrade path info".into()));
            }
            let has_ssid = buf.get_u8() == 1;
            let has_credentials = buf.get_u8() == 1;
            let ssid = has_ssid.then(|| String::from_utf8_lossy(&ssid_bytes).into_owned());
            let credentials =
                has_credentials.then(|| String::from_utf8_lossy(&credentials_bytes).into_owned());
            Ok(BandwidthUpgradeEvent::UpgradePathAvailable(UpgradePathInfo {
                medium,
                ip_address,
                port,
                ssid,
                credentials,
            }))
        }
        1 => {
            if buf.remaining() < 4 {
                return Err(Error::MalformedFrame("truncated client introduction".into()));
            }
            let mut id_bytes = [0u8; 4];
            buf.copy_to_slice(&mut id_bytes);
            Ok(BandwidthUpgradeEvent::ClientIntroduction { endpoint_id: EndpointId::from_bytes(id_bytes) })
        }
        2 => Ok(BandwidthUpgradeEvent::LastWriteToPriorChannel),
        3 => Ok(BandwidthUpgradeEvent::SafeToClosePriorChannel),
        other => Err(Error::MalformedFrame(format!("unknown bwu event tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: OfflineFrame) {
        let encoded = frame.encode();
        let decoded = OfflineFrame::decode(&encoded).expect("decode failed");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn connection_request_roundtrips() {
        roundtrip(OfflineFrame::ConnectionRequest {
            endpoint_id: EndpointId::from_bytes(*b"ABCD"),
            endpoint_name: EndpointInfo::from("Alice's Phone"),
            nonce: 0xDEAD_BEEF,
            mediums: vec![Medium::Bluetooth, Medium::WifiLan],
        });
    }

    #[test]
    fn connection_response_roundtrips() {
        roundtrip(OfflineFrame::ConnectionResponse { status: ConnectionResponseStatus::Accept });
        roundtrip(OfflineFrame::ConnectionResponse { status: ConnectionResponseStatus::Reject });
    }

    #[test]
    fn keep_alive_and_disconnection_roundtrip() {
        roundtrip(OfflineFrame::KeepAlive);
        roundtrip(OfflineFrame::Disconnection);
    }

    #[test]
    fn payload_transfer_roundtrips_with_last_chunk_marker() {
        let header = PayloadHeader { id: 42, kind: PayloadKind::Bytes, total_size: 5 };
        let chunk = PayloadChunk { offset: 0, body: Bytes::from_static(b"hello"), last: false };
        roundtrip(OfflineFrame::PayloadTransfer { packet_type: PacketType::Data, header, chunk });

        let last = PayloadChunk { offset: 5, body: Bytes::new(), last: true };
        roundtrip(OfflineFrame::PayloadTransfer {
            packet_type: PacketType::Data,
            header,
            chunk: last,
        });
    }

    #[test]
    fn payload_transfer_last_chunk_marker_survives_unknown_length() {
        // `total_size == u64::MAX` (unknown-length stream, §4.5) has no
        // offset that could ever equal it, so `last` must be carried
        // explicitly rather than inferred from `offset == total_size`.
        let header = PayloadHeader { id: 9, kind: PayloadKind::Stream, total_size: u64::MAX };
        let chunk = PayloadChunk { offset: 4096, body: Bytes::new(), last: true };
        roundtrip(OfflineFrame::PayloadTransfer { packet_type: PacketType::Data, header, chunk });
    }

    #[test]
    fn cancel_control_chunk_roundtrips() {
        let header = PayloadHeader { id: 7, kind: PayloadKind::Stream, total_size: u64::MAX };
        let chunk = PayloadChunk { offset: 100, body: Bytes::new(), last: false };
        roundtrip(OfflineFrame::PayloadTransfer {
            packet_type: PacketType::Control(ControlMarker::Cancel),
            header,
            chunk,
        });
    }

    #[test]
    fn bwu_upgrade_path_available_roundtrips() {
        roundtrip(OfflineFrame::BandwidthUpgradeNegotiation {
            event: BandwidthUpgradeEvent::UpgradePathAvailable(UpgradePathInfo {
                medium: Medium::WifiLan,
                ip_address: Some([192, 168, 1, 42]),
                port: Some(5200),
                ssid: Some("nearby-abcd".into()),
                credentials: Some("s3cr3t".into()),
            }),
        });
        roundtrip(OfflineFrame::BandwidthUpgradeNegotiation {
            event: BandwidthUpgradeEvent::ClientIntroduction { endpoint_id: EndpointId::from_bytes(*b"WXYZ") },
        });
        roundtrip(OfflineFrame::BandwidthUpgradeNegotiation {
            event: BandwidthUpgradeEvent::LastWriteToPriorChannel,
        });
        roundtrip(OfflineFrame::BandwidthUpgradeNegotiation {
            event: BandwidthUpgradeEvent::SafeToClosePriorChannel,
        });
    }

    #[test]
    fn authentication_message_roundtrips() {
        roundtrip(OfflineFrame::AuthenticationMessage { payload: Bytes::from_static(b"ukey2-handshake-bytes") });
        roundtrip(OfflineFrame::AuthenticationMessage { payload: Bytes::new() });
    }

    #[test]
    fn oversized_frame_is_rejected_before_decode() {
        let err = Error::FrameTooLarge { size: MAX_FRAME_SIZE + 1, limit: MAX_FRAME_SIZE };
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[test]
    fn truncated_frame_fails_cleanly() {
        let encoded = OfflineFrame::ConnectionResponse { status: ConnectionResponseStatus::Accept }.encode();
        let truncated = &encoded[..encoded.len() - 1];
        assert!(OfflineFrame::decode(truncated).is_err());
    }
}
