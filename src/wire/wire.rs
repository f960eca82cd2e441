//! The offline wire protocol: frame taxonomy, length-prefix framing, and
//! medium-specific advertisement/service-info encodings (§4.1).

pub use ble_advertisement::{BleAdvertisement, BleAdvertisementHeader};
pub use frame::{
    BandwidthUpgradeEvent, ConnectionResponseStatus, ControlMarker, OfflineFrame, PacketType,
    PayloadChunk, PayloadHeader, UpgradePathInfo, MAX_FRAME_SIZE,
};
pub use service_info::{bluetooth_device_name, wifi_lan_service_info, SERVICE_INFO_KEY};

mod ble_advertisement;
mod frame;
mod service_info;

/// Reads one length-prefixed frame body from `stream`, per §4.1: a 4-byte
/// big-endian length followed by that many frame bytes. Returns `Ok(None)`
/// on clean EOF before any bytes of the next frame are read.
pub async fn read_framed<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut R,
) -> crate::error::Result<Option<Vec<u8>>> {
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(crate::error::Error::FrameTooLarge { size: len, limit: MAX_FRAME_SIZE });
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one length-prefixed frame body to `stream`.
pub async fn write_framed<W: tokio::io::AsyncWrite + Unpin>(
    stream: &mut W,
    body: &[u8],
) -> crate::error::Result<()> {
    use tokio::io::AsyncWriteExt;

    if body.len() > MAX_FRAME_SIZE {
        return Err(crate::error::Error::FrameTooLarge { size: body.len(), limit: MAX_FRAME_SIZE });
    }
    let len = u32::try_from(body.len()).expect("checked against MAX_FRAME_SIZE above") ;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}
