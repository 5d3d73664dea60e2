use crate::{Result, TunerError};
use bytes::{BufMut, BytesMut};

// Packet types
/// Discover request packet type
pub const TYPE_DISCOVER_REQ: u16 = 0x0002;
/// Discover reply packet type
pub const TYPE_DISCOVER_RSP: u16 = 0x0003;

// TLV tags
/// Device type tag (u32 value)
pub const TAG_DEVICE_TYPE: u8 = 0x01;
/// Device ID tag (u32 value)
pub const TAG_DEVICE_ID: u8 = 0x02;
/// Tuner count tag (u8 value)
pub const TAG_TUNER_COUNT: u8 = 0x10;
/// Base URL tag (string value)
pub const TAG_BASE_URL: u8 = 0x2A;

// Well-known values
/// Device type value identifying a tuner
pub const DEVICE_TYPE_TUNER: u32 = 0x0000_0001;
/// Device ID wildcard matching every device
pub const DEVICE_ID_WILDCARD: u32 = 0xFFFF_FFFF;

/// Default UDP port of the HDHomeRun discovery protocol.
pub const DEFAULT_DISCOVERY_PORT: u16 = 65001;

/// A parsed discover reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverReply {
    /// Device type TLV, if present.
    pub device_type: Option<u32>,
    /// 32-bit device ID, the stable identity of the tuner.
    pub device_id: Option<u32>,
    /// Count of physical tuners on the device.
    pub tuner_count: Option<u8>,
    /// HTTP base URL advertised by the device.
    pub base_url: Option<String>,
}

impl DiscoverReply {
    /// Whether the reply came from a tuner device.
    pub fn is_tuner(&self) -> bool {
        self.device_type == Some(DEVICE_TYPE_TUNER)
    }
}

fn write_tlv_u32(buf: &mut BytesMut, tag: u8, value: u32) {
    buf.put_u8(tag);
    buf.put_u8(4);
    buf.put_u32(value);
}

/// Builds the discover request probe: a fixed header (type, payload
/// length), a tuner device-type filter, a wildcard device-ID filter, and
/// a trailing big-endian CRC-32 over everything before it.
pub fn build_discover_request() -> Vec<u8> {
    let mut payload = BytesMut::new();
    write_tlv_u32(&mut payload, TAG_DEVICE_TYPE, DEVICE_TYPE_TUNER);
    write_tlv_u32(&mut payload, TAG_DEVICE_ID, DEVICE_ID_WILDCARD);

    let mut frame = BytesMut::with_capacity(payload.len() + 8);
    frame.put_u16(TYPE_DISCOVER_REQ);
    frame.put_u16(payload.len() as u16);
    frame.put(payload);

    let crc = crc32fast::hash(&frame);
    frame.put_u32(crc);
    frame.to_vec()
}

/// Parses a datagram as a discover reply.
///
/// A frame with a bad CRC, a truncated header, or the wrong packet type
/// is rejected; the caller drops (and counts) it. Unknown TLV tags are
/// skipped.
pub fn parse_discover_reply(data: &[u8]) -> Result<DiscoverReply> {
    if data.len() < 8 {
        return Err(TunerError::Parser("discovery frame too short".into()));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let received_crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32fast::hash(body) != received_crc {
        return Err(TunerError::Parser("discovery frame CRC mismatch".into()));
    }

    let packet_type = u16::from_be_bytes([body[0], body[1]]);
    if packet_type != TYPE_DISCOVER_RSP {
        return Err(TunerError::Parser(format!(
            "not a discover reply: type 0x{:04x}",
            packet_type
        )));
    }
    let payload_len = u16::from_be_bytes([body[2], body[3]]) as usize;
    if payload_len > body.len() - 4 {
        return Err(TunerError::Parser("discovery payload length overruns frame".into()));
    }

    let mut reply = DiscoverReply {
        device_type: None,
        device_id: None,
        tuner_count: None,
        base_url: None,
    };

    let payload = &body[4..4 + payload_len];
    let mut pos = 0usize;
    while pos + 2 <= payload.len() {
        let tag = payload[pos];
        let mut length = payload[pos + 1] as usize;
        pos += 2;
        // Lengths 0x80 and up use an extended big-endian form.
        if length & 0x80 != 0 {
            let extra = length & 0x7F;
            if pos + extra > payload.len() {
                break;
            }
            length = payload[pos..pos + extra]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            pos += extra;
        }
        if pos + length > payload.len() {
            break;
        }
        let value = &payload[pos..pos + length];
        pos += length;

        match tag {
            TAG_DEVICE_TYPE if length == 4 => {
                reply.device_type = Some(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]));
            }
            TAG_DEVICE_ID if length == 4 => {
                reply.device_id = Some(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]));
            }
            TAG_TUNER_COUNT if length == 1 => {
                reply.tuner_count = Some(value[0]);
            }
            TAG_BASE_URL => {
                reply.base_url = Some(String::from_utf8_lossy(value).into_owned());
            }
            _ => {}
        }
    }

    Ok(reply)
}

/// Builds a discover reply frame. Production code never sends one; the
/// scripted responders in the test suite do.
#[cfg(test)]
pub fn build_discover_reply(
    device_id: u32,
    tuner_count: u8,
    base_url: Option<&str>,
) -> Vec<u8> {
    let mut payload = BytesMut::new();
    write_tlv_u32(&mut payload, TAG_DEVICE_TYPE, DEVICE_TYPE_TUNER);
    write_tlv_u32(&mut payload, TAG_DEVICE_ID, device_id);
    payload.put_u8(TAG_TUNER_COUNT);
    payload.put_u8(1);
    payload.put_u8(tuner_count);
    if let Some(url) = base_url {
        payload.put_u8(TAG_BASE_URL);
        payload.put_u8(url.len() as u8);
        payload.put_slice(url.as_bytes());
    }

    let mut frame = BytesMut::with_capacity(payload.len() + 8);
    frame.put_u16(TYPE_DISCOVER_RSP);
    frame.put_u16(payload.len() as u16);
    frame.put(payload);
    let crc = crc32fast::hash(&frame);
    frame.put_u32(crc);
    frame.to_vec()
}
