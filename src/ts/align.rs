use super::{
    PES_VIDEO_STREAM_ID_MAX, PES_VIDEO_STREAM_ID_MIN, PID_PAT, TS_HEADER_SIZE, TS_SYNC_BYTE,
};

/// Returns the byte offset of the first TS packet in `window` that starts a
/// video PES packet, or `None` if the window contains no such packet start.
///
/// A match requires the sync byte, `payload_unit_start_indicator` set, a PID
/// equal to `pid` (any PID when `None` — the lock-on mode used before the
/// video PID is known), and a payload beginning with a PES start code
/// (`00 00 01`) whose stream ID falls in the video range `0xE0..=0xEF`.
///
/// The window does not need to be packet aligned; every byte position is
/// considered. A candidate packet that runs past the end of the window
/// cannot be confirmed and is not reported — the caller retries once more
/// bytes have arrived.
pub fn video_pes_start(window: &[u8], pid: Option<u16>) -> Option<usize> {
    scan(window, |packet| {
        let header = match Header::parse(packet) {
            Some(h) => h,
            None => return false,
        };
        if !header.payload_unit_start {
            return false;
        }
        if let Some(want) = pid {
            if header.pid != want {
                return false;
            }
        }
        let payload = match header.payload(packet) {
            Some(p) => p,
            None => return false,
        };
        if payload.len() < 4 {
            return false;
        }
        payload[0] == 0x00
            && payload[1] == 0x00
            && payload[2] == 0x01
            && (PES_VIDEO_STREAM_ID_MIN..=PES_VIDEO_STREAM_ID_MAX).contains(&payload[3])
    })
}

/// Returns the byte offset of the first TS packet in `window` that starts a
/// PAT section (PID 0 with `payload_unit_start_indicator` set), or `None`.
pub fn pat_start(window: &[u8]) -> Option<usize> {
    scan(window, |packet| {
        match Header::parse(packet) {
            Some(h) => h.payload_unit_start && h.pid == PID_PAT,
            None => false,
        }
    })
}

/// Returns the byte offset of the first TS packet in `window` whose
/// adaptation field carries the random-access indicator, or `None`.
///
/// When `pid` is `Some`, only packets on that PID qualify; `None` accepts
/// a random-access point on any PID.
pub fn random_access_start(window: &[u8], pid: Option<u16>) -> Option<usize> {
    scan(window, |packet| {
        let header = match Header::parse(packet) {
            Some(h) => h,
            None => return false,
        };
        if let Some(want) = pid {
            if header.pid != want {
                return false;
            }
        }
        if !header.adaptation_field_exists || packet.len() < TS_HEADER_SIZE + 2 {
            return false;
        }
        let length = packet[4] as usize;
        // A zero-length adaptation field has no flags byte.
        length >= 1 && length <= 183 && (packet[5] & 0x40) != 0
    })
}

/// Returns the PID of the TS packet beginning at `window[0]`, or `None`
/// when the slice is too short or does not start with a sync byte.
///
/// The consumer engine uses this to pin the video PID once lock-on has
/// located the first video PES start.
pub fn packet_pid(window: &[u8]) -> Option<u16> {
    Header::parse(window).map(|h| h.pid)
}

/// The fixed 4-byte TS packet header fields the alignment checks need.
struct Header {
    payload_unit_start: bool,
    pid: u16,
    adaptation_field_exists: bool,
    contains_payload: bool,
}

impl Header {
    fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < TS_HEADER_SIZE || packet[0] != TS_SYNC_BYTE {
            return None;
        }
        Some(Self {
            payload_unit_start: (packet[1] & 0x40) != 0,
            pid: (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16,
            adaptation_field_exists: (packet[3] & 0x20) != 0,
            contains_payload: (packet[3] & 0x10) != 0,
        })
    }

    /// The packet payload after any adaptation field, or `None` when the
    /// packet carries no payload or the adaptation length is corrupt.
    fn payload<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if !self.contains_payload {
            return None;
        }
        let offset = if self.adaptation_field_exists {
            if packet.len() < TS_HEADER_SIZE + 1 {
                return None;
            }
            let length = packet[4] as usize;
            if length > 183 {
                return None;
            }
            TS_HEADER_SIZE + 1 + length
        } else {
            TS_HEADER_SIZE
        };
        if offset >= packet.len() {
            return None;
        }
        Some(&packet[offset..])
    }
}

/// Scans every byte offset for a sync byte whose packet satisfies `matches`.
fn scan<F>(window: &[u8], matches: F) -> Option<usize>
where
    F: Fn(&[u8]) -> bool,
{
    for offset in 0..window.len() {
        if window[offset] != TS_SYNC_BYTE {
            continue;
        }
        if matches(&window[offset..]) {
            return Some(offset);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::TS_PACKET_SIZE;

    fn ts_packet(pid: u16, payload_start: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = ((pid >> 8) as u8 & 0x1F) | if payload_start { 0x40 } else { 0x00 };
        packet[2] = pid as u8;
        packet[3] = 0x10; // payload only, no adaptation field
        packet[4..4 + payload.len()].copy_from_slice(payload);
        packet
    }

    fn video_pes_packet(pid: u16) -> Vec<u8> {
        ts_packet(pid, true, &[0x00, 0x00, 0x01, 0xE0, 0x00, 0x00])
    }

    fn rai_packet(pid: u16) -> Vec<u8> {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = (pid >> 8) as u8 & 0x1F;
        packet[2] = pid as u8;
        packet[3] = 0x30; // adaptation field + payload
        packet[4] = 0x07; // adaptation field length
        packet[5] = 0x40; // random access indicator
        packet
    }

    fn filler_packet(pid: u16) -> Vec<u8> {
        ts_packet(pid, false, &[0xFF; 32])
    }

    #[test]
    fn test_video_pes_start_any_pid() {
        let mut window = Vec::new();
        window.extend_from_slice(&filler_packet(0x100));
        window.extend_from_slice(&filler_packet(0x100));
        window.extend_from_slice(&video_pes_packet(0x100));

        assert_eq!(video_pes_start(&window, None), Some(TS_PACKET_SIZE * 2));
    }

    #[test]
    fn test_video_pes_start_locked_pid() {
        let mut window = Vec::new();
        window.extend_from_slice(&video_pes_packet(0x200));
        window.extend_from_slice(&video_pes_packet(0x100));

        // Any-PID mode finds the first start; a locked PID skips past it.
        assert_eq!(video_pes_start(&window, None), Some(0));
        assert_eq!(video_pes_start(&window, Some(0x100)), Some(TS_PACKET_SIZE));
        assert_eq!(video_pes_start(&window, Some(0x300)), None);
    }

    #[test]
    fn test_video_pes_start_idempotent() {
        // A window that already begins on a PES start reports offset 0.
        let window = video_pes_packet(0x100);
        let offset = video_pes_start(&window, None).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(video_pes_start(&window[offset..], None), Some(0));
    }

    #[test]
    fn test_video_pes_start_skips_audio_stream_ids() {
        // 0xC0 is an audio stream ID; it must not qualify as a video start.
        let window = ts_packet(0x101, true, &[0x00, 0x00, 0x01, 0xC0]);
        assert_eq!(video_pes_start(&window, None), None);
    }

    #[test]
    fn test_video_pes_start_behind_adaptation_field() {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x41; // payload start, PID 0x100 high bits
        packet[2] = 0x00;
        packet[3] = 0x30; // adaptation field + payload
        packet[4] = 0x05; // adaptation field length
        packet[10..14].copy_from_slice(&[0x00, 0x00, 0x01, 0xE5]);

        assert_eq!(video_pes_start(&packet, Some(0x100)), Some(0));
    }

    #[test]
    fn test_pat_start() {
        let mut window = Vec::new();
        window.extend_from_slice(&filler_packet(0x100));
        window.extend_from_slice(&ts_packet(PID_PAT, true, &[0x00, 0x00, 0xB0]));
        window.extend_from_slice(&ts_packet(PID_PAT, true, &[0x00, 0x00, 0xB0]));

        assert_eq!(pat_start(&window), Some(TS_PACKET_SIZE));
        // PID 0 without payload_unit_start does not qualify.
        let cont = ts_packet(PID_PAT, false, &[0xAB]);
        assert_eq!(pat_start(&cont), None);
    }

    #[test]
    fn test_random_access_start() {
        let mut window = Vec::new();
        window.extend_from_slice(&filler_packet(0x100));
        window.extend_from_slice(&rai_packet(0x100));

        assert_eq!(random_access_start(&window, None), Some(TS_PACKET_SIZE));
        assert_eq!(
            random_access_start(&window, Some(0x100)),
            Some(TS_PACKET_SIZE)
        );
        assert_eq!(random_access_start(&window, Some(0x101)), None);
    }

    #[test]
    fn test_window_ending_mid_packet() {
        // The PES start code would land past the end of the truncated
        // window, so the packet cannot be confirmed yet.
        let packet = video_pes_packet(0x100);
        assert_eq!(video_pes_start(&packet[..6], None), None);

        // Once the payload bytes are visible the match is reported.
        assert_eq!(video_pes_start(&packet[..8], None), Some(0));
    }

    #[test]
    fn test_no_match_in_garbage() {
        // Pseudo-random bytes with sync values sprinkled in, but no valid
        // header/payload combination behind any of them.
        let mut window = vec![0u8; 4096];
        for (i, byte) in window.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(31).wrapping_add(7);
        }
        assert_eq!(video_pes_start(&window, None), None);
        assert_eq!(random_access_start(&window, None), None);
    }

    #[test]
    fn test_packet_pid() {
        let packet = video_pes_packet(0x1FFF);
        assert_eq!(packet_pid(&packet), Some(0x1FFF));
        assert_eq!(packet_pid(&packet[..2]), None);
        assert_eq!(packet_pid(&[0x00, 0x01, 0x02, 0x03]), None);
    }
}
