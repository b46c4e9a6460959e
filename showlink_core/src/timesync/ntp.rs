//! The 48-byte NTP (RFC 2030) packet, reduced to what a time client needs.

use chrono::{DateTime, Utc};

pub const NTP_PACKET_SIZE: usize = 48;
pub const NTP_PORT: u16 = 123;

/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0x1B;
/// LI = 0, VN = 3, Mode = 4 (server).
const SERVER_HEADER: u8 = 0x1C;
const TRANSMIT_OFFSET: usize = 40;

/// Seconds between 1900-01-01 and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

pub fn client_request() -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = CLIENT_HEADER;
    packet
}

pub fn is_client_request(packet: &[u8]) -> bool {
    packet.len() == NTP_PACKET_SIZE && packet[0] & 0x07 == 3
}

/// Server reply carrying `now` as transmit timestamp.
pub fn server_reply(now: DateTime<Utc>) -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = SERVER_HEADER;
    // Stratum 2: synced from a primary source.
    packet[1] = 2;
    let (seconds, fraction) = to_ntp_timestamp(now);
    packet[TRANSMIT_OFFSET..TRANSMIT_OFFSET + 4].copy_from_slice(&seconds.to_be_bytes());
    packet[TRANSMIT_OFFSET + 4..TRANSMIT_OFFSET + 8].copy_from_slice(&fraction.to_be_bytes());
    packet
}

/// Transmit timestamp of a reply as UTC. `None` for short packets or a zero
/// timestamp.
pub fn transmit_time(packet: &[u8]) -> Option<DateTime<Utc>> {
    if packet.len() < NTP_PACKET_SIZE {
        return None;
    }
    let seconds = u32::from_be_bytes(packet[TRANSMIT_OFFSET..TRANSMIT_OFFSET + 4].try_into().ok()?);
    let fraction =
        u32::from_be_bytes(packet[TRANSMIT_OFFSET + 4..TRANSMIT_OFFSET + 8].try_into().ok()?);
    if seconds == 0 && fraction == 0 {
        return None;
    }
    from_ntp_timestamp(seconds, fraction)
}

fn from_ntp_timestamp(seconds: u32, fraction: u32) -> Option<DateTime<Utc>> {
    let millis = seconds as u64 * 1000 + ((fraction as u64 * 1000) >> 32);
    let unix_millis = millis as i64 - (NTP_UNIX_OFFSET * 1000) as i64;
    DateTime::from_timestamp_millis(unix_millis)
}

fn to_ntp_timestamp(time: DateTime<Utc>) -> (u32, u32) {
    let unix_millis = time.timestamp_millis();
    let ntp_millis = (unix_millis + (NTP_UNIX_OFFSET * 1000) as i64).max(0) as u64;
    let seconds = (ntp_millis / 1000) as u32;
    let fraction = (((ntp_millis % 1000) << 32) / 1000) as u32;
    (seconds, fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    #[test]
    fn test_client_request_layout() {
        let packet = client_request();
        assert_eq!(packet[0], 0x1B);
        assert!(packet[1..].iter().all(|b| *b == 0));
        assert!(is_client_request(&packet));
        assert!(!is_client_request(&server_reply(Utc::now())));
        assert!(!is_client_request(&packet[..40]));
    }

    #[test]
    fn test_transmit_timestamp_decoding() {
        // 2024-01-01T00:00:00.500Z: 3913056000 s since 1900, half a second.
        let mut packet = [0u8; NTP_PACKET_SIZE];
        packet[40..44].copy_from_slice(&3_913_056_000u32.to_be_bytes());
        packet[44..48].copy_from_slice(&0x8000_0000u32.to_be_bytes());

        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + TimeDelta::milliseconds(500);
        assert_eq!(transmit_time(&packet), Some(expected));
    }

    #[test]
    fn test_reply_carries_time() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 30, 15).unwrap()
            + TimeDelta::milliseconds(250);
        assert_eq!(transmit_time(&server_reply(now)), Some(now));
        assert_eq!(transmit_time(&client_request()), None);
        assert_eq!(transmit_time(&[0u8; 12]), None);
    }
}
