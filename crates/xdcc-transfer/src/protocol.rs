//! CTCP DCC wire codec: parsing `SEND`/`ACCEPT` offers, encoding `RESUME`
//! requests, and the 32-bit IP / ACK-frame encodings the DCC data channel
//! uses.
//!
//! Grammar (exactly, per the DCC convention): `DCC <cmd> ["|'] <filename>
//! ["|'] <ip_u32> <port_u16> [<filesize_u64>]`. Fields are whitespace
//! separated; the filename may be wrapped in `"` or `'`, and real-world
//! bots mix the two or drop the closing quote entirely — the parser
//! tolerates any combination.

use std::net::Ipv4Addr;

/// A parsed incoming DCC CTCP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMessage {
    /// `DCC SEND <filename> <ip> <port> <filesize>` — filesize 0 means unknown.
    Send {
        filename: String,
        ip: Ipv4Addr,
        port: u16,
        file_size: u64,
    },
    /// `DCC ACCEPT <filename> <port> <position>` — position is the confirmed
    /// resume offset, not a filesize.
    Accept {
        filename: String,
        port: u16,
        position: u64,
    },
    /// Any other DCC verb (`CHAT`, `RECV`, ...) — carried so the caller can
    /// report it as an error bound to the current negotiation.
    Unknown { command: String },
}

/// Failure parsing a `DCC ...` CTCP payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("payload does not start with \"DCC \"")]
    NotDcc,
    #[error("malformed DCC {command} message: {reason}")]
    Malformed { command: String, reason: String },
}

/// Parse a CTCP payload (without the `\x01` delimiters) into a [`DccMessage`].
pub fn parse_dcc(payload: &str) -> Result<DccMessage, ParseError> {
    let rest = payload.strip_prefix("DCC ").ok_or(ParseError::NotDcc)?;
    let rest = rest.trim_start();
    let (command, rest) = split_first_token(rest).ok_or_else(|| ParseError::Malformed {
        command: String::new(),
        reason: "missing command".into(),
    })?;

    match command.to_ascii_uppercase().as_str() {
        "SEND" => parse_send(rest),
        "ACCEPT" => parse_accept(rest),
        other => Ok(DccMessage::Unknown {
            command: other.to_string(),
        }),
    }
}

fn parse_send(rest: &str) -> Result<DccMessage, ParseError> {
    let (filename, rest) = take_filename(rest).ok_or_else(|| ParseError::Malformed {
        command: "SEND".into(),
        reason: "missing filename".into(),
    })?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(ParseError::Malformed {
            command: "SEND".into(),
            reason: format!("expected ip, port, [filesize], got {:?}", fields),
        });
    }

    let ip = parse_ip(fields[0]).ok_or_else(|| ParseError::Malformed {
        command: "SEND".into(),
        reason: format!("bad ip field {:?}", fields[0]),
    })?;
    let port: u16 = fields[1].parse().map_err(|_| ParseError::Malformed {
        command: "SEND".into(),
        reason: format!("bad port field {:?}", fields[1]),
    })?;
    // filesize 0 is legal and means "unknown"; absent is treated the same way.
    let file_size: u64 = match fields.get(2) {
        Some(s) => s.parse().map_err(|_| ParseError::Malformed {
            command: "SEND".into(),
            reason: format!("bad filesize field {:?}", s),
        })?,
        None => 0,
    };

    Ok(DccMessage::Send {
        filename,
        ip,
        port,
        file_size,
    })
}

fn parse_accept(rest: &str) -> Result<DccMessage, ParseError> {
    let (filename, rest) = take_filename(rest).ok_or_else(|| ParseError::Malformed {
        command: "ACCEPT".into(),
        reason: "missing filename".into(),
    })?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(ParseError::Malformed {
            command: "ACCEPT".into(),
            reason: format!("expected port, position, got {:?}", fields),
        });
    }
    let port: u16 = fields[0].parse().map_err(|_| ParseError::Malformed {
        command: "ACCEPT".into(),
        reason: format!("bad port field {:?}", fields[0]),
    })?;
    let position: u64 = fields[1].parse().map_err(|_| ParseError::Malformed {
        command: "ACCEPT".into(),
        reason: format!("bad position field {:?}", fields[1]),
    })?;

    Ok(DccMessage::Accept {
        filename,
        port,
        position,
    })
}

/// Encode a `DCC RESUME` CTCP payload (without `\x01` delimiters).
pub fn encode_resume(filename: &str, port: u16, offset: u64) -> String {
    format!("DCC RESUME {} {} {}", filename, port, offset)
}

/// Decode the peer IPv4 address carried as a decimal u32 (big-endian octets).
fn parse_ip(field: &str) -> Option<Ipv4Addr> {
    let n: u32 = field.parse().ok()?;
    Some(ip_from_u32(n))
}

/// `n` → `a.b.c.d` with `a = (n>>24)&0xff`, ..., `d = n&0xff`.
pub fn ip_from_u32(n: u32) -> Ipv4Addr {
    Ipv4Addr::new(
        ((n >> 24) & 0xff) as u8,
        ((n >> 16) & 0xff) as u8,
        ((n >> 8) & 0xff) as u8,
        (n & 0xff) as u8,
    )
}

/// Inverse of [`ip_from_u32`].
pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from_be_bytes(ip.octets())
}

/// Strip leading whitespace and split off the first whitespace-delimited
/// token (used only for the command word, which is never quoted).
fn split_first_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], s[idx..].trim_start())),
        None => Some((s, "")),
    }
}

/// Take a (possibly quoted, possibly mismatched-quoted) filename off the
/// front of `s`, returning `(filename, remainder)`.
fn take_filename(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let first = s.chars().next().unwrap();
    if first == '"' || first == '\'' {
        // Accept any mix of opening/closing quote char; find the next quote
        // of either kind.
        let inner = &s[1..];
        if let Some(end) = inner.find(['"', '\'']) {
            let filename = inner[..end].to_string();
            let remainder = inner[end + 1..].trim_start();
            return Some((filename, remainder));
        }
        // Unmatched opening quote: fall through and split on whitespace
        // like an unquoted name, since some bots drop the closing quote.
    }
    split_first_token(s)
}

/// Cumulative-bytes ACK frame: a 4-byte big-endian counter, modulo 2^32.
pub const ACK_FRAME_LEN: usize = 4;

/// Encode an ACK frame for `total_bytes_acked` (wrapped to u32 already).
pub fn encode_ack(total_bytes_acked: u32) -> [u8; ACK_FRAME_LEN] {
    total_bytes_acked.to_be_bytes()
}

/// Decode an ACK frame. Returns `None` if `buf` is not exactly 4 bytes.
pub fn decode_ack(buf: &[u8]) -> Option<u32> {
    let arr: [u8; ACK_FRAME_LEN] = buf.try_into().ok()?;
    Some(u32::from_be_bytes(arr))
}

/// Wrap a cumulative byte count into the 32-bit ACK space.
pub fn ack_value(cumulative_bytes: u64) -> u32 {
    (cumulative_bytes % (1u64 << 32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_double_quotes() {
        let msg = parse_dcc("DCC SEND \"a.bin\" 2130706433 5000 5").unwrap();
        assert_eq!(
            msg,
            DccMessage::Send {
                filename: "a.bin".into(),
                ip: Ipv4Addr::new(127, 0, 0, 1),
                port: 5000,
                file_size: 5,
            }
        );
    }

    #[test]
    fn parses_send_unquoted() {
        let msg = parse_dcc("DCC SEND a.bin 2130706433 5000 5").unwrap();
        assert_eq!(
            msg,
            DccMessage::Send {
                filename: "a.bin".into(),
                ip: Ipv4Addr::new(127, 0, 0, 1),
                port: 5000,
                file_size: 5,
            }
        );
    }

    #[test]
    fn parses_send_mismatched_quotes() {
        let msg = parse_dcc("DCC SEND 'a b.bin\" 2130706433 5000 5").unwrap();
        assert_eq!(
            msg,
            DccMessage::Send {
                filename: "a b.bin".into(),
                ip: Ipv4Addr::new(127, 0, 0, 1),
                port: 5000,
                file_size: 5,
            }
        );
    }

    #[test]
    fn send_with_zero_filesize_is_legal() {
        let msg = parse_dcc("DCC SEND a.bin 2130706433 5000 0").unwrap();
        assert_eq!(
            msg,
            DccMessage::Send {
                filename: "a.bin".into(),
                ip: Ipv4Addr::new(127, 0, 0, 1),
                port: 5000,
                file_size: 0,
            }
        );
    }

    #[test]
    fn parses_accept() {
        let msg = parse_dcc("DCC ACCEPT a.bin 5000 3").unwrap();
        assert_eq!(
            msg,
            DccMessage::Accept {
                filename: "a.bin".into(),
                port: 5000,
                position: 3,
            }
        );
    }

    #[test]
    fn unknown_command_is_reported_not_rejected() {
        let msg = parse_dcc("DCC CHAT chat 2130706433 5000").unwrap();
        assert_eq!(
            msg,
            DccMessage::Unknown {
                command: "CHAT".into()
            }
        );
    }

    #[test]
    fn rejects_non_dcc_payload() {
        assert_eq!(parse_dcc("PING 12345"), Err(ParseError::NotDcc));
    }

    #[test]
    fn encode_resume_matches_grammar() {
        assert_eq!(
            encode_resume("a.bin", 5000, 100),
            "DCC RESUME a.bin 5000 100"
        );
    }

    #[test]
    fn ip_roundtrip() {
        for ip in [
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(255, 255, 255, 255),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 42),
        ] {
            assert_eq!(ip_from_u32(ip_to_u32(ip)), ip);
        }
    }

    #[test]
    fn ack_wraps_at_2_32() {
        assert_eq!(ack_value((1u64 << 32) + 5), 5);
        assert_eq!(ack_value(5), 5);
        assert_eq!(
            decode_ack(&encode_ack(ack_value(5_000_000_000))).unwrap(),
            ack_value(5_000_000_000)
        );
    }

    #[test]
    fn decode_ack_rejects_wrong_length() {
        assert_eq!(decode_ack(&[1, 2, 3]), None);
        assert_eq!(decode_ack(&[1, 2, 3, 4, 5]), None);
    }
}
