//! RFC 5424 syslog wire format.
//!
//! The log-ring consumer exchanges log entries framed as
//! `<PRI>VER TIMESTAMP HOSTNAME APP-NAME PROCID MSGID [SD] MSG`. This
//! module encodes and decodes that header, maps severities to names, and
//! produces conforming zulu timestamps.
use std::fmt;

use chrono::{SecondsFormat, Utc};

/// Nil field value.
pub const NILVALUE: &str = "-";

pub const MAX_TIMESTAMP: usize = 32;
pub const MAX_HOSTNAME: usize = 255;
pub const MAX_APPNAME: usize = 48;
pub const MAX_PROCID: usize = 128;
pub const MAX_MSGID: usize = 32;

/// Severity levels, syslog-compatible.
pub const LOG_EMERG: u32 = 0;
pub const LOG_ALERT: u32 = 1;
pub const LOG_CRIT: u32 = 2;
pub const LOG_ERR: u32 = 3;
pub const LOG_WARNING: u32 = 4;
pub const LOG_NOTICE: u32 = 5;
pub const LOG_INFO: u32 = 6;
pub const LOG_DEBUG: u32 = 7;

/// User-level facility.
pub const LOG_USER: u32 = 8;

/// Pack a `(severity, facility)` pair into a PRI value.
pub fn pri(severity: u32, facility: u32) -> u32 {
    (severity << 3) | (facility & 7)
}

/// Severity part of a PRI value.
pub fn severity(pri: u32) -> u32 {
    pri >> 3
}

/// Facility part of a PRI value.
pub fn facility(pri: u32) -> u32 {
    pri & 7
}

static SEVERITY_NAMES: [(&str, u32); 8] = [
    ("emerg", LOG_EMERG),
    ("alert", LOG_ALERT),
    ("crit", LOG_CRIT),
    ("err", LOG_ERR),
    ("warning", LOG_WARNING),
    ("notice", LOG_NOTICE),
    ("info", LOG_INFO),
    ("debug", LOG_DEBUG),
];

pub fn severity_to_string(severity: u32) -> &'static str {
    SEVERITY_NAMES
        .iter()
        .find(|(_, n)| *n == severity)
        .map(|(s, _)| *s)
        .unwrap_or(NILVALUE)
}

pub fn string_to_severity(s: &str) -> Option<u32> {
    SEVERITY_NAMES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(s))
        .map(|(_, n)| *n)
}

/// Decoded header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub pri: u32,
    pub version: u32,
    pub timestamp: String,
    pub hostname: String,
    pub appname: String,
    pub procid: String,
    pub msgid: String,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            pri: pri(LOG_INFO, LOG_USER),
            version: 1,
            timestamp: NILVALUE.to_owned(),
            hostname: NILVALUE.to_owned(),
            appname: NILVALUE.to_owned(),
            procid: NILVALUE.to_owned(),
            msgid: NILVALUE.to_owned(),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing PRI delimiter")]
    Pri,
    #[error("bad header field: {0}")]
    Field(&'static str),
    #[error("missing structured data")]
    StructuredData,
}

fn truncate(s: &str, max: usize) -> &str {
    &s[..s.len().min(max)]
}

/// Encode a header, structured data and message into wire form.
///
/// Header fields are truncated to their bounds; the message is masked to
/// ASCII and trailing CR/LF characters are dropped.
pub fn encode(hdr: &Header, sd: &str, msg: &str) -> String {
    let mut masked: String = msg
        .bytes()
        .map(|b| char::from(b & 0x7f))
        .collect();
    while masked.ends_with(['\r', '\n']) {
        masked.pop();
    }
    format!(
        "<{}>{} {} {} {} {} {} {} {}",
        hdr.pri,
        hdr.version,
        truncate(&hdr.timestamp, MAX_TIMESTAMP),
        truncate(&hdr.hostname, MAX_HOSTNAME),
        truncate(&hdr.appname, MAX_APPNAME),
        truncate(&hdr.procid, MAX_PROCID),
        truncate(&hdr.msgid, MAX_MSGID),
        sd,
        masked,
    )
}

fn next_int(p: &mut &str, what: &'static str) -> Result<u32, DecodeError> {
    let digits = p.len() - p.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return Err(DecodeError::Field(what));
    }
    let n: u32 = p[..digits].parse().map_err(|_| DecodeError::Field(what))?;
    // Skip the value and its single delimiter character.
    *p = p.get(digits + 1..).unwrap_or("");
    Ok(n)
}

fn next_str<'a>(p: &mut &'a str, what: &'static str) -> Result<&'a str, DecodeError> {
    let end = p.find(' ').unwrap_or(p.len());
    if end == 0 {
        return Err(DecodeError::Field(what));
    }
    let field = &p[..end];
    *p = p.get(end + 1..).unwrap_or("");
    Ok(field)
}

/// Scan one structured-data element: bracket-balanced, ending at a space at
/// nesting level zero.
fn next_structured_data<'a>(p: &mut &'a str) -> Result<&'a str, DecodeError> {
    let mut level = 0usize;
    for (off, c) in p.char_indices() {
        match c {
            '[' => level += 1,
            ']' => level = level.saturating_sub(1),
            ' ' if level == 0 => {
                let sd = &p[..off];
                *p = &p[off + 1..];
                return Ok(sd);
            }
            _ => {}
        }
    }
    Err(DecodeError::StructuredData)
}

/// Decode a wire-form entry into `(header, structured-data, message)`.
pub fn decode(buf: &str) -> Result<(Header, &str, &str), DecodeError> {
    let mut p = buf.strip_prefix('<').ok_or(DecodeError::Pri)?;
    let pri = next_int(&mut p, "pri")?;
    let version = next_int(&mut p, "version")?;
    let timestamp = next_str(&mut p, "timestamp")?.to_owned();
    let hostname = next_str(&mut p, "hostname")?.to_owned();
    let appname = next_str(&mut p, "appname")?.to_owned();
    let procid = next_str(&mut p, "procid")?.to_owned();
    let msgid = next_str(&mut p, "msgid")?.to_owned();
    let sd = next_structured_data(&mut p)?;
    Ok((
        Header {
            pri,
            version,
            timestamp,
            hostname,
            appname,
            procid,
            msgid,
        },
        sd,
        p,
    ))
}

/// If the message part contains any separator character, truncate the entry
/// at the first one and return `(truncated entry, remainder)`; the
/// remainder has leading separators stripped. Returns `None` when there is
/// nothing to split off.
pub fn split_message(buf: &str, sep: &[char]) -> Option<(String, String)> {
    let (_, _, msg) = decode(buf).ok()?;
    let off = msg.find(|c| sep.contains(&c))?;
    let msg_start = buf.len() - msg.len();
    let xtra = msg[off..].trim_start_matches(|c| sep.contains(&c));
    if xtra.is_empty() {
        return None;
    }
    Some((buf[..msg_start + off].to_owned(), xtra.to_owned()))
}

/// ISO 8601 timestamp that also conforms to the RFC 5424 TIMESTAMP field,
/// e.g. `2003-10-11T22:14:15.003000Z`.
pub fn wallclock_zulu() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode(self, NILVALUE, NILVALUE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static VALID: &[&str] = &[
        "<1>1 - - - - - - message",
        "<23>1 - - - - - - message",
        "<234>111 - - - - - - message",
        "<42>1 1985-04-12T23:20:50.52Z - - - - - message",
        "<42>1 1985-04-12T19:20:50.52-04:00 - - - - - message",
        "<42>1 2003-10-11T22:14:15.003Z - - - - - message",
        "<42>1 2003-08-24T05:14:15.000003-07:00 - - - - - message",
        "<42>1 2016-06-12T22:59:59.816857Z - - - - - message",
        "<42>1 2016-06-12T22:59:59.816857Z 4294967295 - - - - message",
        "<42>1 2016-06-12T22:59:59.816857Z 0 logger procid - - message",
        "<42>1 2016-06-12T22:59:59.816857Z 0 logger - msgid [exampleSDID@32473 iut=\"3\" eventSource=\"Application\" eventID=\"1011\"] message",
        "<42>1 2016-06-12T22:59:59.816857Z 0 logger - msgid [exampleSDID@32473 iut=\"3\"][examplePriority@32473 class=\"high\"] message",
    ];

    #[test]
    fn test_decode_valid() {
        for entry in VALID {
            let (_, _, msg) = decode(entry).unwrap_or_else(|e| panic!("{entry}: {e}"));
            assert_eq!(msg, "message", "{entry}");
        }
    }

    #[test]
    fn test_encode_decode_defaults() {
        let hdr = Header::default();
        let buf = encode(&hdr, NILVALUE, NILVALUE);
        let (decoded, sd, msg) = decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(sd, NILVALUE);
        assert_eq!(msg, NILVALUE);
    }

    #[test]
    fn test_trailing_crlf_dropped() {
        let buf = encode(&Header::default(), NILVALUE, "Hello whorl\n\r\n");
        let (_, _, msg) = decode(&buf).unwrap();
        assert_eq!(msg, "Hello whorl");
    }

    #[test]
    fn test_message_masked_to_ascii() {
        let buf = encode(&Header::default(), NILVALUE, "caf\u{e9}");
        let (_, _, msg) = decode(&buf).unwrap();
        assert!(msg.bytes().all(|b| b < 0x80));
    }

    #[test]
    fn test_split_message() {
        let buf = encode(&Header::default(), NILVALUE, "foo\nbar\nbaz");
        let (buf, xtra) = split_message(&buf, &['\r', '\n']).unwrap();
        assert_eq!(xtra, "bar\nbaz");
        let (_, _, msg) = decode(&buf).unwrap();
        assert_eq!(msg, "foo");

        let buf = encode(&Header::default(), NILVALUE, &xtra);
        let (buf, xtra) = split_message(&buf, &['\r', '\n']).unwrap();
        assert_eq!(xtra, "baz");
        let (_, _, msg) = decode(&buf).unwrap();
        assert_eq!(msg, "bar");

        let buf = encode(&Header::default(), NILVALUE, &xtra);
        assert!(split_message(&buf, &['\r', '\n']).is_none());
    }

    #[test]
    fn test_severity_names() {
        assert_eq!(severity_to_string(LOG_ERR), "err");
        assert_eq!(severity_to_string(LOG_DEBUG), "debug");
        assert_eq!(severity_to_string(99), NILVALUE);
        assert_eq!(string_to_severity("CRIT"), Some(LOG_CRIT));
        assert_eq!(string_to_severity("warning"), Some(LOG_WARNING));
        assert_eq!(string_to_severity("nope"), None);
    }

    #[test]
    fn test_pri_round_trip() {
        let p = pri(LOG_ERR, LOG_USER & 7);
        assert_eq!(severity(p), LOG_ERR);
        assert_eq!(facility(p), LOG_USER & 7);
    }

    #[test]
    fn test_field_truncation() {
        let hdr = Header {
            appname: "x".repeat(100),
            ..Header::default()
        };
        let buf = encode(&hdr, NILVALUE, "m");
        let (decoded, _, _) = decode(&buf).unwrap();
        assert_eq!(decoded.appname.len(), MAX_APPNAME);
    }

    #[test]
    fn test_wallclock_zulu_shape() {
        let ts = wallclock_zulu();
        assert!(ts.ends_with('Z'));
        assert!(ts.len() <= MAX_TIMESTAMP);
        // Round-trips through a header unharmed.
        let hdr = Header {
            timestamp: ts.clone(),
            ..Header::default()
        };
        let buf = encode(&hdr, NILVALUE, "m");
        let (decoded, _, _) = decode(&buf).unwrap();
        assert_eq!(decoded.timestamp, ts);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert_eq!(decode("no pri here").unwrap_err(), DecodeError::Pri);
        assert!(decode("<abc>1 - - - - - - m").is_err());
        assert!(decode("<1>1 - - -").is_err());
    }
}
