//! Shell-integration escape sequence scanning.
//!
//! Shells with OSC 133 integration report command boundaries in-band:
//!
//! - `ESC ] 133 ; C ; <command> ST` when a command line starts executing
//! - `ESC ] 133 ; D ; <exit code> ST` when it finishes
//!
//! where ST is either BEL (0x07) or `ESC \`. [`parse`] extracts those two
//! markers and strips them from the output. Everything else, including other
//! OSC 133 marks (`A`, `B`) and OSC 7 working-directory reports, passes
//! through untouched.
//!
//! [`parse`] only sees one chunk at a time. [`OscStream`] carries a partial
//! marker over to the next chunk so sequences split by PTY reads are still
//! recognized.

use settings::constants::osc::MAX_PENDING_BYTES;
use std::path::PathBuf;

const OSC_133_PREFIX: &[u8] = b"\x1b]133;";
const OSC_7_PREFIX: &[u8] = b"\x1b]7;";

/// A shell-integration marker found in terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscEvent {
    /// `133;C`: a command line started executing.
    CommandStart { command: String },
    /// `133;D`: the running command finished.
    CommandDone { exit_code: i32 },
}

/// Result of scanning one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedChunk {
    /// Markers in order of appearance.
    pub events: Vec<OscEvent>,
    /// The chunk with every recognized marker removed.
    pub clean_data: String,
}

/// Outcome of scanning a marker payload for its terminator.
enum PayloadScan {
    /// Payload length and total bytes consumed including the terminator.
    Terminated { len: usize, consumed: usize },
    /// A line break appeared before any terminator.
    LineBreak,
    /// Ran out of input.
    Unterminated,
}

/// Scan a single chunk for `133;C` and `133;D` markers.
///
/// Payloads are matched up to the first terminator and may not contain a line
/// break. A `D` payload that is not a number yields exit code 0. Unterminated
/// markers are left in `clean_data` as-is.
pub fn parse(chunk: &str) -> ParsedChunk {
    let bytes = chunk.as_bytes();
    let mut events = Vec::new();
    let mut clean_data = String::with_capacity(chunk.len());
    let mut copied = 0;
    let mut pos = 0;

    while let Some(offset) = find_prefix(&bytes[pos..], OSC_133_PREFIX) {
        let start = pos + offset;
        let body = start + OSC_133_PREFIX.len();
        match match_marker(chunk, body) {
            Some((event, end)) => {
                clean_data.push_str(&chunk[copied..start]);
                events.push(event);
                copied = end;
                pos = end;
            }
            None => pos = start + 1,
        }
    }

    clean_data.push_str(&chunk[copied..]);

    ParsedChunk { events, clean_data }
}

/// Try to read `C;<payload>ST` or `D;<payload>ST` starting at `body`.
/// Returns the event and the byte offset just past the terminator.
fn match_marker(chunk: &str, body: usize) -> Option<(OscEvent, usize)> {
    let bytes = chunk.as_bytes();
    let kind = *bytes.get(body)?;
    if !matches!(kind, b'C' | b'D') || bytes.get(body + 1) != Some(&b';') {
        return None;
    }

    let payload_start = body + 2;
    let PayloadScan::Terminated { len, consumed } = scan_payload(&bytes[payload_start..]) else {
        return None;
    };

    // Every byte that ends a payload is ASCII, so these are char boundaries.
    let payload = &chunk[payload_start..payload_start + len];
    let event = if kind == b'C' {
        OscEvent::CommandStart {
            command: payload.to_string(),
        }
    } else {
        OscEvent::CommandDone {
            exit_code: parse_exit_code(payload),
        }
    };
    Some((event, payload_start + consumed))
}

/// Find the first terminator (BEL or `ESC \`), stopping at line breaks.
fn scan_payload(data: &[u8]) -> PayloadScan {
    for (i, &byte) in data.iter().enumerate() {
        match byte {
            0x07 => {
                return PayloadScan::Terminated {
                    len: i,
                    consumed: i + 1,
                }
            }
            0x1b if data.get(i + 1) == Some(&b'\\') => {
                return PayloadScan::Terminated {
                    len: i,
                    consumed: i + 2,
                }
            }
            b'\n' | b'\r' => return PayloadScan::LineBreak,
            _ => {}
        }
    }
    PayloadScan::Unterminated
}

/// Leading-integer parse: optional whitespace and sign, then digits.
/// Anything unparseable is 0.
fn parse_exit_code(payload: &str) -> i32 {
    let trimmed = payload.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    match digits[..end].parse::<i64>() {
        Ok(value) => {
            let value = if negative { -value } else { value };
            value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
        }
        Err(_) => 0,
    }
}

/// Find the prefix in a byte slice (simple linear scan).
fn find_prefix(haystack: &[u8], prefix: &[u8]) -> Option<usize> {
    haystack.windows(prefix.len()).position(|w| w == prefix)
}

/// Stateful wrapper around [`parse`] that holds back a trailing partial
/// marker until the next chunk completes it.
///
/// A tail is held when it is a prefix of `ESC ] 133 ;`, or an unterminated
/// `C`/`D` marker without a line break. Tails longer than the pending limit
/// are released as plain output.
#[derive(Debug, Default)]
pub struct OscStream {
    pending: String,
}

impl OscStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the next chunk, prefixed by whatever was held back last time.
    pub fn push(&mut self, chunk: &str) -> ParsedChunk {
        let mut input = std::mem::take(&mut self.pending);
        input.push_str(chunk);

        let split = holdback_start(input.as_bytes());
        let parsed = parse(&input[..split]);
        self.pending = input[split..].to_string();
        parsed
    }

    /// Release any held-back bytes unparsed, e.g. when the process exits.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Whether a partial marker is currently held back.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Offset where the held-back tail begins, or `data.len()` if nothing is held.
fn holdback_start(data: &[u8]) -> usize {
    let window_start = data.len().saturating_sub(MAX_PENDING_BYTES);
    (window_start..data.len())
        .filter(|&i| data[i] == 0x1b)
        .find(|&start| is_incomplete_marker(&data[start..]))
        .unwrap_or(data.len())
}

fn is_incomplete_marker(tail: &[u8]) -> bool {
    if tail.len() < OSC_133_PREFIX.len() {
        return OSC_133_PREFIX.starts_with(tail);
    }
    if !tail.starts_with(OSC_133_PREFIX) {
        return false;
    }
    let rest = &tail[OSC_133_PREFIX.len()..];
    match (rest.first(), rest.get(1)) {
        (None, _) => true,
        (Some(b'C' | b'D'), None) => true,
        (Some(b'C' | b'D'), Some(b';')) => {
            matches!(scan_payload(&rest[2..]), PayloadScan::Unterminated)
        }
        _ => false,
    }
}

/// Return the last complete OSC 7 working-directory report in `chunk`.
///
/// Accepts `file://host/path` (percent-encoded) and bare absolute paths.
/// Malformed reports are skipped.
pub fn parse_osc7_cwd(chunk: &str) -> Option<PathBuf> {
    let bytes = chunk.as_bytes();
    let mut pos = 0;
    let mut latest = None;

    while let Some(offset) = find_prefix(&bytes[pos..], OSC_7_PREFIX) {
        let start = pos + offset + OSC_7_PREFIX.len();
        match scan_payload(&bytes[start..]) {
            PayloadScan::Terminated { len, consumed } => {
                if let Some(path) = decode_osc7_payload(&chunk[start..start + len]) {
                    latest = Some(path);
                }
                pos = start + consumed;
            }
            PayloadScan::LineBreak => pos = start,
            PayloadScan::Unterminated => break,
        }
    }

    latest
}

fn decode_osc7_payload(payload: &str) -> Option<PathBuf> {
    let encoded = match payload.strip_prefix("file://") {
        // Skip the hostname: the path starts at the first slash after it.
        Some(rest) => &rest[rest.find('/')?..],
        None if payload.starts_with('/') => payload,
        None => return None,
    };

    let decoded = urlencoding::decode_binary(encoded.as_bytes());
    let path = String::from_utf8_lossy(&decoded).into_owned();
    if path.is_empty() {
        return None;
    }

    #[cfg(windows)]
    {
        // file:///C:/Users -> C:/Users
        let bytes = path.as_bytes();
        if bytes.len() >= 3 && bytes[0] == b'/' && bytes[2] == b':' {
            return Some(PathBuf::from(&path[1..]));
        }
    }

    Some(PathBuf::from(path))
}
