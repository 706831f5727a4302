//! Mode 01 response parsing
//!
//! Adapter clones disagree about spaces, headers and what else ends up in the
//! buffer. A reply is tried against [`MATCH_ORDER`] and the first style that
//! yields enough data bytes for the PID wins:
//!
//! 1. [`FrameStyle::Spaced`]: whitespace-separated byte tokens on one line,
//!    `41 0C 1A F8`, optionally behind CAN header tokens.
//! 2. [`FrameStyle::Compact`]: one line with whitespace removed, header found
//!    anywhere in it, `410C1AF8` or `>>garbage410C1AF8`.
//! 3. [`FrameStyle::Noisy`]: the whole buffer reduced to hex digits, for
//!    frames split across lines or buried in noise.
//!
//! When nothing matches, the reply is classified as empty, an adapter
//! "no data" style marker, a truncated frame, or no match at all.

use crate::error::ParseError;
use crate::pid::{self, Pid, PidResponse};

/// Mode 01 response code
pub const MODE_01_RESPONSE: u8 = 0x41;

/// Adapter status strings that mean "no frame here"
const NO_DATA_MARKERS: [&str; 10] = [
    "NO DATA",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS ERROR",
    "BUS INIT",
    "BUS BUSY",
    "DATA ERROR",
    "BUFFER FULL",
    "STOPPED",
    "ERROR",
];

/// Framing styles, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStyle {
    Spaced,
    Compact,
    Noisy,
}

/// Matcher priority. Earlier entries are trusted more.
pub const MATCH_ORDER: [FrameStyle; 3] = [FrameStyle::Spaced, FrameStyle::Compact, FrameStyle::Noisy];

/// Data bytes located in a reply, and how they were found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub style: FrameStyle,
    pub data: Vec<u8>,
}

/// Outcome of one matcher over a reply
enum Scan {
    Found(Vec<u8>),
    /// Header seen, this many data bytes after it
    Short(usize),
    Absent,
}

/// Locate the data bytes for `pid` in a raw adapter reply
pub fn parse(raw: &str, pid: u8) -> Result<Vec<u8>, ParseError> {
    parse_frame(raw, pid).map(|frame| frame.data)
}

/// Like [`parse`], also reporting which style matched
pub fn parse_frame(raw: &str, pid: u8) -> Result<Frame, ParseError> {
    let width = pid::data_len(pid);
    let mut frame = locate(raw, pid, width)?;
    frame.data.truncate(width);
    Ok(frame)
}

/// Check a `0100` reply for the `41 00` echo.
///
/// Any data byte after the header counts: clones that cut the bitmap short
/// still prove the ECU answered. Returns the bitmap bytes present.
pub fn parse_canary(raw: &str) -> Result<Vec<u8>, ParseError> {
    let supported = Pid::SupportedPids.as_hex();
    let mut frame = locate(raw, supported, 1)?;
    frame.data.truncate(pid::data_len(supported));
    Ok(frame.data)
}

/// Run the matchers in order, accepting the first with `min` data bytes
fn locate(raw: &str, pid: u8, min: usize) -> Result<Frame, ParseError> {
    let upper = raw.to_ascii_uppercase();
    let mut longest_short: Option<usize> = None;

    for style in MATCH_ORDER {
        let scan = match style {
            FrameStyle::Spaced => scan_spaced(&upper, pid, min),
            FrameStyle::Compact => scan_compact(&upper, pid, min),
            FrameStyle::Noisy => scan_noisy(&upper, pid, min),
        };
        match scan {
            Scan::Found(data) => return Ok(Frame { style, data }),
            Scan::Short(got) => {
                longest_short = Some(longest_short.map_or(got, |g| g.max(got)));
            }
            Scan::Absent => {}
        }
    }

    if let Some(got) = longest_short {
        return Err(ParseError::Truncated {
            pid,
            expected: min,
            got,
        });
    }
    if upper.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if let Some(marker) = NO_DATA_MARKERS.iter().find(|m| upper.contains(**m)) {
        return Err(ParseError::NoData((*marker).to_string()));
    }
    Err(ParseError::NoMatch { pid })
}

/// Parse and decode in one step
pub fn parse_response(raw: &str, pid: u8) -> Result<PidResponse, ParseError> {
    let data = parse(raw, pid)?;
    let got = data.len();
    PidResponse::decode(pid, data, pid::now_ms()).ok_or(ParseError::Truncated {
        pid,
        expected: pid::data_len(pid),
        got,
    })
}

/// Whether a reply carries anything shaped like a Mode 01 frame
pub fn has_mode01_frame(raw: &str) -> bool {
    raw.lines().flat_map(|line| line.split('\r')).any(|line| {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        compact.len() >= 4
            && compact.chars().all(|c| c.is_ascii_hexdigit())
            && compact.contains("41")
    })
}

fn lines(upper: &str) -> impl Iterator<Item = &str> {
    upper.split(['\r', '\n']).filter(|line| !line.trim().is_empty())
}

fn hex_byte(token: &str) -> Option<u8> {
    if token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit()) {
        u8::from_str_radix(token, 16).ok()
    } else {
        None
    }
}

/// Bytes of one hex run, paired from its end so an odd leading digit (the
/// first digit of an 11-bit CAN id, or stray noise) is the one left over
fn run_bytes(run: &str) -> impl Iterator<Item = u8> + '_ {
    run.as_bytes()[run.len() % 2..]
        .chunks_exact(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok().and_then(hex_byte))
}

/// Byte-aligned hex content of `text`; anything that is not a hex digit
/// separates runs
fn aligned_bytes(text: &str) -> Vec<u8> {
    text.split(|c: char| !c.is_ascii_hexdigit())
        .flat_map(run_bytes)
        .collect()
}

fn take_width(bytes: Vec<u8>, width: usize) -> Scan {
    if bytes.len() >= width {
        Scan::Found(bytes)
    } else {
        Scan::Short(bytes.len())
    }
}

fn merge(best: Scan, next: Scan) -> Scan {
    match (best, next) {
        (Scan::Found(data), _) | (_, Scan::Found(data)) => Scan::Found(data),
        (Scan::Short(a), Scan::Short(b)) => Scan::Short(a.max(b)),
        (Scan::Short(a), Scan::Absent) | (Scan::Absent, Scan::Short(a)) => Scan::Short(a),
        (Scan::Absent, Scan::Absent) => Scan::Absent,
    }
}

fn scan_spaced(upper: &str, pid: u8, width: usize) -> Scan {
    let mut best = Scan::Absent;
    for line in lines(upper) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }
        for i in 0..tokens.len() - 1 {
            if hex_byte(tokens[i]) == Some(MODE_01_RESPONSE) && hex_byte(tokens[i + 1]) == Some(pid) {
                let data: Vec<u8> = tokens[i + 2..].iter().map_while(|t| hex_byte(t)).collect();
                best = merge(best, take_width(data, width));
                if matches!(best, Scan::Found(_)) {
                    return best;
                }
            }
        }
    }
    best
}

/// Header search over whole bytes only, never across a byte boundary
fn find_after_header(bytes: &[u8], pid: u8, width: usize) -> Scan {
    let mut best = Scan::Absent;
    for (i, pair) in bytes.windows(2).enumerate() {
        if pair == [MODE_01_RESPONSE, pid] {
            best = merge(best, take_width(bytes[i + 2..].to_vec(), width));
            if matches!(best, Scan::Found(_)) {
                return best;
            }
        }
    }
    best
}

fn scan_compact(upper: &str, pid: u8, width: usize) -> Scan {
    let mut best = Scan::Absent;
    for line in lines(upper) {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        best = merge(best, find_after_header(&aligned_bytes(&compact), pid, width));
        if matches!(best, Scan::Found(_)) {
            return best;
        }
    }
    best
}

fn scan_noisy(upper: &str, pid: u8, width: usize) -> Scan {
    find_after_header(&aligned_bytes(upper), pid, width)
}
