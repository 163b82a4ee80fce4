//! Command channel protocol for A55Link
//!
//! Frames on the command channel are ASCII lines of the form
//! `<prefix><body>\r`. Inbound lines may end with any run of `\r` and `\n`.
//! The co-processor acknowledges requests with a bare `OK` line.

use crate::error::{LinkError, LinkResult};
use crate::types::{AckToken, ParamRecord};

/// Terminator appended to every outbound frame
pub const FRAME_TERMINATOR: u8 = b'\r';

/// Maximum command datagram accepted by the gateway
pub const MAX_COMMAND_DATAGRAM: usize = 512;

/// Maximum event datagram accepted by the gateway
pub const MAX_EVENT_DATAGRAM: usize = 256;

/// Longest partial line kept while waiting for a delimiter
pub const MAX_PENDING_LINE: usize = 64 * 1024;

/// Frame prefix identifying the kind of outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePrefix {
    /// Request that expects an acknowledgment
    Request,
    /// File-related request
    File,
    /// Response to a co-processor command
    Response,
    /// File-related response
    FileResponse,
}

impl FramePrefix {
    pub fn to_char(&self) -> char {
        match self {
            FramePrefix::Request => '#',
            FramePrefix::File => '$',
            FramePrefix::Response => '-',
            FramePrefix::FileResponse => '=',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '#' => Some(FramePrefix::Request),
            '$' => Some(FramePrefix::File),
            '-' => Some(FramePrefix::Response),
            '=' => Some(FramePrefix::FileResponse),
            _ => None,
        }
    }
}

/// Build an outbound frame: prefix, body, terminator
pub fn encode_frame(prefix: FramePrefix, body: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 2);
    let mut tmp = [0u8; 4];
    frame.extend_from_slice(prefix.to_char().encode_utf8(&mut tmp).as_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame.push(FRAME_TERMINATOR);
    frame
}

fn is_delimiter(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// Accumulates raw channel bytes and splits them into text lines.
///
/// A run of `\r`/`\n` bytes counts as a single delimiter. Lines are decoded
/// lossily, trimmed of whitespace and NULs, and empty lines are skipped.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_pending: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_limit(MAX_PENDING_LINE)
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_pending,
        }
    }

    /// Append a chunk. Returns the number of bytes discarded because an
    /// unterminated line grew past the limit.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        self.buf.extend_from_slice(chunk);

        let tail_start = self
            .buf
            .iter()
            .rposition(|&b| is_delimiter(b))
            .map(|i| i + 1)
            .unwrap_or(0);
        let tail_len = self.buf.len() - tail_start;

        if tail_len > self.max_pending {
            self.buf.truncate(tail_start);
            tail_len
        } else {
            0
        }
    }

    /// Extract the next complete, non-empty line
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let end = self.buf.iter().position(|&b| is_delimiter(b))?;

            let mut drop_to = end + 1;
            while drop_to < self.buf.len() && is_delimiter(self.buf[drop_to]) {
                drop_to += 1;
            }

            let raw: Vec<u8> = self.buf.drain(..drop_to).take(end).collect();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }

    /// Bytes waiting for a delimiter
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Returns true if the line is an acknowledgment after normalization
pub fn is_ack(line: &str) -> bool {
    let clean: String = line
        .chars()
        .filter(|c| !matches!(c, '\0' | '\r' | '\n'))
        .collect();
    clean.trim().eq_ignore_ascii_case("OK")
}

/// Named commands the co-processor may send to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    /// `a55_ping`
    Ping,
    /// `a55_exec <script>`
    Exec { script: Option<String> },
    /// `update_param <addr=val,...>`
    UpdateParam { pairs: String },
    /// `capture <index>`; `None` if the index is missing or not a number
    Capture { index: Option<u32> },
    /// Anything else
    Unknown { name: String },
}

impl InboundCommand {
    /// Parse a non-acknowledgment line. Returns `None` for a line without tokens.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?;

        let cmd = match name {
            "a55_ping" => InboundCommand::Ping,
            "a55_exec" => InboundCommand::Exec {
                script: tokens.next().map(str::to_string),
            },
            "update_param" => InboundCommand::UpdateParam {
                pairs: tokens.collect::<Vec<_>>().join(" "),
            },
            "capture" => InboundCommand::Capture {
                index: tokens
                    .next()
                    .filter(|t| t.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|t| t.parse().ok()),
            },
            other => InboundCommand::Unknown {
                name: other.to_string(),
            },
        };

        Some(cmd)
    }
}

/// A classified inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    Ack(AckToken),
    Command(InboundCommand),
}

impl InboundLine {
    pub fn classify(line: &str) -> Option<Self> {
        if is_ack(line) {
            return Some(InboundLine::Ack(AckToken::ok()));
        }
        InboundCommand::parse(line).map(InboundLine::Command)
    }
}

/// Result of parsing an `update_param` payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamBatch {
    /// Well-formed records in arrival order
    pub records: Vec<ParamRecord>,
    /// Pairs that could not be parsed
    pub rejected: Vec<String>,
}

/// Parse one `0xHEX=decimal` pair
pub fn parse_param_pair(pair: &str) -> Option<ParamRecord> {
    let (addr, value) = pair.split_once('=')?;

    let hex = addr
        .trim()
        .strip_prefix("0x")
        .or_else(|| addr.trim().strip_prefix("0X"))?;
    if hex.is_empty() {
        return None;
    }
    let addr = u32::from_str_radix(hex, 16).ok()?;
    let value = value.trim().parse::<i64>().ok()?;

    Some(ParamRecord::new(addr, value))
}

/// Parse a comma-separated list of parameter pairs, skipping malformed ones
pub fn parse_param_updates(text: &str) -> ParamBatch {
    let mut batch = ParamBatch::default();

    for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match parse_param_pair(pair) {
            Some(record) => batch.records.push(record),
            None => batch.rejected.push(pair.to_string()),
        }
    }

    batch
}

/// An `EVENT <name> <value>` message from a local producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub name: String,
    pub value: String,
}

impl EventMessage {
    pub fn parse(text: &str) -> LinkResult<Self> {
        let parts: Vec<&str> = text.split_whitespace().collect();

        if parts.len() < 3 || !parts[0].eq_ignore_ascii_case("EVENT") {
            return Err(LinkError::protocol(format!("malformed event: {}", text)));
        }

        Ok(Self {
            name: parts[1].to_string(),
            value: parts[2].to_string(),
        })
    }

    /// Command text forwarded to the co-processor
    pub fn to_command(&self) -> String {
        format!("{} {}", self.name, self.value)
    }

    /// Datagram text understood by the gateway
    pub fn to_datagram(&self) -> String {
        format!("EVENT {} {}", self.name, self.value)
    }
}

/// Reply sent by the gateway for a forwarded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayReply {
    Ok,
    Timeout,
    Error(String),
}

impl GatewayReply {
    pub fn to_text(&self) -> String {
        match self {
            GatewayReply::Ok => "OK".to_string(),
            GatewayReply::Timeout => "TIMEOUT".to_string(),
            GatewayReply::Error(reason) => format!("ERROR {}", reason),
        }
    }

    pub fn parse(text: &str) -> LinkResult<Self> {
        let text = text.trim();
        match text {
            "OK" => Ok(GatewayReply::Ok),
            "TIMEOUT" => Ok(GatewayReply::Timeout),
            _ => text
                .strip_prefix("ERROR")
                .map(|reason| GatewayReply::Error(reason.trim().to_string()))
                .ok_or_else(|| LinkError::protocol(format!("unknown gateway reply: {}", text))),
        }
    }
}
