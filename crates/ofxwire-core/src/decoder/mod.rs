//! OFX response decoding
//!
//! A raw response is split at the first `<OFX` into a header block and an
//! SGML body. The body is normalized into well-formed markup (see
//! [`normalize`]) and then parsed into a `serde_json::Value` tree where:
//!
//! - element names are object keys, in source order
//! - leaf values are strings
//! - a name repeated under the same parent becomes an array
//! - a name that occurs once stays a single object or string
//!
//! The last rule means a statement with one `STMTTRN` and one with many have
//! different shapes; [`ParsedResponse::list_at`] reads either.

pub mod normalize;
mod tree;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::OfxHeaders;

pub use normalize::{normalize, normalize_chunked, StreamNormalizer};

/// Decoder tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Bodies larger than this are normalized in chunks
    pub chunk_threshold_bytes: usize,
    /// Target chunk size for the chunked path
    pub chunk_size: usize,
    /// Bodies with more `STMTTRN` elements than this are normalized in chunks
    pub transaction_threshold: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_bytes: 1024 * 1024,
            chunk_size: 64 * 1024,
            transaction_threshold: 1000,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::configuration("decoder chunk_size cannot be zero"));
        }
        if self.chunk_threshold_bytes == 0 {
            return Err(Error::configuration(
                "decoder chunk_threshold_bytes cannot be zero",
            ));
        }
        Ok(())
    }
}

/// A decoded OFX response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedResponse {
    header: OfxHeaders,
    body: Value,
    markup: String,
}

/// One `STATUS` aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfxStatus {
    /// Element that carried the status, e.g. `SONRS` or `STMTTRNRS`
    pub source: String,
    pub code: u32,
    pub severity: String,
    pub message: Option<String>,
}

impl OfxStatus {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    fn from_value(source: &str, status: &Value) -> Option<Self> {
        let code = status.get("CODE")?.as_str()?.trim().parse().ok()?;
        Some(Self {
            source: source.to_string(),
            code,
            severity: status
                .get("SEVERITY")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            message: status
                .get("MESSAGE")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Sign-on and transaction statuses found in a response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseStatus {
    pub signon: Option<OfxStatus>,
    pub transactions: Vec<OfxStatus>,
}

impl ResponseStatus {
    /// Statuses in document order, sign-on first
    pub fn iter(&self) -> impl Iterator<Item = &OfxStatus> {
        self.signon.iter().chain(self.transactions.iter())
    }
}

impl ParsedResponse {
    /// Header block fields in source order
    pub fn header(&self) -> &OfxHeaders {
        &self.header
    }

    /// Element tree rooted at `{"OFX": ...}`
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Normalized markup the tree was built from
    pub fn markup(&self) -> &str {
        &self.markup
    }

    /// Look up a node by JSON pointer, e.g. `/OFX/SIGNONMSGSRSV1/SONRS`
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.body.pointer(pointer)
    }

    /// Leaf value at `pointer`
    pub fn text_at(&self, pointer: &str) -> Option<&str> {
        self.get(pointer).and_then(Value::as_str)
    }

    /// Node at `pointer` as a list, whether it occurred once or many times
    pub fn list_at(&self, pointer: &str) -> Vec<&Value> {
        match self.get(pointer) {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        }
    }

    /// Sign-on and per-transaction `STATUS` aggregates
    pub fn status(&self) -> ResponseStatus {
        let mut status = ResponseStatus::default();
        let Some(ofx) = self.body.get("OFX").and_then(Value::as_object) else {
            return status;
        };

        for (set_name, message_set) in ofx {
            if !set_name.ends_with("MSGSRSV1") {
                continue;
            }
            if set_name == "SIGNONMSGSRSV1" {
                status.signon = message_set
                    .get("SONRS")
                    .and_then(|sonrs| sonrs.get("STATUS"))
                    .and_then(|s| OfxStatus::from_value("SONRS", s));
                continue;
            }
            let Some(set) = message_set.as_object() else {
                continue;
            };
            for (wrapper, value) in set {
                if !wrapper.ends_with("TRNRS") {
                    continue;
                }
                let items: Vec<&Value> = match value {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                status.transactions.extend(
                    items
                        .into_iter()
                        .filter_map(|trn| trn.get("STATUS"))
                        .filter_map(|s| OfxStatus::from_value(wrapper, s)),
                );
            }
        }
        status
    }

    /// First failing status mapped to a typed error
    ///
    /// A transported response with a non-zero status is still a successful
    /// call; this is for callers that want to treat it as a failure.
    pub fn status_error(&self) -> Option<Error> {
        self.status()
            .iter()
            .find(|s| !s.is_success() && !s.severity.eq_ignore_ascii_case("INFO"))
            .map(|s| Error::from_ofx_status(s.code, s.message.clone()))
    }
}

/// Response decoder
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decode a raw response body
    pub fn decode(&self, raw: &str) -> Result<ParsedResponse> {
        let root = find_ofx_root(raw)
            .ok_or_else(|| Error::data_parsing("response has no <OFX> root element"))?;
        let (header_block, body) = raw.split_at(root);

        let header = parse_header_block(header_block);
        let markup = if self.uses_chunking(body) {
            debug!(bytes = body.len(), chunk_size = self.config.chunk_size, "normalizing in chunks");
            normalize_chunked(body, self.config.chunk_size)?
        } else {
            normalize(body)?
        };
        assemble(header, markup, raw.len())
    }

    /// Read and decode a response saved on disk
    ///
    /// The file is streamed in `chunk_size` reads, so the raw body is never
    /// held in memory alongside the normalized markup.
    pub async fn decode_file(&self, path: impl AsRef<Path>) -> Result<ParsedResponse> {
        let mut file = tokio::fs::File::open(path.as_ref()).await?;
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut undecoded = Vec::new();
        let mut head = String::new();
        let mut stream: Option<StreamNormalizer> = None;
        let mut total = 0;

        loop {
            let n = file.read(&mut buf).await?;
            total += n;
            undecoded.extend_from_slice(&buf[..n]);
            let text = take_utf8(&mut undecoded, n == 0);

            match stream.as_mut() {
                Some(stream) => stream.feed(&text)?,
                None => {
                    head.push_str(&text);
                    if let Some(root) = find_ofx_root(&head) {
                        let mut started = StreamNormalizer::new();
                        started.feed(&head[root..])?;
                        head.truncate(root);
                        stream = Some(started);
                    }
                }
            }
            if n == 0 {
                break;
            }
        }

        let stream =
            stream.ok_or_else(|| Error::data_parsing("response has no <OFX> root element"))?;
        debug!(bytes = total, chunk_size = self.config.chunk_size, "normalized file as a stream");
        assemble(parse_header_block(&head), stream.finish()?, total)
    }

    /// Whether a body takes the chunked normalization path
    pub fn uses_chunking(&self, body: &str) -> bool {
        body.len() > self.config.chunk_threshold_bytes
            || body
                .match_indices("<STMTTRN>")
                .nth(self.config.transaction_threshold)
                .is_some()
    }
}

fn assemble(header: OfxHeaders, markup: String, raw_len: usize) -> Result<ParsedResponse> {
    let tree = tree::build_tree(&markup)?;

    debug!(
        headers = header.len(),
        bytes = raw_len,
        normalized_bytes = markup.len(),
        "decoded OFX response"
    );

    Ok(ParsedResponse {
        header,
        body: tree,
        markup,
    })
}

/// Lossy-decode the complete part of `pending`, keeping a split trailing sequence
fn take_utf8(pending: &mut Vec<u8>, eof: bool) -> String {
    let keep = if eof { 0 } else { incomplete_tail(pending) };
    let tail = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

/// Length of a multi-byte sequence cut off at the end of `bytes`
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Decode with the default configuration
pub fn decode(raw: &str) -> Result<ParsedResponse> {
    Decoder::default().decode(raw)
}

/// Byte offset of the first case-insensitive `<OFX`
fn find_ofx_root(raw: &str) -> Option<usize> {
    raw.as_bytes()
        .windows(4)
        .position(|w| w.eq_ignore_ascii_case(b"<OFX"))
}

/// `KEY:VALUE` lines; anything else is skipped
fn parse_header_block(block: &str) -> OfxHeaders {
    let mut headers = OfxHeaders::new();
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        headers.insert(key, value.trim());
    }
    headers
}
