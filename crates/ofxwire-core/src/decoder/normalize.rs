//! SGML to well-formed markup normalization
//!
//! OFX 1.x lets leaf elements omit their closing tag and relies on the next
//! `<` to end them. The normalizer makes a single forward pass over the
//! token stream and writes canonical markup:
//!
//! - whitespace around tags is dropped and text values are trimmed
//! - dots are stripped from element names (`INTU.BID` becomes `INTUBID`)
//! - every open tag followed by text gets exactly one closing tag
//! - aggregates keep the closing tags the source gave them
//!
//! The output is a fixed point: normalizing it again yields the same string.

use tracing::debug;

use crate::error::{Error, Result};

/// A lexical unit of OFX SGML
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    Open(&'a str),
    Close(&'a str),
    Text(&'a str),
}

/// Forward scanner over SGML markup
///
/// Comments and processing instructions (`<!...>`, `<?...>`) are skipped.
/// Whitespace-only text between tags produces no token.
pub(crate) struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
    offset: usize,
}

impl<'a> Tokenizer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self::with_offset(input, 0)
    }

    /// `offset` is added to byte positions in error messages
    pub(crate) fn with_offset(input: &'a str, offset: usize) -> Self {
        Self {
            input,
            pos: 0,
            offset,
        }
    }

    fn fail(&mut self, what: &str) -> Option<Result<Token<'a>>> {
        let at = self.offset + self.pos;
        self.pos = self.input.len();
        Some(Err(Error::data_parsing(format!("{} at byte {}", what, at))))
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = &self.input[self.pos..];
            if rest.is_empty() {
                return None;
            }

            if rest.starts_with('<') {
                let Some(end) = rest.find('>') else {
                    return self.fail("unterminated tag");
                };
                let inner = &rest[1..end];

                if inner.starts_with('?') || inner.starts_with('!') {
                    self.pos += end + 1;
                    continue;
                }

                if let Some(name) = inner.strip_prefix('/') {
                    let name = name.trim();
                    if name.is_empty() {
                        return self.fail("empty closing tag");
                    }
                    self.pos += end + 1;
                    return Some(Ok(Token::Close(name)));
                }

                let Some(name) = inner.split_whitespace().next() else {
                    return self.fail("empty tag");
                };
                self.pos += end + 1;
                return Some(Ok(Token::Open(name)));
            }

            let end = rest.find('<').unwrap_or(rest.len());
            let text = rest[..end].trim();
            self.pos += end;
            if !text.is_empty() {
                return Some(Ok(Token::Text(text)));
            }
        }
    }
}

#[derive(Debug)]
struct PendingOpen {
    name: String,
    dotted: bool,
}

/// Streaming normalizer state
///
/// Tokens may be pushed from consecutive chunks of the same document; the
/// output does not depend on where the chunks were split as long as every
/// split falls on a `<`.
#[derive(Debug, Default)]
pub(crate) struct Normalizer {
    out: String,
    /// Open tag written with nothing after it yet
    pending: Option<PendingOpen>,
    /// Leaf whose value was written but not yet closed
    open_leaf: Option<String>,
    /// Dotted elements closed early as empty leaves; their explicit close is dropped
    orphaned: Vec<String>,
}

impl Normalizer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            out: String::with_capacity(capacity),
            ..Default::default()
        }
    }

    pub(crate) fn push(&mut self, token: Token<'_>) {
        match token {
            Token::Open(raw) => {
                self.close_leaf();
                self.settle_pending();
                let (name, dotted) = strip_dots(raw);
                self.write_open(&name);
                self.pending = Some(PendingOpen { name, dotted });
            }
            Token::Text(text) => {
                if let Some(pending) = self.pending.take() {
                    self.out.push_str(text);
                    self.open_leaf = Some(pending.name);
                } else if self.open_leaf.is_some() {
                    // value split by a skipped comment
                    self.out.push_str(text);
                } else {
                    debug!(len = text.len(), "dropping text outside of a leaf element");
                }
            }
            Token::Close(raw) => {
                let (name, dotted) = strip_dots(raw);

                if self.open_leaf.as_deref() == Some(name.as_str()) {
                    self.open_leaf = None;
                    self.write_close(&name);
                    return;
                }
                self.close_leaf();

                if let Some(pending) = self.pending.take() {
                    if pending.name == name {
                        self.write_close(&name);
                        return;
                    }
                    self.pending = Some(pending);
                    self.settle_pending();
                }

                if dotted {
                    if let Some(pos) = self.orphaned.iter().rposition(|o| *o == name) {
                        self.orphaned.remove(pos);
                        return;
                    }
                }
                self.write_close(&name);
            }
        }
    }

    pub(crate) fn finish(mut self) -> String {
        self.close_leaf();
        self.settle_pending();
        self.out
    }

    fn close_leaf(&mut self) {
        if let Some(name) = self.open_leaf.take() {
            self.write_close(&name);
        }
    }

    /// A dotted element with no text is an empty leaf
    fn settle_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            if pending.dotted {
                self.write_close(&pending.name);
                self.orphaned.push(pending.name);
            }
        }
    }

    fn write_open(&mut self, name: &str) {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
    }

    fn write_close(&mut self, name: &str) {
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
    }
}

fn strip_dots(raw: &str) -> (String, bool) {
    if raw.contains('.') {
        (raw.replace('.', ""), true)
    } else {
        (raw.to_string(), false)
    }
}

/// Normalize an SGML body in one pass
pub fn normalize(body: &str) -> Result<String> {
    let mut normalizer = Normalizer::with_capacity(body.len());
    for token in Tokenizer::new(body) {
        normalizer.push(token?);
    }
    Ok(normalizer.finish())
}

/// Normalize an in-memory SGML body chunk by chunk
///
/// Produces exactly the same output as [`normalize`]. The body is already
/// resident, so this only bounds the tokenizer's window; use
/// [`StreamNormalizer`] when the input should not be held whole.
pub fn normalize_chunked(body: &str, chunk_size: usize) -> Result<String> {
    let mut normalizer = Normalizer::default();
    let mut offset = 0;
    for chunk in chunks(body, chunk_size) {
        for token in Tokenizer::with_offset(chunk, offset) {
            normalizer.push(token?);
        }
        offset += chunk.len();
    }
    Ok(normalizer.finish())
}

/// Incremental normalizer for input that arrives in pieces
///
/// Pieces may be split anywhere, even inside a tag. Only the text after the
/// last `<` seen is held back between calls to [`feed`](Self::feed).
#[derive(Debug, Default)]
pub struct StreamNormalizer {
    normalizer: Normalizer,
    carry: String,
    offset: usize,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, piece: &str) -> Result<()> {
        self.carry.push_str(piece);
        let Some(split) = self.carry.rfind('<').filter(|at| *at > 0) else {
            return Ok(());
        };

        for token in Tokenizer::with_offset(&self.carry[..split], self.offset) {
            self.normalizer.push(token?);
        }
        self.offset += split;
        self.carry.drain(..split);
        Ok(())
    }

    /// Bytes held back waiting for the next `<`
    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    pub fn finish(mut self) -> Result<String> {
        for token in Tokenizer::with_offset(&self.carry, self.offset) {
            self.normalizer.push(token?);
        }
        Ok(self.normalizer.finish())
    }
}

/// Split `body` into pieces of roughly `chunk_size` bytes, each starting at a `<`
pub(crate) fn chunks(body: &str, chunk_size: usize) -> Chunks<'_> {
    Chunks {
        body,
        start: 0,
        chunk_size: chunk_size.max(1),
    }
}

pub(crate) struct Chunks<'a> {
    body: &'a str,
    start: usize,
    chunk_size: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let len = self.body.len();
        if self.start >= len {
            return None;
        }
        let target = self.start + self.chunk_size;
        let split = if target >= len {
            len
        } else {
            // '<' is ASCII so any match is a char boundary
            self.body.as_bytes()[target..]
                .iter()
                .position(|b| *b == b'<')
                .map(|i| target + i)
                .unwrap_or(len)
        };
        let chunk = &self.body[self.start..split];
        self.start = split;
        Some(chunk)
    }
}
