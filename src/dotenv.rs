//! Line-preserving codec for the vault's dotenv format.
//!
//! Untouched lines are re-emitted byte-for-byte; only lines rewritten through
//! [`Document::upsert`] or the header helpers are re-rendered.

use std::collections::HashMap;

use crate::error::ErrKind;

pub const MARKER_PREFIX: &str = "age:v1:";
pub const HEADER_VERSION: &str = "# si-vault:v2";
pub const DIRECTIVE_PREFIX: &str = "# si-vault:";
pub const RECIPIENT_DIRECTIVE: &str = "# si-vault:recipient";
/// Legacy public-key assignment; never a secret.
pub const PUBLIC_KEY_ENTRY: &str = "SI_VAULT_PUBLIC_KEY";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DotenvError {
    #[error("{}invalid dotenv key {:?}", line_prefix(.line), .key)]
    InvalidKey { line: Option<usize>, key: String },
    #[error("line {line}: duplicate key {key} (first assigned on line {first})")]
    DuplicateKey {
        key: String,
        line: usize,
        first: usize,
    },
    #[error("{}malformed quoted value for {key}", line_prefix(.line))]
    MalformedQuote { line: Option<usize>, key: String },
    #[error("dotenv content is not valid UTF-8")]
    Encoding,
}

impl DotenvError {
    pub fn kind(&self) -> ErrKind {
        match self {
            DotenvError::InvalidKey { .. } => ErrKind::InvalidKey,
            DotenvError::DuplicateKey { .. } => ErrKind::DuplicateKey,
            DotenvError::MalformedQuote { .. } => ErrKind::MalformedQuote,
            DotenvError::Encoding => ErrKind::EncodingError,
        }
    }
}

fn line_prefix(line: &Option<usize>) -> String {
    line.map(|n| format!("line {n}: ")).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub key: String,
    /// Value token exactly as written, quotes included, inline comment excluded.
    pub raw_value: String,
    pub value: String,
    export: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Blank,
    Comment,
    Directive,
    Assignment(Assignment),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    text: String,
    crlf: bool,
    kind: LineKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionScan {
    pub encrypted_keys: Vec<String>,
    pub plaintext_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    lines: Vec<Line>,
    trailing_newline: bool,
}

impl Document {
    pub fn parse(bytes: &[u8]) -> Result<Self, DotenvError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DotenvError::Encoding)?;
        if text.is_empty() {
            return Ok(Self::default());
        }

        let trailing_newline = text.ends_with('\n');
        let body = if trailing_newline {
            &text[..text.len() - 1]
        } else {
            text
        };
        let pieces = body.split('\n').collect::<Vec<_>>();
        let last = pieces.len() - 1;

        let mut lines = Vec::with_capacity(pieces.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (idx, piece) in pieces.into_iter().enumerate() {
            let terminated = idx < last || trailing_newline;
            let (content, crlf) = match piece.strip_suffix('\r') {
                Some(stripped) if terminated => (stripped, true),
                _ => (piece, false),
            };
            let line_no = idx + 1;
            let kind = classify_line(content, line_no)?;
            if let LineKind::Assignment(assignment) = &kind {
                if let Some(first) = seen.insert(assignment.key.clone(), line_no) {
                    return Err(DotenvError::DuplicateKey {
                        key: assignment.key.clone(),
                        line: line_no,
                        first,
                    });
                }
            }
            lines.push(Line {
                text: content.to_string(),
                crlf,
                kind,
            });
        }

        Ok(Self {
            lines,
            trailing_newline,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (idx, line) in self.lines.iter().enumerate() {
            out.push_str(&line.text);
            if idx < last || self.trailing_newline {
                out.push_str(if line.crlf { "\r\n" } else { "\n" });
            }
        }
        out.into_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.assignments()
            .map(|assignment| Entry {
                key: assignment.key.clone(),
                value: assignment.value.clone(),
                encrypted: is_encrypted_marker(&assignment.raw_value),
            })
            .collect()
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.lines.iter().filter_map(|line| match &line.kind {
            LineKind::Assignment(assignment) => Some(assignment),
            _ => None,
        })
    }

    pub fn scan_encryption(&self) -> EncryptionScan {
        let mut scan = EncryptionScan::default();
        for assignment in self.assignments() {
            if is_encrypted_marker(&assignment.raw_value) {
                scan.encrypted_keys.push(assignment.key.clone());
            } else {
                scan.plaintext_keys.push(assignment.key.clone());
            }
        }
        scan
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.find(key).map(|assignment| assignment.value.as_str())
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.find(key).map(|assignment| assignment.raw_value.as_str())
    }

    fn find(&self, key: &str) -> Option<&Assignment> {
        self.assignments().find(|assignment| assignment.key == key)
    }

    /// Replaces the value in place when `key` exists, otherwise appends a line.
    /// Returns whether the document changed.
    pub fn upsert(&mut self, key: &str, raw_value: &str) -> Result<bool, DotenvError> {
        validate_key(key)?;
        let raw_value = raw_value.trim();
        let value = decode_value(raw_value).ok_or_else(|| DotenvError::MalformedQuote {
            line: None,
            key: key.to_string(),
        })?;

        if let Some(line) = self.lines.iter_mut().find(|line| {
            matches!(&line.kind, LineKind::Assignment(assignment) if assignment.key == key)
        }) {
            let export = match &line.kind {
                LineKind::Assignment(assignment) => {
                    if assignment.raw_value == raw_value {
                        return Ok(false);
                    }
                    assignment.export
                }
                _ => false,
            };
            line.text = render_assignment(export, key, raw_value);
            line.kind = LineKind::Assignment(Assignment {
                key: key.to_string(),
                raw_value: raw_value.to_string(),
                value,
                export,
            });
            return Ok(true);
        }

        let crlf = self.prefers_crlf();
        self.lines.push(Line {
            text: render_assignment(false, key, raw_value),
            crlf,
            kind: LineKind::Assignment(Assignment {
                key: key.to_string(),
                raw_value: raw_value.to_string(),
                value,
                export: false,
            }),
        });
        self.trailing_newline = true;
        Ok(true)
    }

    /// Convenience over [`Document::upsert`] that renders a decoded value.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<bool, DotenvError> {
        self.upsert(key, &render_value(value))
    }

    pub fn recipients(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| recipient_of(&line.text))
            .collect()
    }

    pub fn has_header(&self) -> bool {
        self.lines
            .iter()
            .any(|line| line.text.trim() == HEADER_VERSION)
    }

    /// Guarantees the version line and one recipient directive per entry of
    /// `recipients`. Returns whether anything was inserted.
    pub fn ensure_header(&mut self, recipients: &[String]) -> bool {
        let crlf = self.prefers_crlf();
        let mut changed = false;
        if !self.has_header() {
            let mut header = vec![Line::directive(HEADER_VERSION.to_string(), crlf)];
            let mut pending = Vec::new();
            for recipient in recipients {
                let recipient = recipient.trim();
                if !recipient.is_empty() && !pending.iter().any(|r: &String| r == recipient) {
                    pending.push(recipient.to_string());
                }
            }
            for recipient in pending {
                if !self.recipients().contains(&recipient) {
                    header.push(Line::directive(recipient_line(&recipient), crlf));
                }
            }
            let needs_separator = self
                .lines
                .first()
                .map_or(true, |line| line.kind != LineKind::Blank);
            if needs_separator {
                header.push(Line::blank(crlf));
            }
            if self.lines.is_empty() {
                self.trailing_newline = true;
            }
            self.lines.splice(0..0, header);
            changed = true;
        }

        for recipient in recipients {
            let recipient = recipient.trim();
            if recipient.is_empty() || self.recipients().iter().any(|r| r == recipient) {
                continue;
            }
            let anchor = self
                .lines
                .iter()
                .rposition(|line| recipient_of(&line.text).is_some())
                .or_else(|| {
                    self.lines
                        .iter()
                        .position(|line| line.text.trim() == HEADER_VERSION)
                })
                .map_or(0, |idx| idx + 1);
            self.lines
                .insert(anchor, Line::directive(recipient_line(recipient), crlf));
            changed = true;
        }
        changed
    }

    pub fn add_recipient(&mut self, recipient: &str) -> bool {
        self.ensure_header(&[recipient.to_string()])
    }

    pub fn remove_recipient(&mut self, recipient: &str) -> bool {
        let recipient = recipient.trim();
        let before = self.lines.len();
        self.lines
            .retain(|line| recipient_of(&line.text).as_deref() != Some(recipient));
        before != self.lines.len()
    }

    /// Re-renders the header block canonically: version line, sorted unique
    /// recipients, one blank separator.
    pub fn normalize_header(&mut self) -> bool {
        let before = self.serialize();
        let mut recipients = self.recipients();
        recipients.sort();
        recipients.dedup();
        self.lines.retain(|line| line.kind != LineKind::Directive);
        while self
            .lines
            .first()
            .is_some_and(|line| line.kind == LineKind::Blank)
        {
            self.lines.remove(0);
        }
        self.ensure_header(&recipients);
        before != self.serialize()
    }

    fn prefers_crlf(&self) -> bool {
        let crlf = self.lines.iter().filter(|line| line.crlf).count();
        crlf * 2 > self.lines.len()
    }
}

impl Line {
    fn directive(text: String, crlf: bool) -> Self {
        Self {
            text,
            crlf,
            kind: LineKind::Directive,
        }
    }

    fn blank(crlf: bool) -> Self {
        Self {
            text: String::new(),
            crlf,
            kind: LineKind::Blank,
        }
    }
}

fn classify_line(content: &str, line_no: usize) -> Result<LineKind, DotenvError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(LineKind::Blank);
    }
    if trimmed.starts_with(DIRECTIVE_PREFIX) {
        return Ok(LineKind::Directive);
    }
    if trimmed.starts_with('#') {
        return Ok(LineKind::Comment);
    }
    parse_assignment(trimmed, line_no).map(LineKind::Assignment)
}

fn parse_assignment(trimmed: &str, line_no: usize) -> Result<Assignment, DotenvError> {
    let (export, body) = match trimmed.strip_prefix("export") {
        Some(rest) if rest.starts_with([' ', '\t']) => (true, rest.trim_start()),
        _ => (false, trimmed),
    };
    let Some((left, right)) = body.split_once('=') else {
        return Err(DotenvError::InvalidKey {
            line: Some(line_no),
            key: body.to_string(),
        });
    };
    let key = left.trim();
    validate_key(key).map_err(|_| DotenvError::InvalidKey {
        line: Some(line_no),
        key: key.to_string(),
    })?;

    let malformed = || DotenvError::MalformedQuote {
        line: Some(line_no),
        key: key.to_string(),
    };
    let (raw_value, value) = split_value(right).ok_or_else(malformed)?;
    Ok(Assignment {
        key: key.to_string(),
        raw_value: raw_value.to_string(),
        value,
        export,
    })
}

/// Splits the text after `=` into the raw value token and its decoded form,
/// dropping a trailing inline comment.
fn split_value(right: &str) -> Option<(&str, String)> {
    let value = right.trim_start();
    match value.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let (decoded, end) = scan_quoted(value, quote)?;
            let rest = value[end..].trim_start();
            if !rest.is_empty() && !rest.starts_with('#') {
                return None;
            }
            Some((&value[..end], decoded))
        }
        _ => {
            let raw = strip_inline_comment(value).trim_end();
            Some((raw, raw.to_string()))
        }
    }
}

/// Returns the decoded contents and the byte index just past the closing quote.
fn scan_quoted(value: &str, quote: char) -> Option<(String, usize)> {
    let mut decoded = String::new();
    let mut chars = value.char_indices().skip(1);
    while let Some((idx, ch)) = chars.next() {
        if ch == quote {
            return Some((decoded, idx + ch.len_utf8()));
        }
        if ch == '\\' && quote == '"' {
            let (_, escaped) = chars.next()?;
            match escaped {
                'n' => decoded.push('\n'),
                't' => decoded.push('\t'),
                'r' => decoded.push('\r'),
                '"' => decoded.push('"'),
                '\\' => decoded.push('\\'),
                other => {
                    decoded.push('\\');
                    decoded.push(other);
                }
            }
            continue;
        }
        decoded.push(ch);
    }
    None
}

fn strip_inline_comment(value: &str) -> &str {
    let mut prev_ws = false;
    for (idx, ch) in value.char_indices() {
        if ch == '#' && prev_ws {
            return &value[..idx];
        }
        prev_ws = ch.is_whitespace();
    }
    value
}

fn decode_value(raw: &str) -> Option<String> {
    let (token, decoded) = split_value(raw)?;
    if token.len() != raw.trim().len() {
        return None;
    }
    Some(decoded)
}

fn render_assignment(export: bool, key: &str, raw_value: &str) -> String {
    if export {
        format!("export {key}={raw_value}")
    } else {
        format!("{key}={raw_value}")
    }
}

fn recipient_line(recipient: &str) -> String {
    format!("{RECIPIENT_DIRECTIVE} {recipient}")
}

fn recipient_of(text: &str) -> Option<String> {
    let rest = text.trim().strip_prefix(RECIPIENT_DIRECTIVE)?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let recipient = rest.trim();
    (!recipient.is_empty()).then(|| recipient.to_string())
}

pub fn validate_key(key: &str) -> Result<(), DotenvError> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_uppercase() || first == '_' => {
            chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DotenvError::InvalidKey {
            line: None,
            key: key.to_string(),
        })
    }
}

pub fn is_encrypted_marker(raw: &str) -> bool {
    raw.strip_prefix(MARKER_PREFIX).is_some_and(|body| {
        !body.is_empty()
            && body
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '='))
    })
}

/// Renders a decoded value as a raw token, double-quoting when needed.
/// Ciphertext markers are always written verbatim.
pub fn render_value(value: &str) -> String {
    if is_encrypted_marker(value) || !needs_quoting(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '"' | '\'' | '#' | '$'))
}

#[cfg(test)]
#[path = "dotenv_tests.rs"]
mod tests;
