//! Owned mail message with in-place header editing and CRLF serialization.

use std::io::Write;

use lettre::message::Mailbox;
use thiserror::Error;

/// Header added by relays that is stripped before emission.
pub const ROUTING_HEADER: &str = "Return-Path";

/// Message handling failures.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Bytes are not a mail message.
    #[error("could not parse mail message: {0}")]
    Parse(String),
    /// From header could not be turned into addresses.
    #[error("could not extract mailbox list from From header: {0}")]
    From(String),
    /// Serialization sink failed.
    #[error("could not write message: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct HeaderField {
    name: String,
    /// Physical lines of the field without line terminators.
    lines: Vec<Vec<u8>>,
}

/// Parsed mail message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MailMessage {
    headers: Vec<HeaderField>,
    body: Vec<u8>,
}

impl MailMessage {
    /// Parses raw message bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let (header_section, body) = split_sections(raw);
        let mut headers: Vec<HeaderField> = Vec::new();

        for line in header_section {
            if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
                let Some(field) = headers.last_mut() else {
                    return Err(MessageError::Parse(
                        "continuation line before first header field".to_owned(),
                    ));
                };
                field.lines.push(line.to_vec());
                continue;
            }
            let name = field_name(line).ok_or_else(|| {
                MessageError::Parse(format!(
                    "invalid header line `{}`",
                    String::from_utf8_lossy(line)
                ))
            })?;
            headers.push(HeaderField {
                name,
                lines: vec![line.to_vec()],
            });
        }

        if headers.is_empty() {
            return Err(MessageError::Parse("message has no header fields".to_owned()));
        }

        Ok(Self {
            headers,
            body: body.to_vec(),
        })
    }

    /// Returns true when a header named `name` is present (case-insensitive).
    #[must_use]
    pub fn contains_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|field| field.name.eq_ignore_ascii_case(name))
    }

    /// Removes the first header named `name`; returns whether one was removed.
    pub fn remove_header(&mut self, name: &str) -> bool {
        let Some(index) = self
            .headers
            .iter()
            .position(|field| field.name.eq_ignore_ascii_case(name))
        else {
            return false;
        };
        self.headers.remove(index);
        true
    }

    /// Removes every routing header and returns how many were removed.
    pub fn strip_routing_headers(&mut self) -> usize {
        let mut removed = 0;
        while self.remove_header(ROUTING_HEADER) {
            removed += 1;
        }
        removed
    }

    /// Returns the addr-spec of every mailbox in the From header.
    ///
    /// Group syntax is flattened. A missing From header yields an empty list.
    pub fn sender_addresses(&self) -> Result<Vec<String>, MessageError> {
        let Some(from) = self
            .headers
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case("From"))
        else {
            return Ok(Vec::new());
        };

        let unfolded: Vec<u8> = from.lines.concat();
        let unfolded = std::str::from_utf8(&unfolded)
            .map_err(|_| MessageError::From("header is not valid UTF-8".to_owned()))?;
        let value = unfolded
            .split_once(':')
            .map_or("", |(_, value)| value);

        split_mailboxes(value)
            .into_iter()
            .map(|entry| {
                entry
                    .parse::<Mailbox>()
                    .map(|mailbox| mailbox.email.to_string())
                    .map_err(|err| MessageError::From(format!("`{entry}`: {err}")))
            })
            .collect()
    }

    /// Serializes the message with CRLF line endings.
    pub fn to_crlf_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64 * self.headers.len() + 2);
        for field in &self.headers {
            for line in &field.lines {
                out.extend_from_slice(line);
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        push_crlf(&mut out, &self.body);
        out
    }

    /// Writes the CRLF serialization to `writer`.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), MessageError> {
        writer.write_all(&self.to_crlf_bytes())?;
        Ok(())
    }
}

/// Splits raw bytes into header lines and the body following the blank line.
fn split_sections(raw: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut lines = Vec::new();
    let mut offset = 0;
    while offset < raw.len() {
        let end = raw[offset..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(raw.len(), |pos| offset + pos + 1);
        let line = trim_line_ending(&raw[offset..end]);
        offset = end;
        if line.is_empty() {
            return (lines, &raw[offset..]);
        }
        lines.push(line);
    }
    (lines, &[])
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn field_name(line: &[u8]) -> Option<String> {
    let colon = line.iter().position(|b| *b == b':')?;
    let name = line[..colon].trim_ascii_end();
    if name.is_empty() || !name.iter().all(|b| (33..=126).contains(b)) {
        return None;
    }
    std::str::from_utf8(name).ok().map(str::to_owned)
}

/// Splits an address list into mailbox strings.
///
/// Comments are dropped. Group display names and their `:`/`;` delimiters
/// are dropped too, so group members come out as plain mailboxes.
fn split_mailboxes(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    let mut comment = 0_usize;
    let mut nesting = 0_usize;

    for ch in value.chars() {
        if comment > 0 {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '(' => comment += 1,
                ')' => comment -= 1,
                _ => {}
            }
            continue;
        }
        if escaped {
            escaped = false;
            current.push(ch);
            continue;
        }
        match ch {
            '\\' if quoted => {
                escaped = true;
                current.push(ch);
            }
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            _ if quoted => current.push(ch),
            '(' => {
                comment = 1;
                current.push(' ');
            }
            '<' | '[' => {
                nesting += 1;
                current.push(ch);
            }
            '>' | ']' => {
                nesting = nesting.saturating_sub(1);
                current.push(ch);
            }
            ':' if nesting == 0 => current.clear(),
            ',' | ';' if nesting == 0 => entries.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    entries.push(current);
    entries
        .into_iter()
        .map(|entry| entry.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn push_crlf(out: &mut Vec<u8>, bytes: &[u8]) {
    let mut previous = 0_u8;
    for &byte in bytes {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
}
