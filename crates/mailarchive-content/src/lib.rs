//! Turns raw RFC 5322 bytes into the header list and body text that get archived.
//!
//! Everything here is a pure function of the input bytes.

use mailparse::{DispositionType, ParsedMail};
use tracing::{debug, warn};

use mailarchive_core::{ArchiveError, HeaderList, MESSAGE_ID_HEADER, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub headers: HeaderList,
    pub body: String,
}

impl DecodedMessage {
    pub fn message_id(&self) -> Option<&str> {
        self.headers
            .get(MESSAGE_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Never fails: unreadable headers give an empty header list, an unreadable
/// body gives empty text.
pub fn decode_message(raw: &[u8]) -> DecodedMessage {
    let headers = parse_headers(raw).unwrap_or_else(|err| {
        warn!(error = %err, "unparseable headers, archiving without them");
        HeaderList::new()
    });
    let body = extract_body(raw);
    DecodedMessage { headers, body }
}

/// Top-level header fields, names spelled as received, duplicates kept.
pub fn parse_headers(raw: &[u8]) -> Result<HeaderList> {
    let (headers, _) =
        mailparse::parse_headers(raw).map_err(|err| ArchiveError::Decode(err.to_string()))?;
    Ok(headers
        .iter()
        .map(|header| (header.get_key(), header.get_value()))
        .collect::<Vec<_>>()
        .into())
}

/// Single-part messages yield their decoded payload. Multipart messages yield
/// the first `text/plain` part not marked as an attachment, or nothing.
pub fn extract_body(raw: &[u8]) -> String {
    match mailparse::parse_mail(raw) {
        Ok(parsed) => select_body(&parsed),
        Err(err) => {
            debug!(error = %err, "unparseable message, archiving empty body");
            String::new()
        }
    }
}

fn select_body(parsed: &ParsedMail) -> String {
    if parsed.subparts.is_empty() {
        return part_text(parsed);
    }
    first_inline_plain_text(parsed)
        .map(part_text)
        .unwrap_or_default()
}

fn first_inline_plain_text<'p, 'a>(part: &'p ParsedMail<'a>) -> Option<&'p ParsedMail<'a>> {
    if is_inline_plain_text(part) {
        return Some(part);
    }
    part.subparts
        .iter()
        .find_map(|sub| first_inline_plain_text(sub))
}

fn is_inline_plain_text(part: &ParsedMail) -> bool {
    part.subparts.is_empty()
        && part.ctype.mimetype.eq_ignore_ascii_case("text/plain")
        && !matches!(
            part.get_content_disposition().disposition,
            DispositionType::Attachment
        )
}

fn part_text(part: &ParsedMail) -> String {
    match part.get_body() {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, mimetype = %part.ctype.mimetype, "part failed to decode");
            String::new()
        }
    }
}
