use std::borrow::Cow;

use imap_proto::parser::parse_response;
use imap_proto::{MailboxDatum, NameAttribute, Response};

use mailarchive_core::{ArchiveError, FolderEntry, Result};

/// Folder entries parsed on demand from a raw `LIST` response.
///
/// Responses are parsed one at a time: a malformed one yields an `Err` item
/// and iteration resumes after its line. The listing is consumed once; a
/// fresh `LIST` is needed to walk the folders again.
#[derive(Debug, Clone)]
pub struct FolderListing {
    raw: Vec<u8>,
    pos: usize,
}

impl FolderListing {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw, pos: 0 }
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = Vec::new();
        for line in lines {
            raw.extend_from_slice(line.as_ref().as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        Self::new(raw)
    }

    /// Moves past the current line and returns it for error reporting.
    fn skip_line(&mut self) -> String {
        let rest = &self.raw[self.pos..];
        let (line, consumed) = match rest.iter().position(|b| *b == b'\n') {
            Some(idx) => (&rest[..idx], idx + 1),
            None => (rest, rest.len()),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = String::from_utf8_lossy(line).into_owned();
        self.pos += consumed;
        line
    }
}

impl Iterator for FolderListing {
    type Item = Result<FolderEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.raw.len() {
            let available = self.raw.len() - self.pos;
            let parsed = parse_response(&self.raw[self.pos..])
                .ok()
                .map(|(rest, response)| (available - rest.len(), folder_entry(response)));
            let Some((consumed, entry)) = parsed else {
                let line = self.skip_line();
                return Some(Err(ArchiveError::Protocol(format!(
                    "malformed LIST response: {}",
                    line
                ))));
            };
            self.pos += consumed.max(1);
            if let Some(entry) = entry {
                return Some(Ok(entry));
            }
        }
        None
    }
}

fn folder_entry(response: Response<'_>) -> Option<FolderEntry> {
    match response {
        Response::MailboxData(MailboxDatum::List {
            name_attributes,
            delimiter,
            name,
        }) => Some(FolderEntry {
            flags: name_attributes.iter().map(attribute_name).collect(),
            delimiter: delimiter.map(|d| unescape(&d)),
            name: unescape(&name),
        }),
        _ => None,
    }
}

fn attribute_name(attribute: &NameAttribute<'_>) -> String {
    match attribute {
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::Extension(name) => name.to_string(),
        other => format!("\\{:?}", other),
    }
}

/// Quoted strings come back from the parser with their escapes intact.
fn unescape(value: &Cow<'_, str>) -> String {
    if !value.contains('\\') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Quotes a mailbox name or reference for use as a command argument.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}
