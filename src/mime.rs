//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse`. Parts are addressed with IMAP
//! section numbers: a single-part message has body `1`, the children of a
//! multipart root are `1`, `2`, ... and nested children `2.1`, `2.2`. An
//! attached message numbers its own parts below its section. HTML is
//! sanitized with `ammonia`; plain text is derived from it with `html2text`
//! when the message has no text part.

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::{AttachmentInfo, Envelope, MessageText};

/// Wrap width used when rendering HTML to plain text
const HTML_TEXT_WIDTH: usize = 100;

/// One addressed part of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPart {
    /// Lower-cased MIME type (e.g., `application/pdf`)
    pub mime_type: String,
    /// Filename from Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// Body with the transfer encoding removed
    pub data: Vec<u8>,
}

/// Build an envelope from raw header bytes
///
/// # Errors
///
/// - `Internal` if `mailparse` fails
pub fn envelope_from_headers(header_bytes: &[u8]) -> AppResult<Envelope> {
    let headers = to_header_map(&parse_header_bytes(header_bytes)?);
    let date = headers.get("date").cloned();
    Ok(Envelope {
        subject: headers.get("subject").cloned(),
        from: headers.get("from").cloned(),
        to: headers.get("to").cloned(),
        cc: headers.get("cc").cloned(),
        timestamp: date.as_deref().and_then(|d| mailparse::dateparse(d).ok()),
        date,
    })
}

/// Find a part by IMAP section number
///
/// Every node is addressable: multipart containers yield their raw body with
/// the inner boundaries, and the children of an attached `message/rfc822`
/// are numbered below it as in the encapsulated message. Returns `None` when
/// the number addresses nothing in this message.
///
/// # Errors
///
/// - `Internal` if the message or the part body cannot be decoded
pub fn find_part(raw: &[u8], part_number: &str) -> AppResult<Option<ExtractedPart>> {
    let Some(path) = section_path(part_number) else {
        return Ok(None);
    };
    let parsed = parse(raw)?;
    find_in(&parsed, &path, part_number)
}

/// Positive integer segments of a section number such as `2.1.3`
fn section_path(part_number: &str) -> Option<Vec<usize>> {
    part_number
        .split('.')
        .map(|seg| seg.parse::<usize>().ok().filter(|n| *n > 0))
        .collect()
}

fn find_in(
    mail: &ParsedMail<'_>,
    path: &[usize],
    part_number: &str,
) -> AppResult<Option<ExtractedPart>> {
    let Some((&first, rest)) = path.split_first() else {
        return Ok(None);
    };
    // the body of a single-part message is section 1
    let node = if mail.subparts.is_empty() {
        (first == 1).then_some(mail)
    } else {
        mail.subparts.get(first - 1)
    };
    match node {
        Some(node) => descend(node, rest, part_number),
        None => Ok(None),
    }
}

fn descend(
    node: &ParsedMail<'_>,
    rest: &[usize],
    part_number: &str,
) -> AppResult<Option<ExtractedPart>> {
    let Some((&next, tail)) = rest.split_first() else {
        return extract(node, part_number).map(Some);
    };
    if !node.subparts.is_empty() {
        return match node.subparts.get(next - 1) {
            Some(child) => descend(child, tail, part_number),
            None => Ok(None),
        };
    }
    if node.ctype.mimetype.eq_ignore_ascii_case("message/rfc822") {
        let inner = node
            .get_body_raw()
            .map_err(|e| AppError::Internal(format!("failed decoding part {part_number}: {e}")))?;
        let inner = parse(&inner)?;
        return find_in(&inner, rest, part_number);
    }
    Ok(None)
}

fn extract(part: &ParsedMail<'_>, part_number: &str) -> AppResult<ExtractedPart> {
    let data = if part.subparts.is_empty() {
        part.get_body_raw()
            .map_err(|e| AppError::Internal(format!("failed decoding part {part_number}: {e}")))?
    } else {
        container_body(part)?
    };
    let disp = part.get_content_disposition();
    Ok(ExtractedPart {
        mime_type: part.ctype.mimetype.to_ascii_lowercase(),
        filename: attachment_filename(part, &disp.params),
        data,
    })
}

/// Everything after a multipart node's header block
///
/// `get_body_raw` on a multipart node only covers its preamble.
fn container_body(part: &ParsedMail<'_>) -> AppResult<Vec<u8>> {
    let (_, ix_body) = mailparse::parse_headers(part.raw_bytes)
        .map_err(|e| AppError::Internal(format!("failed to parse part headers: {e}")))?;
    Ok(part.raw_bytes.get(ix_body..).unwrap_or_default().to_vec())
}

/// Extract text bodies and attachment metadata
///
/// The first inline `text/plain` leaf becomes `text` and the first inline
/// `text/html` leaf becomes sanitized `html`. Leaves with an attachment
/// disposition or a filename are listed as attachments.
///
/// # Errors
///
/// - `Internal` if `mailparse` fails
pub fn extract_texts(uid: u32, raw: &[u8]) -> AppResult<MessageText> {
    let parsed = parse(raw)?;
    let mut text = None;
    let mut html_raw: Option<String> = None;
    let mut attachments = Vec::new();

    for (number, part) in leaves(&parsed) {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if is_attachment {
            let size_bytes = part.get_body_raw().map(|b| b.len()).map_err(|e| {
                AppError::Internal(format!("failed decoding attachment body: {e}"))
            })?;
            attachments.push(AttachmentInfo {
                filename,
                content_type: ctype,
                size_bytes,
                part_number: number,
            });
            continue;
        }

        if ctype == "text/plain"
            && text.is_none()
            && let Ok(body) = part.get_body()
        {
            text = Some(body);
        }

        if ctype == "text/html"
            && html_raw.is_none()
            && let Ok(body) = part.get_body()
        {
            html_raw = Some(body);
        }
    }

    if text.is_none()
        && let Some(html) = html_raw.as_deref()
    {
        text = html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH).ok();
    }

    Ok(MessageText {
        uid,
        text,
        html: html_raw.map(|h| ammonia::clean(&h)),
        attachments,
    })
}

fn parse(raw: &[u8]) -> AppResult<ParsedMail<'_>> {
    mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))
}

/// Leaf parts paired with their IMAP section numbers, in document order
fn leaves<'a, 'b>(mail: &'b ParsedMail<'a>) -> Vec<(String, &'b ParsedMail<'a>)> {
    let mut out = Vec::new();
    if mail.subparts.is_empty() {
        out.push(("1".to_owned(), mail));
    } else {
        collect_leaves(mail, None, &mut out);
    }
    out
}

fn collect_leaves<'a, 'b>(
    part: &'b ParsedMail<'a>,
    prefix: Option<&str>,
    out: &mut Vec<(String, &'b ParsedMail<'a>)>,
) {
    for (idx, sub) in part.subparts.iter().enumerate() {
        let number = match prefix {
            Some(prefix) => format!("{prefix}.{}", idx + 1),
            None => (idx + 1).to_string(),
        };
        if sub.subparts.is_empty() {
            out.push((number, sub));
        } else {
            collect_leaves(sub, Some(&number), out);
        }
    }
}

/// Extract attachment filename from part
///
/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Parse header bytes into key-value pairs
fn parse_header_bytes(header_bytes: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(header_bytes)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(headers))
}

/// Convert mailparse headers to tuples
fn to_tuples(headers: Vec<MailHeader<'_>>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// Convert header tuples to case-insensitive map
///
/// Returns first value for each header key (case-insensitive).
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        map.entry(key).or_insert_with(|| v.clone());
    }
    map
}
