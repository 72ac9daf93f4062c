use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::LazyLock;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc2822;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::MessageError;
use crate::schema::Sender;

static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?]+)\?([bBqQ])\?([^?]*)\?=").expect("valid encoded-word regex")
});
static ADJACENT_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?=\s+=\?").expect("valid adjacent-word regex"));
static ANGLE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:"?(?P<name>[^"<]*?)"?\s*)?<(?P<email>[^<>\s]+)>\s*$"#)
        .expect("valid angle address regex")
});
static COMMENT_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<email>[^\s()<>]+@[^\s()<>]+)\s*\((?P<name>[^)]*)\)\s*$")
        .expect("valid comment address regex")
});
static TRAILING_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("valid comment regex"));
static NAMED_ZONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s(?:GMT|UTC|UT|Z)$").expect("valid zone regex"));

const NO_WEEKDAY_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[day padding:none] [month repr:short case_sensitive:false] [year] [hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
);
const NO_SECONDS_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[day padding:none] [month repr:short case_sensitive:false] [year] [hour]:[minute] [offset_hour sign:mandatory][offset_minute]"
);
const NAIVE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[day padding:none] [month repr:short case_sensitive:false] [year] [hour]:[minute]:[second]"
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub index: usize, // position within the archive
    pub text: String,
}

/// Splits an mbox archive into messages.
///
/// A `From ` line opens a message when it starts the file or follows a blank
/// line; `>From ` escapes inside bodies are undone. Lines that are not valid
/// UTF-8 are read as latin-1.
pub fn split_mbox(bytes: &[u8]) -> Vec<RawMessage> {
    let mut messages = Vec::new();
    let mut current: Option<Vec<Cow<'_, str>>> = None;
    let mut previous_blank = true;

    for line in bytes.split(|&byte| byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = std::str::from_utf8(line)
            .map(Cow::Borrowed)
            .unwrap_or_else(|_| Cow::Owned(latin1(line)));
        if previous_blank && line.starts_with("From ") {
            if let Some(lines) = current.take() {
                push_message(&mut messages, lines);
            }
            current = Some(Vec::new());
            previous_blank = false;
            continue;
        }
        previous_blank = line.is_empty();
        if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some(lines) = current {
        push_message(&mut messages, lines);
    }
    messages
}

fn push_message(messages: &mut Vec<RawMessage>, mut lines: Vec<Cow<'_, str>>) {
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return;
    }
    let text = lines
        .iter()
        .map(|line| unescape_from(line))
        .collect::<Vec<_>>()
        .join("\n");
    messages.push(RawMessage {
        index: messages.len(),
        text,
    });
}

fn unescape_from(line: &str) -> &str {
    let quoted = line.trim_start_matches('>');
    if quoted.len() < line.len() && quoted.starts_with("From ") {
        &line[1..]
    } else {
        line
    }
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: String,
    pub subject: String,
    pub from: Option<String>,
    pub date: Option<String>,
    pub body: String,
}

impl ParsedMessage {
    pub fn parse(raw: &RawMessage) -> Self {
        let (headers, body) = split_headers(&raw.text);
        let message_id = header(&headers, "message-id")
            .map(|value| value.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| content_id(&raw.text));

        Self {
            message_id,
            subject: header(&headers, "subject")
                .map(decode_encoded_words)
                .unwrap_or_default(),
            from: header(&headers, "from").map(decode_encoded_words),
            date: header(&headers, "date").map(str::to_string),
            body: text_body(&headers, body).join("\n"),
        }
    }

    pub fn sender(&self) -> Result<Sender, MessageError> {
        let from = self.from.as_deref().ok_or(MessageError::MissingHeader("From"))?;
        parse_sender(from)
    }

    pub fn timestamp(&self) -> Result<OffsetDateTime, MessageError> {
        let date = self.date.as_deref().ok_or(MessageError::MissingHeader("Date"))?;
        parse_timestamp(date)
    }
}

fn content_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

type Headers = Vec<(String, String)>;

fn split_headers(text: &str) -> (Headers, &str) {
    let (head, body) = match text.find("\n\n") {
        Some(pos) => (&text[..pos], &text[pos + 2..]),
        None => (text, ""),
    };

    let mut headers: Headers = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    (headers, body)
}

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn content_type(headers: &Headers) -> (String, Vec<(String, String)>) {
    let raw = header(headers, "content-type").unwrap_or("text/plain");
    let mut parts = raw.split(';');
    let media = parts.next().unwrap_or("text/plain").trim().to_ascii_lowercase();
    let params = parts
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            Some((
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect();
    (media, params)
}

fn text_body(headers: &Headers, body: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    collect_text(headers, body, &mut payloads, 0);
    payloads
}

fn collect_text(headers: &Headers, body: &str, out: &mut Vec<String>, depth: usize) {
    let (media, params) = content_type(headers);

    if media.starts_with("multipart/") && depth < 8 {
        let Some(boundary) = params
            .iter()
            .find(|(key, _)| key == "boundary")
            .map(|(_, value)| value.as_str())
        else {
            return;
        };
        for part in multipart_parts(body, boundary) {
            let (part_headers, part_body) = split_headers(part);
            collect_text(&part_headers, part_body, out, depth + 1);
        }
        return;
    }

    if media != "text/plain" {
        return;
    }

    let encoding = header(headers, "content-transfer-encoding")
        .unwrap_or("7bit")
        .to_ascii_lowercase();
    let charset = params
        .iter()
        .find(|(key, _)| key == "charset")
        .map_or("utf-8", |(_, value)| value.as_str());
    let payload = match encoding.as_str() {
        "quoted-printable" => decode_text(&decode_quoted_printable(body), charset),
        "base64" => decode_text(&decode_base64_body(body), charset),
        _ => body.to_string(),
    };

    if looks_like_html(&payload) || looks_like_blob(&payload) || payload.contains("PGP SIGNATURE") {
        return;
    }
    if !out.contains(&payload) {
        out.push(payload);
    }
}

fn multipart_parts<'a>(body: &'a str, boundary: &str) -> Vec<&'a str> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    for (index, chunk) in body.split(delimiter.as_str()).enumerate() {
        if index == 0 || chunk.starts_with("--") {
            continue; // preamble and closing delimiter
        }
        parts.push(chunk.strip_prefix('\n').unwrap_or(chunk));
    }
    parts
}

fn looks_like_html(payload: &str) -> bool {
    ["<html>", "</html>", "<div>", "</div>"]
        .iter()
        .any(|tag| payload.contains(tag))
}

/// Undecoded attachment data: one long run with no whitespace.
fn looks_like_blob(payload: &str) -> bool {
    let trimmed = payload.trim();
    trimmed.len() > 76 && !trimmed.contains(char::is_whitespace)
}

fn decode_quoted_printable(body: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(body.len());
    let mut lines = body.split('\n').peekable();
    while let Some(line) = lines.next() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (line, soft_break) = match line.trim_end().strip_suffix('=') {
            Some(stripped) => (stripped, true),
            None => (line, false),
        };
        push_hex_escapes(line.as_bytes(), &mut bytes);
        if !soft_break && lines.peek().is_some() {
            bytes.push(b'\n');
        }
    }
    bytes
}

fn push_hex_escapes(raw: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'=' && i + 2 < raw.len() {
            if let Some(value) = hex_pair(raw[i + 1], raw[i + 2]) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

fn decode_base64_body(body: &str) -> Vec<u8> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact.as_bytes()).unwrap_or_default()
}

/// Latin-1 and ASCII map byte for byte; every other charset is read as UTF-8.
fn decode_text(bytes: &[u8], charset: &str) -> String {
    // RFC 2231 language suffix: "iso-8859-1*en"
    let charset = charset.split('*').next().unwrap_or(charset).trim();
    match charset.to_ascii_lowercase().as_str() {
        "iso-8859-1" | "iso8859-1" | "iso_8859-1" | "latin1" | "latin-1" | "l1" | "us-ascii" | "ascii" => {
            latin1(bytes)
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().copied().map(char::from).collect()
}

pub fn decode_encoded_words(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }
    // whitespace between adjacent encoded words is not significant
    let joined = ADJACENT_WORDS.replace_all(value, "?==?");

    ENCODED_WORD
        .replace_all(&joined, |caps: &regex::Captures| {
            let text = &caps[3];
            let bytes = match &caps[2] {
                "b" | "B" => STANDARD.decode(text.as_bytes()).unwrap_or_default(),
                _ => decode_q(text),
            };
            decode_text(&bytes, &caps[1])
        })
        .into_owned()
}

fn decode_q(text: &str) -> Vec<u8> {
    let underscored: Vec<u8> = text
        .bytes()
        .map(|byte| if byte == b'_' { b' ' } else { byte })
        .collect();
    let mut out = Vec::with_capacity(underscored.len());
    push_hex_escapes(&underscored, &mut out);
    out
}

pub fn parse_sender(from: &str) -> Result<Sender, MessageError> {
    let malformed = || MessageError::MalformedAddress(from.to_string());
    let trimmed = from.trim();

    let (name, email) = if let Some(caps) = ANGLE_ADDRESS.captures(trimmed) {
        (
            caps.name("name").map_or("", |m| m.as_str()).trim().to_string(),
            caps["email"].to_string(),
        )
    } else if let Some(caps) = COMMENT_ADDRESS.captures(trimmed) {
        (caps["name"].trim().to_string(), caps["email"].to_string())
    } else if !trimmed.contains(char::is_whitespace) {
        (String::new(), trimmed.to_string())
    } else {
        return Err(malformed());
    };

    let email = email.trim().to_string();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(Sender { name, email }),
        _ => Err(malformed()),
    }
}

/// Parses a `Date` header into UTC.
///
/// Handles `Fri, 07 Feb 2026 12:00:00 +0000`, the same with a trailing zone
/// comment such as `(UTC)`, a missing or wrong weekday, and named zones.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, MessageError> {
    let malformed = || MessageError::MalformedDate(value.to_string());

    let mut cleaned = TRAILING_COMMENT.replace(value.trim(), "").trim().to_string();
    if NAMED_ZONE.is_match(&cleaned) {
        cleaned = NAMED_ZONE.replace(&cleaned, " +0000").into_owned();
    }
    if cleaned.is_empty() {
        return Err(malformed());
    }

    if let Ok(parsed) = OffsetDateTime::parse(&cleaned, &Rfc2822) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    let without_weekday = match cleaned.split_once(',') {
        Some((weekday, rest)) if weekday.trim().chars().all(|c| c.is_ascii_alphabetic()) => rest.trim(),
        _ => cleaned.as_str(),
    };
    let without_weekday = without_weekday.split_whitespace().collect::<Vec<_>>().join(" ");

    for format in [NO_WEEKDAY_FORMAT, NO_SECONDS_FORMAT] {
        if let Ok(parsed) = OffsetDateTime::parse(&without_weekday, format) {
            return Ok(parsed.to_offset(UtcOffset::UTC));
        }
    }
    if let Ok(naive) = PrimitiveDateTime::parse(&without_weekday, NAIVE_FORMAT) {
        return Ok(naive.assume_utc());
    }
    Err(malformed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn splits_on_from_lines_after_blank_lines() {
        let archive = b"From alice@example.com Fri Feb  6 12:00:00 2026\n\
Subject: one\n\
\n\
body one\n\
>From the archive, escaped\n\
\n\
From bob@example.com Fri Feb  6 13:00:00 2026\n\
Subject: two\n\
\n\
body two\n";
        let messages = split_mbox(archive);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].index, 0);
        assert!(messages[0].text.contains("\nFrom the archive, escaped"));
        assert!(messages[1].text.starts_with("Subject: two"));
    }

    #[test]
    fn empty_archive_has_no_messages() {
        assert!(split_mbox(b"").is_empty());
        assert!(split_mbox(b"\n\n").is_empty());
    }

    #[test]
    fn parses_headers_and_folds() {
        let raw = RawMessage {
            index: 0,
            text: "Message-ID: <abc@mail.example>\nSubject: [VOTE] KIP-500:\n Replace ZooKeeper\nFrom: \"Alice Johnson\" <alice@apache.org>\nDate: Sat, 07 Feb 2026 12:00:00 +0000\n\n+1 (binding)\n".into(),
        };
        let parsed = ParsedMessage::parse(&raw);
        assert_eq!(parsed.message_id, "abc@mail.example");
        assert_eq!(parsed.subject, "[VOTE] KIP-500: Replace ZooKeeper");
        assert_eq!(parsed.body.trim(), "+1 (binding)");
        let sender = parsed.sender().unwrap();
        assert_eq!(sender.name, "Alice Johnson");
        assert_eq!(sender.email, "alice@apache.org");
    }

    #[test]
    fn missing_message_id_is_derived_from_content() {
        let raw = RawMessage {
            index: 3,
            text: "Subject: hello there\n\nsome body text\n".into(),
        };
        let first = ParsedMessage::parse(&raw).message_id;
        let second = ParsedMessage::parse(&raw.clone()).message_id;
        assert!(first.starts_with("sha256:"));
        assert_eq!(first, second);
    }

    #[test]
    fn multipart_keeps_plain_text_only() {
        let text = "Subject: test\n\
Content-Type: multipart/alternative; boundary=\"XYZ\"\n\
\n\
preamble\n\
--XYZ\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: quoted-printable\n\
\n\
+1 (binding) from me, thanks for the =\n\
KIP=3D500\n\
--XYZ\n\
Content-Type: text/html\n\
\n\
<html><div>+1</div></html>\n\
--XYZ--\n";
        let parsed = ParsedMessage::parse(&RawMessage { index: 0, text: text.into() });
        assert!(parsed.body.contains("+1 (binding) from me, thanks for the KIP=500"));
        assert!(!parsed.body.contains("<html>"));
    }

    #[test]
    fn short_bodies_survive_and_blobs_do_not() {
        let parsed = ParsedMessage::parse(&RawMessage { index: 0, text: "Subject: x\n\n+1\n".into() });
        assert_eq!(parsed.body.trim(), "+1");

        let blob = "A".repeat(200);
        let parsed = ParsedMessage::parse(&RawMessage { index: 0, text: format!("Subject: x\n\n{blob}\n") });
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn base64_body_is_decoded() {
        let encoded = STANDARD.encode("+1 (non-binding) nice work");
        let text = format!("Subject: x\nContent-Transfer-Encoding: base64\n\n{encoded}\n");
        let parsed = ParsedMessage::parse(&RawMessage { index: 0, text });
        assert_eq!(parsed.body.trim(), "+1 (non-binding) nice work");
    }

    #[test]
    fn encoded_words_are_decoded() {
        assert_eq!(decode_encoded_words("=?UTF-8?Q?Ren=C3=A9_Dupont?="), "René Dupont");
        assert_eq!(decode_encoded_words("=?utf-8?B?S0lQLTUwMA==?="), "KIP-500");
        assert_eq!(decode_encoded_words("=?UTF-8?Q?a?= =?UTF-8?Q?b?="), "ab");
        assert_eq!(decode_encoded_words("plain"), "plain");
    }

    #[test]
    fn latin1_charsets_are_honoured() {
        assert_eq!(decode_encoded_words("=?ISO-8859-1?Q?Ren=E9_Dupont?="), "René Dupont");
        assert_eq!(decode_encoded_words("=?iso-8859-1?B?UmVu6Q==?="), "René");

        let text = "Subject: x\n\
Content-Type: text/plain; charset=iso-8859-1\n\
Content-Transfer-Encoding: quoted-printable\n\
\n\
+1 (binding), caf=E9 on me\n";
        let parsed = ParsedMessage::parse(&RawMessage { index: 0, text: text.into() });
        assert_eq!(parsed.body.trim(), "+1 (binding), café on me");

        let mut archive = b"From a@example.com Sat Jan  3 10:00:00 2026\nFrom: Ren".to_vec();
        archive.extend_from_slice(&[0xE9]);
        archive.extend_from_slice(b" <rene@example.com>\nSubject: KIP-1\n\nhi\n");
        let messages = split_mbox(&archive);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.starts_with("From: René <rene@example.com>"));
    }

    #[test]
    fn sender_formats() {
        let s = parse_sender("Bob Smith <bob@apache.org>").unwrap();
        assert_eq!((s.name.as_str(), s.email.as_str()), ("Bob Smith", "bob@apache.org"));

        let s = parse_sender("bob@apache.org (Bob Smith)").unwrap();
        assert_eq!((s.name.as_str(), s.email.as_str()), ("Bob Smith", "bob@apache.org"));

        let s = parse_sender("bob@apache.org").unwrap();
        assert_eq!((s.name.as_str(), s.email.as_str()), ("", "bob@apache.org"));

        let s = parse_sender("<bob@apache.org>").unwrap();
        assert_eq!(s.email, "bob@apache.org");

        assert!(parse_sender("Bob Smith").is_err());
        assert!(parse_sender("not-an-address").is_err());
        assert!(parse_sender("").is_err());
    }

    #[test]
    fn timestamp_standard_format() {
        let parsed = parse_timestamp("Sat, 07 Feb 2026 12:00:00 +0000").unwrap();
        assert_eq!(parsed, datetime!(2026-02-07 12:00 UTC));
    }

    #[test]
    fn timestamp_with_zone_comment() {
        let parsed = parse_timestamp("Sat, 07 Feb 2026 12:00:00 +0000 (UTC)").unwrap();
        assert_eq!(parsed, datetime!(2026-02-07 12:00 UTC));
        let parsed = parse_timestamp("Sat, 07 Feb 2026 12:00:00 +0000 (GMT)").unwrap();
        assert_eq!(parsed, datetime!(2026-02-07 12:00 UTC));
    }

    #[test]
    fn timestamp_normalizes_offsets_to_utc() {
        let parsed = parse_timestamp("Sat, 07 Feb 2026 12:00:00 -0500").unwrap();
        assert_eq!(parsed, datetime!(2026-02-07 17:00 UTC));
        assert_eq!(parsed.offset(), UtcOffset::UTC);
    }

    #[test]
    fn timestamp_tolerates_wrong_or_missing_weekday() {
        // 07 Feb 2026 is a Saturday
        let parsed = parse_timestamp("Fri, 07 Feb 2026 12:00:00 +0000").unwrap();
        assert_eq!(parsed, datetime!(2026-02-07 12:00 UTC));
        let parsed = parse_timestamp("7 Feb 2026 12:00:00 +0100").unwrap();
        assert_eq!(parsed, datetime!(2026-02-07 11:00 UTC));
        let parsed = parse_timestamp("Thu, 19 Feb 2015 14:29:32 GMT").unwrap();
        assert_eq!(parsed, datetime!(2015-02-19 14:29:32 UTC));
    }

    #[test]
    fn timestamp_garbage_is_rejected() {
        assert!(parse_timestamp("This is not a valid date").is_err());
        assert!(parse_timestamp("").is_err());
    }
}
