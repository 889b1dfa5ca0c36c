//! Low-memory UID-list parsing for `SEARCH`/`UID SEARCH` responses.
//!
//! Grounded on the upstream `fixed_parse_message_list`: rather than build
//! a generic token parser, scan the raw response bytes with a regex for
//! runs of digits. This avoids per-token allocation on multi-million-UID
//! mailboxes and tolerates the (spec-violating) case where a server
//! concatenates more than one SEARCH response line — the numbers are
//! unioned regardless of which line they came from.

use regex::bytes::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn digits_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

/// Parses one or more raw `SEARCH`/`UID SEARCH` response lines into a
/// sorted, deduplicated list of UIDs. Each element of `lines` is one
/// untagged response's data (e.g. `b"1 123 124 1024"`); if the server
/// sent multiple such lines for one command, pass all of them and their
/// UID sets are unioned.
pub fn parse_message_list(lines: &[&[u8]]) -> Vec<u32> {
    let re = digits_pattern();
    let mut set: BTreeSet<u32> = BTreeSet::new();

    for line in lines {
        for m in re.find_iter(line) {
            if let Ok(s) = std::str::from_utf8(m.as_bytes())
                && let Ok(n) = s.parse::<u32>()
            {
                set.insert(n);
            }
        }
    }

    set.into_iter().collect()
}

/// One `* <seq> FETCH (...)` response, decomposed into its named items.
/// `async_imap`'s typed `Fetch` only understands RFC 3501 items; Gmail's
/// `X-GM-LABELS`/`X-GM-THRID`/`X-GM-MSGID` extension items need their own
/// scan over the raw response bytes, in the same spirit as
/// [`parse_message_list`]: a small hand-rolled scanner beats pulling in a
/// full IMAP grammar for three extra atoms.
#[derive(Debug, Default, Clone)]
pub struct FetchRecord {
    items: std::collections::HashMap<String, Vec<u8>>,
}

impl FetchRecord {
    pub fn atom(&self, key: &str) -> Option<&str> {
        self.items.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn u32(&self, key: &str) -> Option<u32> {
        self.atom(key).and_then(|s| s.parse().ok())
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.atom(key).and_then(|s| s.parse().ok())
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.items.get(key).map(|v| v.as_slice())
    }

    /// Raw inner text of a parenthesised list item, e.g. the
    /// `\Seen \Answered` inside `FLAGS (\Seen \Answered)`.
    pub fn list_text(&self, key: &str) -> Option<&str> {
        self.atom(key)
    }
}

/// Parses every `FETCH (...)` untagged response found in `raw` into a
/// [`FetchRecord`] per message, handling IMAP literals (`{n}\r\n<n
/// bytes>`), quoted strings, and one level of nested parenthesised lists
/// (`FLAGS (...)`, `X-GM-LABELS (...)`).
pub fn parse_fetch_responses(raw: &[u8]) -> Vec<FetchRecord> {
    let mut out = Vec::new();
    let needle = b"FETCH (";
    let mut i = 0;
    while let Some(rel) = find_subslice(&raw[i..], needle) {
        let start = i + rel + needle.len();
        let (record, end) = scan_record(raw, start);
        out.push(record);
        i = end;
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn scan_record(raw: &[u8], mut i: usize) -> (FetchRecord, usize) {
    let mut record = FetchRecord::default();
    let mut depth = 1usize;

    loop {
        skip_ws(raw, &mut i);
        if i >= raw.len() {
            break;
        }
        if raw[i] == b')' {
            i += 1;
            depth -= 1;
            if depth == 0 {
                break;
            }
            continue;
        }

        let key_start = i;
        while i < raw.len() && !raw[i].is_ascii_whitespace() && raw[i] != b'(' {
            i += 1;
        }
        let key = String::from_utf8_lossy(&raw[key_start..i]).to_uppercase();
        skip_ws(raw, &mut i);
        if i >= raw.len() {
            break;
        }

        match raw[i] {
            b'(' => {
                let mut d = 1i32;
                i += 1;
                let inner_start = i;
                while i < raw.len() && d > 0 {
                    match raw[i] {
                        b'(' => d += 1,
                        b')' => d -= 1,
                        _ => {}
                    }
                    if d > 0 {
                        i += 1;
                    }
                }
                record.items.insert(key, raw[inner_start..i].to_vec());
                i += 1;
            }
            b'"' => {
                i += 1;
                let str_start = i;
                while i < raw.len() && raw[i] != b'"' {
                    if raw[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                record.items.insert(key, raw[str_start..i.min(raw.len())].to_vec());
                i += 1;
            }
            b'{' => {
                let len_start = i + 1;
                let mut j = len_start;
                while j < raw.len() && raw[j] != b'}' {
                    j += 1;
                }
                let len: usize = std::str::from_utf8(&raw[len_start..j])
                    .ok()
                    .and_then(|s| s.trim_end_matches('+').parse().ok())
                    .unwrap_or(0);
                let mut k = j + 1;
                if k < raw.len() && raw[k] == b'\r' {
                    k += 1;
                }
                if k < raw.len() && raw[k] == b'\n' {
                    k += 1;
                }
                let data_end = (k + len).min(raw.len());
                record.items.insert(key, raw[k..data_end].to_vec());
                i = data_end;
            }
            _ => {
                let mut j = i;
                while j < raw.len() && !raw[j].is_ascii_whitespace() && raw[j] != b')' && raw[j] != b'(' {
                    j += 1;
                }
                record.items.insert(key, raw[i..j].to_vec());
                i = j;
            }
        }
    }

    (record, i)
}

fn skip_ws(raw: &[u8], i: &mut usize) {
    while *i < raw.len() && raw[*i].is_ascii_whitespace() {
        *i += 1;
    }
}

/// Splits a parenthesised IMAP atom/string list on unquoted whitespace,
/// e.g. the inner text of `X-GM-LABELS ("Some Label" Inbox)`.
pub fn split_imap_list(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if i > start {
                    out.push(&s[start..i]);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        out.push(&s[start..]);
    }
    out.into_iter().filter(|t| !t.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line() {
        assert_eq!(
            parse_message_list(&[b"1 123 124 1024"]),
            vec![1, 123, 124, 1024]
        );
    }

    #[test]
    fn unions_multiple_response_lines_and_dedups() {
        let result = parse_message_list(&[b"1 2 3", b"3 4 5"]);
        assert_eq!(result, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn handles_large_input_without_blowing_up_memory() {
        let line = (1..=200_000u32)
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let result = parse_message_list(&[line.as_bytes()]);
        assert_eq!(result.len(), 200_000);
        assert_eq!(result[0], 1);
        assert_eq!(result[result.len() - 1], 200_000);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(parse_message_list(&[]).is_empty());
        assert!(parse_message_list(&[b""]).is_empty());
    }

    #[test]
    fn parses_fetch_record_with_literal_body_and_nested_lists() {
        let raw = b"* 12 FETCH (UID 12 FLAGS (\\Seen \\Flagged) X-GM-THRID 555 X-GM-MSGID 777 X-GM-LABELS (\"\\\\Important\" \"Some Label\") RFC822.SIZE 9 BODY[] {9}\r\nhello abc)\r\n";
        let records = parse_fetch_responses(raw);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.u32("UID"), Some(12));
        assert_eq!(r.u64("X-GM-THRID"), Some(555));
        assert_eq!(r.u64("X-GM-MSGID"), Some(777));
        assert_eq!(r.u32("RFC822.SIZE"), Some(9));
        assert_eq!(r.bytes("BODY[]"), Some(&b"hello abc"[..]));
        let labels = split_imap_list(r.list_text("X-GM-LABELS").unwrap());
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn parses_multiple_fetch_records_in_one_response() {
        let raw = b"* 1 FETCH (UID 1 X-GM-MSGID 10)\r\n* 2 FETCH (UID 2 X-GM-MSGID 20)\r\n";
        let records = parse_fetch_responses(raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].u32("UID"), Some(1));
        assert_eq!(records[1].u32("UID"), Some(2));
    }

    #[test]
    fn split_imap_list_respects_quoted_spaces() {
        let items = split_imap_list(r#""Some Label" Inbox"#);
        assert_eq!(items, vec![r#""Some Label""#, "Inbox"]);
    }
}
