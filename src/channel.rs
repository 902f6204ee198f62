//! Channel-listing parsing for `show channels`-style API output.
//!
//! FreeSWITCH renders channel listings as CSV whose fields may embed
//! dial-string groups (`{...}`, `[...]`, `(...)`) containing the delimiter,
//! so the split has to be bracket-aware.

use std::collections::HashMap;

/// Split `input` by `sep`, treating regions enclosed by `{}`, `[]` or `()`
/// as atomic.
///
/// Depth increases on any opener and decreases on any closer, never below
/// zero; unmatched openers are tolerated and the tail after the last
/// recognized split is appended as the final element. Re-joining the result
/// with `sep` yields the original string.
pub fn split_ignore_groups(input: &str, sep: &str) -> Vec<String> {
    if input.is_empty() {
        return Vec::new();
    }
    if sep.is_empty() {
        return vec![input.to_string()];
    }

    let bytes = input.as_bytes();
    let sep_bytes = sep.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'[' | b'(' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' | b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            _ if depth == 0 && bytes[i..].starts_with(sep_bytes) => {
                parts.push(input[start..i].to_string());
                i += sep_bytes.len();
                start = i;
            }
            _ => i += 1,
        }
    }
    parts.push(input[start..].to_string());

    parts
}

/// Parse a channel listing into one map per channel row.
///
/// The first line is the comma-delimited header row. The last three lines
/// (a blank line, the `<N> total.` line and the trailing empty line) are
/// dropped. Rows whose bracket-aware field count does not match the header
/// row are skipped.
pub fn parse_channel_data(raw: &str) -> Vec<HashMap<String, String>> {
    let lines: Vec<&str> = raw
        .split('\n')
        .collect();
    if lines.len() <= 4 {
        return Vec::new();
    }

    let headers: Vec<&str> = lines[0]
        .split(',')
        .collect();

    lines[1..lines.len() - 3]
        .iter()
        .filter_map(|line| {
            let fields = split_ignore_groups(line, ",");
            if fields.len() != headers.len() {
                return None;
            }
            Some(
                headers
                    .iter()
                    .zip(fields)
                    .map(|(header, field)| (header.to_string(), field))
                    .collect(),
            )
        })
        .collect()
}
