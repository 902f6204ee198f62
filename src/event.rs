//! Event payload parsing helpers.
//!
//! FreeSWITCH delivers `text/event-plain` payloads as a block of
//! `Key: value` lines followed by an optional body separated by a blank
//! line. Header values are URL-encoded on the wire.

use std::collections::HashMap;

use crate::constants::EVENT_BODY_KEY;
use crate::protocol::url_decode;

/// Parse an event payload into a header map.
///
/// Lines of the form `Key: value` contribute percent-decoded entries. The
/// first empty line ends the header portion; everything after it (joined by
/// `\n`) is stored under the literal key [`EVENT_BODY_KEY`].
pub fn event_to_map(event: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let lines: Vec<&str> = event
        .split('\n')
        .collect();

    for (i, line) in lines
        .iter()
        .enumerate()
    {
        if line.is_empty() {
            map.insert(EVENT_BODY_KEY.to_string(), lines[i + 1..].join("\n"));
            break;
        }
        if let Some((key, value)) = line.split_once(": ") {
            map.insert(key.to_string(), url_decode(value.trim()));
        }
    }

    map
}

/// Parse an event payload's headers only, skipping the names in `excluded`.
///
/// Unlike [`event_to_map`] no `EvBody` entry is synthesized; lines after the
/// first blank line are ignored.
pub fn event_headers(event: &str, excluded: &[&str]) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for line in event.split('\n') {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(": ") {
            if excluded.contains(&key) {
                continue;
            }
            map.insert(key.to_string(), url_decode(value.trim()));
        }
    }

    map
}
