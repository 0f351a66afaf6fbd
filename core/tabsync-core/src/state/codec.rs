//! Blob encoding.
//!
//! Keys and values are both percent-encoded, so any key a writer uses
//! survives a round trip. Decoding never fails: a malformed entry is dropped
//! on its own, and a blob with no usable entry decodes to the empty state
//! ("no session").

use super::types::SessionState;

const ENTRY_SEPARATOR: char = '&';
const KEY_VALUE_SEPARATOR: char = '=';

/// Encodes a state as `&`-joined `key=value` pairs. Empty keys are skipped.
pub fn encode(state: &SessionState) -> String {
    state
        .iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| {
            format!(
                "{}{}{}",
                urlencoding::encode(key),
                KEY_VALUE_SEPARATOR,
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

pub fn decode(raw: &str) -> SessionState {
    raw.split(ENTRY_SEPARATOR)
        .filter_map(|entry| {
            let (key, value) = entry.split_once(KEY_VALUE_SEPARATOR)?;
            let key = urlencoding::decode(key).ok()?;
            if key.is_empty() {
                return None;
            }
            let value = urlencoding::decode(value).ok()?;
            Some((key.into_owned(), value.into_owned()))
        })
        .collect()
}
