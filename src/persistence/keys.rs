//! Key naming shared by the store backends.
//!
//! `topic:<name>` holds the members of a topic and `member:<client id>` holds
//! the topics of a client. Row-oriented backends append `\0<item>` to the set
//! key for each element, so names may not contain NUL.

use crate::utils::error::StoreError;

pub const TOPIC_PREFIX: &str = "topic:";
pub const MEMBER_PREFIX: &str = "member:";
pub const SEPARATOR: u8 = 0;

pub fn validate(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.as_bytes().contains(&SEPARATOR) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn topic_key(topic: &str) -> String {
    format!("{TOPIC_PREFIX}{topic}")
}

pub fn member_key(client_id: &str) -> String {
    format!("{MEMBER_PREFIX}{client_id}")
}

/// Prefix shared by every element row of `set_key`.
pub fn row_prefix(set_key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(set_key.len() + 1);
    prefix.extend_from_slice(set_key.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// Row key for `item` inside `set_key`.
pub fn row_key(set_key: &str, item: &str) -> Vec<u8> {
    let mut key = row_prefix(set_key);
    key.extend_from_slice(item.as_bytes());
    key
}

/// Splits a row key back into its set key and item.
pub fn split_row(row: &[u8]) -> Option<(&str, &str)> {
    let pos = row.iter().position(|b| *b == SEPARATOR)?;
    let set_key = std::str::from_utf8(&row[..pos]).ok()?;
    let item = std::str::from_utf8(&row[pos + 1..]).ok()?;
    Some((set_key, item))
}
