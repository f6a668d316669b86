/// Text operations exchanged between peers
/// Positions and lengths count UTF-16 code units
use serde::{Deserialize, Serialize};

use crate::{CollabError, DiffStrategy, Result};

/// A single contiguous edit of the shared buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Insert { position: usize, content: String },
    Delete { position: usize, length: usize },
}

impl Operation {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self::Insert {
            position,
            content: content.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self::Delete { position, length }
    }

    pub fn position(&self) -> usize {
        match self {
            Operation::Insert { position, .. } | Operation::Delete { position, .. } => *position,
        }
    }

    /// Apply this operation to `text`, returning the new text
    pub fn apply_to(&self, text: &str) -> Result<String> {
        let units: Vec<u16> = text.encode_utf16().collect();

        match self {
            Operation::Insert { position, content } => {
                if *position > units.len() {
                    return Err(CollabError::InvalidOp(format!(
                        "insert at {} past end of buffer ({})",
                        position,
                        units.len()
                    )));
                }
                let mut out = Vec::with_capacity(units.len() + content.len());
                out.extend_from_slice(&units[..*position]);
                out.extend(content.encode_utf16());
                out.extend_from_slice(&units[*position..]);
                decode(&out)
            }

            Operation::Delete { position, length } => {
                let end = position.checked_add(*length).ok_or_else(|| {
                    CollabError::InvalidOp("delete range overflows".to_string())
                })?;
                if end > units.len() {
                    return Err(CollabError::InvalidOp(format!(
                        "delete {}..{} past end of buffer ({})",
                        position,
                        end,
                        units.len()
                    )));
                }
                let mut out = Vec::with_capacity(units.len() - length);
                out.extend_from_slice(&units[..*position]);
                out.extend_from_slice(&units[end..]);
                decode(&out)
            }
        }
    }

    /// Where a local cursor at `cursor` ends up once this operation is applied
    pub fn transform_cursor(&self, cursor: usize) -> usize {
        match self {
            Operation::Insert { position, content } => {
                if cursor >= *position {
                    cursor + utf16_len(content)
                } else {
                    cursor
                }
            }
            Operation::Delete { position, length } => {
                if cursor > *position {
                    cursor - (*length).min(cursor - position)
                } else {
                    cursor
                }
            }
        }
    }
}

/// Length of `text` in UTF-16 code units
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

fn decode(units: &[u16]) -> Result<String> {
    String::from_utf16(units)
        .map_err(|_| CollabError::InvalidOp("edit splits a surrogate pair".to_string()))
}

/// Diff two buffers with the configured strategy
pub fn diff_with(strategy: DiffStrategy, old_text: &str, new_text: &str) -> Option<Operation> {
    match strategy {
        DiffStrategy::Scan => compute_operation(old_text, new_text),
        DiffStrategy::PrefixSuffix => compute_operation_linear(old_text, new_text),
    }
}

/// Describe the change from `old_text` to `new_text` as one insert or delete.
///
/// Scans every candidate offset and keeps the smallest one that explains the
/// change. Equal-length edits and edits touching more than one region yield
/// `None`. Quadratic in the buffer length.
pub fn compute_operation(old_text: &str, new_text: &str) -> Option<Operation> {
    let old: Vec<u16> = old_text.encode_utf16().collect();
    let new: Vec<u16> = new_text.encode_utf16().collect();

    if new.len() > old.len() {
        let diff = new.len() - old.len();
        for i in 0..=old.len() {
            if new[..i] == old[..i] && new[i + diff..] == old[i..] {
                // A candidate that cuts through a surrogate pair is not a real edit
                if let Ok(content) = String::from_utf16(&new[i..i + diff]) {
                    return Some(Operation::Insert {
                        position: i,
                        content,
                    });
                }
            }
        }
        None
    } else if new.len() < old.len() {
        let diff = old.len() - new.len();
        for i in 0..=new.len() {
            if old[..i] == new[..i] && old[i + diff..] == new[i..] {
                if String::from_utf16(&old[i..i + diff]).is_ok() {
                    return Some(Operation::Delete {
                        position: i,
                        length: diff,
                    });
                }
            }
        }
        None
    } else {
        None
    }
}

/// Linear-time variant of [`compute_operation`] based on the longest common
/// prefix and suffix. May choose a later offset than the scan when the edit
/// is ambiguous (e.g. inserting a repeated character).
pub fn compute_operation_linear(old_text: &str, new_text: &str) -> Option<Operation> {
    let old: Vec<u16> = old_text.encode_utf16().collect();
    let new: Vec<u16> = new_text.encode_utf16().collect();

    if old.len() == new.len() {
        return None;
    }

    let shorter = old.len().min(new.len());
    let mut prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    // Never start an edit on the low half of a pair
    if prefix > 0 && is_high_surrogate(new[prefix - 1]) && prefix < shorter {
        prefix -= 1;
    }

    let max_suffix = shorter - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    if new.len() > old.len() {
        if prefix + suffix != old.len() {
            return None;
        }
        let end = new.len() - suffix;
        let content = String::from_utf16(&new[prefix..end]).ok()?;
        Some(Operation::Insert {
            position: prefix,
            content,
        })
    } else {
        if prefix + suffix != new.len() {
            return None;
        }
        Some(Operation::Delete {
            position: prefix,
            length: old.len() - new.len(),
        })
    }
}

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..0xDC00).contains(&unit)
}
