/// Participant identity and remote cursor tracking
/// Shows where other participants are typing in the shared buffer
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ParticipantId;

/// Fixed palette participant colors are drawn from
pub const PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
    "#BB8FCE", "#85C1E9",
];

/// Approximate glyph metrics used to place cursor indicators
pub const CHAR_WIDTH_PX: usize = 8;
pub const LINE_HEIGHT_PX: usize = 20;

/// Color used to distinguish a participant's cursor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayColor(pub String);

impl DisplayColor {
    /// Pick a random color from the palette
    pub fn random() -> Self {
        let color = PALETTE
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(PALETTE[0]);
        Self(color.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DisplayColor {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of the local user for this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub color: DisplayColor,
}

impl Participant {
    /// Fresh identity; never persisted across restarts
    pub fn generate() -> Self {
        Self {
            id: ParticipantId::generate(),
            color: DisplayColor::random(),
        }
    }
}

/// Last known cursor of a remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorMark {
    /// UTF-16 offset, `None` when unknown
    pub position: Option<usize>,
    pub color: DisplayColor,
    pub last_seen_at_ms: i64,
}

/// A cursor ready to be drawn next to the text surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorIndicator {
    pub participant_id: ParticipantId,
    pub color: DisplayColor,
    pub position: usize,

    /// Zero-based line of the cursor
    pub line: usize,

    /// Zero-based column, in UTF-16 code units
    pub column: usize,

    pub left_px: usize,
    pub top_px: usize,

    /// Hover label, e.g. "User 1234"
    pub label: String,
}

/// Tracks remote cursors; staleness is checked lazily on render
#[derive(Debug, Clone, Default)]
pub struct CursorTracker {
    marks: HashMap<ParticipantId, CursorMark>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self {
            marks: HashMap::new(),
        }
    }

    /// Record a cursor update; `position` may be `None`
    pub fn update(
        &mut self,
        participant_id: ParticipantId,
        position: Option<usize>,
        color: DisplayColor,
        now_ms: i64,
    ) {
        self.marks.insert(
            participant_id,
            CursorMark {
                position,
                color,
                last_seen_at_ms: now_ms,
            },
        );
    }

    /// Heartbeat: refresh last-seen, the position becomes unknown
    pub fn touch(&mut self, participant_id: ParticipantId, color: DisplayColor, now_ms: i64) {
        self.update(participant_id, None, color, now_ms);
    }

    pub fn remove(&mut self, participant_id: &ParticipantId) -> Option<CursorMark> {
        self.marks.remove(participant_id)
    }

    pub fn clear(&mut self) {
        self.marks.clear();
    }

    pub fn get(&self, participant_id: &ParticipantId) -> Option<&CursorMark> {
        self.marks.get(participant_id)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Drop marks not seen within `window_ms`; returns how many were dropped
    pub fn evict_stale(&mut self, now_ms: i64, window_ms: i64) -> usize {
        let before = self.marks.len();
        self.marks
            .retain(|_, mark| now_ms - mark.last_seen_at_ms <= window_ms);
        before - self.marks.len()
    }

    /// Indicators for every mark with a known position, ordered by participant
    pub fn indicators(&self, text: &str) -> Vec<CursorIndicator> {
        let units: Vec<u16> = text.encode_utf16().collect();

        let mut indicators: Vec<CursorIndicator> = self
            .marks
            .iter()
            .filter_map(|(participant_id, mark)| {
                let position = mark.position?;
                let (line, column) = line_and_column(&units, position);
                Some(CursorIndicator {
                    participant_id: participant_id.clone(),
                    color: mark.color.clone(),
                    position,
                    line,
                    column,
                    left_px: column * CHAR_WIDTH_PX,
                    top_px: line * LINE_HEIGHT_PX,
                    label: format!("User {}", participant_id.short()),
                })
            })
            .collect();

        indicators.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        indicators
    }
}

/// Line and column of a UTF-16 offset; offsets past the end clamp to it
fn line_and_column(units: &[u16], position: usize) -> (usize, usize) {
    let before = &units[..position.min(units.len())];
    let newline = u16::from(b'\n');
    let line = before.iter().filter(|&&u| u == newline).count();
    let column = match before.iter().rposition(|&u| u == newline) {
        Some(idx) => before.len() - idx - 1,
        None => before.len(),
    };
    (line, column)
}
