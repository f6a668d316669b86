/// UI seams: the editable text area and the connection status display
use parking_lot::Mutex;

use crate::CursorIndicator;

/// The editable text area the shared buffer is shown in.
///
/// Offsets are UTF-16 code units. Implementations must not call back into the
/// sync engine from `set_content` or `set_cursor`; if they do, the engine's
/// apply gate ignores the nested event.
pub trait TextSurface: Send + Sync {
    fn content(&self) -> String;

    fn set_content(&self, text: &str);

    /// Caret offset, if the surface has focus
    fn cursor(&self) -> Option<usize>;

    fn set_cursor(&self, position: usize);

    /// Draw remote cursor indicators, replacing the previous set
    fn render_cursors(&self, _indicators: &[CursorIndicator]) {}
}

/// Connection status display
pub trait StatusView: Send + Sync {
    /// e.g. "Looking for peers..." or "Connected to 2 peer(s)"
    fn show_status(&self, text: &str);

    /// Local participant included
    fn show_participant_count(&self, count: usize);
}

#[derive(Debug, Default)]
struct HeadlessState {
    content: String,
    cursor: Option<usize>,
    indicators: Vec<CursorIndicator>,
    status: String,
    participant_count: usize,
}

/// In-memory surface for terminals and tests
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    state: Mutex<HeadlessState>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the user typing: replace the text and move the caret
    pub fn type_text(&self, text: &str, cursor: usize) {
        let mut state = self.state.lock();
        state.content = text.to_string();
        state.cursor = Some(cursor);
    }

    pub fn indicators(&self) -> Vec<CursorIndicator> {
        self.state.lock().indicators.clone()
    }

    pub fn status(&self) -> String {
        self.state.lock().status.clone()
    }

    pub fn participant_count(&self) -> usize {
        self.state.lock().participant_count
    }
}

impl TextSurface for HeadlessSurface {
    fn content(&self) -> String {
        self.state.lock().content.clone()
    }

    fn set_content(&self, text: &str) {
        self.state.lock().content = text.to_string();
    }

    fn cursor(&self) -> Option<usize> {
        self.state.lock().cursor
    }

    fn set_cursor(&self, position: usize) {
        self.state.lock().cursor = Some(position);
    }

    fn render_cursors(&self, indicators: &[CursorIndicator]) {
        self.state.lock().indicators = indicators.to_vec();
    }
}

impl StatusView for HeadlessSurface {
    fn show_status(&self, text: &str) {
        self.state.lock().status = text.to_string();
    }

    fn show_participant_count(&self, count: usize) {
        self.state.lock().participant_count = count;
    }
}
