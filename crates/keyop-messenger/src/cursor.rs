use keyop_core::error::KeyopError;
use keyop_state::StateStore;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A reader's position within a channel: the day file it last read and
/// the byte offset AFTER the last consumed line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderCursor {
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub offset: u64,
}

/// Cursors for one channel live at `<channel_dir>/.readers/<reader>.json`;
/// this wraps a [`StateStore`] rooted there so persistence reuses the
/// same atomic temp-file-then-rename discipline.
#[derive(Debug, Clone)]
pub struct CursorStore {
    inner: StateStore,
}

impl CursorStore {
    pub fn new(channel_dir: &Path) -> Self {
        CursorStore {
            inner: StateStore::new(channel_dir.join(".readers")),
        }
    }

    pub async fn load(&self, reader_name: &str) -> Result<ReaderCursor, KeyopError> {
        self.inner.load(reader_name).await
    }

    pub async fn save(&self, reader_name: &str, cursor: &ReaderCursor) -> Result<(), KeyopError> {
        self.inner.save(reader_name, cursor).await
    }
}
