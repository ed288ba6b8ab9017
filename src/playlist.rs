use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub path: PathBuf,
    pub display_name: String,
}

impl PlaylistEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, display_name }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

/// Ordered list of files, unique by path, with a cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Playlist {
    entries: Vec<PlaylistEntry>,
    current: Option<usize>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends unless the path is already listed. Returns whether it was added.
    pub fn add(&mut self, entry: PlaylistEntry) -> bool {
        if self.position_of(&entry.path).is_some() {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn remove(&mut self, path: &Path) -> Option<PlaylistEntry> {
        let index = self.position_of(path)?;
        let entry = self.entries.remove(index);
        self.current = match self.current {
            Some(c) if c == index => None,
            Some(c) if c > index => Some(c - 1),
            other => other,
        };
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current = None;
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> Option<&PlaylistEntry> {
        self.current.and_then(|i| self.entries.get(i))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Moves the cursor onto `path` if it is listed.
    pub fn select(&mut self, path: &Path) -> Option<&PlaylistEntry> {
        let index = self.position_of(path)?;
        self.current = Some(index);
        self.entries.get(index)
    }

    /// Advances the cursor. With `wrap`, the last entry is followed by the first.
    pub fn next(&mut self, wrap: bool) -> Option<&PlaylistEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let next = match self.current {
            None => 0,
            Some(i) if i + 1 < self.entries.len() => i + 1,
            Some(_) if wrap => 0,
            Some(_) => return None,
        };
        self.current = Some(next);
        self.entries.get(next)
    }

    pub fn previous(&mut self) -> Option<&PlaylistEntry> {
        let prev = self.current?.checked_sub(1)?;
        self.current = Some(prev);
        self.entries.get(prev)
    }

    fn position_of(&self, path: &Path) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }
}
