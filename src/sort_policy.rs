//! Sort Policy Module
//!
//! Determines how a directory listing is ordered. The mode comes from the `sort`
//! query parameter, the per-directory `.index-sort` marker file, or the built-in
//! default, in that order of precedence. Unrecognized mode strings fall back to the
//! default silently.

use std::cmp::Ordering;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use std::time::SystemTime;
use tracing::debug;

/// Name of the per-directory marker file holding the default sort mode
pub const SORT_MARKER_FILE: &str = ".index-sort";

/// Column a listing is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Date,
    Size,
}

impl SortKey {
    fn as_str(self) -> &'static str {
        match self {
            SortKey::Name => "name",
            SortKey::Date => "date",
            SortKey::Size => "size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn as_str(self) -> &'static str {
        match self {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        }
    }
}

/// Requested ordering of a listing: key × direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            key: SortKey::Name,
            direction: SortDirection::Ascending,
        }
    }
}

impl fmt::Display for SortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.key.as_str(), self.direction.as_str())
    }
}

impl FromStr for SortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, direction) = match s {
            "name-asc" => (SortKey::Name, SortDirection::Ascending),
            "name-desc" => (SortKey::Name, SortDirection::Descending),
            "date-asc" => (SortKey::Date, SortDirection::Ascending),
            "date-desc" => (SortKey::Date, SortDirection::Descending),
            "size-asc" => (SortKey::Size, SortDirection::Ascending),
            "size-desc" => (SortKey::Size, SortDirection::Descending),
            other => return Err(format!("Unknown sort mode: {}", other)),
        };
        Ok(Self { key, direction })
    }
}

impl SortSpec {
    /// Resolve the requested mode from the marker contents and the request override.
    ///
    /// A non-empty request override replaces the marker before the mode is parsed, so an
    /// unrecognized override is not rescued by the marker. `None` means no recognized
    /// mode was requested; listings then use [`SortSpec::default`].
    pub fn resolve(marker: Option<&str>, request_override: Option<&str>) -> Option<Self> {
        let requested = match request_override {
            Some(mode) if !mode.is_empty() => Some(mode),
            _ => marker,
        }?;

        match requested.parse() {
            Ok(spec) => Some(spec),
            Err(e) => {
                debug!("{}, using default sort", e);
                None
            }
        }
    }

    /// Mode string requested by a column header link.
    ///
    /// Only a column explicitly requested ascending links to its descending form; every
    /// other column, and every column when no mode was recognized, links ascending.
    pub fn header_link(active: Option<SortSpec>, column: SortKey) -> SortSpec {
        let direction = match active {
            Some(spec) if spec.key == column && spec.direction == SortDirection::Ascending => {
                SortDirection::Descending
            }
            _ => SortDirection::Ascending,
        };
        SortSpec {
            key: column,
            direction,
        }
    }

    /// Order two listing entries.
    ///
    /// Directories always sort before files whatever the key; within the same class the
    /// key and direction decide. Equal keys compare as `Equal` so a stable sort keeps the
    /// order the directory read produced.
    pub fn compare<E: SortAttributes>(&self, a: &E, b: &E) -> Ordering {
        match (a.is_dir(), b.is_dir()) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }

        let ordering = match self.key {
            SortKey::Name => a.name().cmp(b.name()),
            SortKey::Date => a.modified().cmp(&b.modified()),
            SortKey::Size => a.size().cmp(&b.size()),
        };

        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }

    /// Sort `entries` in place with [`Self::compare`]
    pub fn sort<E: SortAttributes>(&self, entries: &mut [E]) {
        entries.sort_by(|a, b| self.compare(a, b));
    }
}

/// Attributes a listing entry exposes for ordering
pub trait SortAttributes {
    fn name(&self) -> &str;
    fn is_dir(&self) -> bool;
    fn size(&self) -> u64;
    fn modified(&self) -> SystemTime;
}

/// Read the first line of the directory's marker file.
///
/// An absent or unreadable marker both count as no override. A marker that is itself
/// a symlink is never followed and is ignored the same way.
pub fn read_sort_marker(dir: &Path) -> Option<String> {
    let marker_path = dir.join(SORT_MARKER_FILE);
    match std::fs::symlink_metadata(&marker_path) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            debug!("Ignoring symlinked sort marker {:?}", marker_path);
            return None;
        }
        Ok(_) => {}
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Ignoring unreadable sort marker {:?}: {}", marker_path, e);
            }
            return None;
        }
    }

    let file = match std::fs::File::open(&marker_path) {
        Ok(file) => file,
        Err(e) => {
            debug!("Ignoring unreadable sort marker {:?}: {}", marker_path, e);
            return None;
        }
    };

    let mut line = String::new();
    match BufReader::new(file).read_line(&mut line) {
        Ok(_) => Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
        Err(e) => {
            debug!("Ignoring unreadable sort marker {:?}: {}", marker_path, e);
            None
        }
    }
}
