//! Directory Lister Module
//!
//! Reads a jailed directory, resolves symlinked entries for display, orders the
//! entries with the sort policy and renders the HTML index page.

use crate::config::ServeRoots;
use crate::file_delivery::guess_content_type;
use crate::path_translator::normalize_path;
use crate::sort_policy::{SortAttributes, SortKey, SortSpec};
use crate::{ProxyError, Result};
use chrono::{DateTime, Local};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt::Write;
use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Characters escaped in entry hrefs; `/` is kept so the link stays a path
const HREF_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Timestamp format of the Last-Modified column
const MODIFIED_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <title>{title}</title>
    <meta charset="utf-8">
    <meta http-equiv="X-UA-Compatible" content="IE=edge">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style type="text/css">
body { font-family: sans-serif; margin: 1em 2em; }
a { color: #003fff; }
table { border-collapse: collapse; }
td, th { white-space: nowrap; padding: 0.2em 0.6em; border: 1px solid #ddd; }
tbody tr:nth-child(odd) { background: #f6f6f6; }
.modified { text-align: center; width: 17em; }
.size { width: 6em; }
th.size { text-align: center; }
td.size { text-align: right; }
.type { width: 15em; }
th.type { text-align: center; }
    </style>
  </head>
  <body>
    <h2>Index of {title}</h2>
    <table>
      <thead>
        <tr>
          <th class="name"><a href="?sort={name_sort}">Name</a></th>
          <th class="size"><a href="?sort={size_sort}">Size</a></th>
          <th class="modified"><a href="?sort={date_sort}">Last Modified</a></th>
          <th class="type">Type</th>
        </tr>
      </thead>
      <tbody>
"#;

const PARENT_ROW: &str = r#"        <tr>
          <td class="name"><a href="{href}">../</a></td>
          <td class="size"></td>
          <td class="modified"></td>
          <td class="type">Directory</td>
        </tr>
"#;

const PAGE_TAIL: &str = r#"      </tbody>
    </table>
  </body>
</html>
"#;

/// One entry observed while listing a directory
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
    /// The entry is a symlink whose in-jail target supplied the attributes above
    pub followed_symlink: bool,
}

impl DirectoryEntry {
    fn from_metadata(name: String, metadata: &Metadata, followed_symlink: bool) -> Self {
        Self {
            name,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: metadata.is_dir(),
            followed_symlink,
        }
    }
}

impl SortAttributes for DirectoryEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn modified(&self) -> SystemTime {
        self.modified
    }
}

/// Renders directory indexes for paths beneath the jail
pub struct DirectoryLister<'a> {
    roots: &'a ServeRoots,
}

impl<'a> DirectoryLister<'a> {
    pub fn new(roots: &'a ServeRoots) -> Self {
        Self { roots }
    }

    /// Read the visible entries of `dir` in directory order.
    ///
    /// Entries starting with `.` are skipped, as are names that are not valid UTF-8 and
    /// so cannot be linked. Symlinks take the attributes of their final target when the
    /// whole chain resolves inside the jail; otherwise they keep their own.
    pub fn read_entries(&self, dir: &Path) -> Result<Vec<DirectoryEntry>> {
        let read_dir =
            std::fs::read_dir(dir).map_err(|e| ProxyError::ListingReadError(e.to_string()))?;

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| ProxyError::ListingReadError(e.to_string()))?;
            let name = match dir_entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!("Skipping entry with non UTF-8 name {:?} in {:?}", raw, dir);
                    continue;
                }
            };
            if name.starts_with('.') {
                continue;
            }

            let entry_path = dir_entry.path();
            let own_metadata = std::fs::symlink_metadata(&entry_path)
                .map_err(|e| ProxyError::ListingReadError(e.to_string()))?;

            let entry = if own_metadata.file_type().is_symlink() {
                match self.follow_symlink(&entry_path) {
                    Some(target_metadata) => {
                        DirectoryEntry::from_metadata(name, &target_metadata, true)
                    }
                    None => DirectoryEntry::from_metadata(name, &own_metadata, false),
                }
            } else {
                DirectoryEntry::from_metadata(name, &own_metadata, false)
            };
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Metadata of the final target of a symlink chain, if every hop stays in the jail
    fn follow_symlink(&self, link_path: &Path) -> Option<Metadata> {
        let target = match self.roots.guard().check_resolved(link_path) {
            Ok(target) => target,
            Err(e) => {
                debug!("Listing symlink {:?} with its own attributes: {}", link_path, e);
                return None;
            }
        };
        std::fs::metadata(&target).ok()
    }

    /// Read, sort and render the index page for `dir`.
    ///
    /// `requested` is the recognized sort mode, if any; entries are ordered by the
    /// default mode without one.
    pub fn render_listing(&self, dir: &Path, requested: Option<SortSpec>) -> Result<String> {
        let mut entries = self.read_entries(dir)?;
        let spec = requested.unwrap_or_default();
        spec.sort(&mut entries);
        debug!(
            "Listing {:?}: {} entries sorted by {}",
            dir,
            entries.len(),
            spec
        );
        Ok(self.render(dir, &entries, requested))
    }

    /// Render already sorted entries
    pub fn render(
        &self,
        dir: &Path,
        entries: &[DirectoryEntry],
        requested: Option<SortSpec>,
    ) -> String {
        let translator = self.roots.translator();
        let title = escape_html(&translator.to_proxy(dir));

        // Title goes in last so a path containing a placeholder is left alone
        let link = |column| SortSpec::header_link(requested, column).to_string();
        let mut html = PAGE_HEAD
            .replace("{name_sort}", &link(SortKey::Name))
            .replace("{size_sort}", &link(SortKey::Size))
            .replace("{date_sort}", &link(SortKey::Date))
            .replace("{title}", &title);

        if let Some(parent) = self.parent_link(dir) {
            html.push_str(&PARENT_ROW.replace("{href}", &escape_html(&parent)));
        }

        for entry in entries {
            let mut href = encode_href(&translator.to_proxy(&dir.join(&entry.name)));
            let mut display_name = entry.name.clone();
            let size_text = if entry.is_dir {
                href = with_trailing_slash(href);
                display_name.push('/');
                "-".to_string()
            } else {
                format_size(entry.size)
            };
            let content_type = guess_content_type(Path::new(&entry.name));

            // Writing into a String cannot fail
            let _ = write!(
                html,
                r#"        <tr>
          <td class="name"><a href="{}">{}</a></td>
          <td class="size">{}</td>
          <td class="modified">{}</td>
          <td class="type">{}</td>
        </tr>
"#,
                escape_html(&href),
                escape_html(&display_name),
                escape_html(&size_text).replace(' ', "&nbsp;"),
                escape_html(&format_modified(entry.modified)),
                escape_html(&content_type),
            );
        }

        html.push_str(PAGE_TAIL);
        html
    }

    /// Proxy link for the `../` row; none at the jail root itself.
    ///
    /// The link is absolute so it works whether or not the request carried a trailing slash.
    fn parent_link(&self, dir: &Path) -> Option<String> {
        let guard = self.roots.guard();
        if normalize_path(&dir.to_string_lossy()) == normalize_path(&guard.root().to_string_lossy())
        {
            return None;
        }
        let parent = dir.parent().filter(|p| guard.contains(p))?;
        Some(with_trailing_slash(encode_href(
            &self.roots.translator().to_proxy(parent),
        )))
    }
}

fn with_trailing_slash(mut path: String) -> String {
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// Human-scaled size with two decimals: KiB below 1 MiB, MiB below 1 GiB, GiB above
pub fn format_size(size: u64) -> String {
    if size < MIB {
        format!("{:.2} KiB", size as f64 / KIB as f64)
    } else if size < GIB {
        format!("{:.2} MiB", size as f64 / MIB as f64)
    } else {
        format!("{:.2} GiB", size as f64 / GIB as f64)
    }
}

/// Last-Modified column text in the server's local zone
pub fn format_modified(modified: SystemTime) -> String {
    let local: DateTime<Local> = modified.into();
    local.format(MODIFIED_FORMAT).to_string()
}

pub(crate) fn encode_href(path: &str) -> String {
    utf8_percent_encode(path, HREF_ENCODE_SET).to_string()
}

/// Escape text for insertion into HTML element content or attribute values
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_size_thresholds() {
        assert_eq!(format_size(0), "0.00 KiB");
        assert_eq!(format_size(512), "0.50 KiB");
        assert_eq!(format_size(1024), "1.00 KiB");
        assert_eq!(format_size(MIB - 1), "1024.00 KiB");
        assert_eq!(format_size(2_097_152), "2.00 MiB");
        assert_eq!(format_size(3 * GIB / 2), "1.50 GiB");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&#34;x&#34;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_encode_href_keeps_separators() {
        assert_eq!(encode_href("/files/a b/#1?.txt"), "/files/a%20b/%231%3F.txt");
    }

    #[test]
    fn test_format_modified_includes_zone() {
        let text = format_modified(SystemTime::UNIX_EPOCH);
        // "YYYY-MM-DD HH:MM:SS +ZZZZ"
        assert_eq!(text.len(), 25);
        let sign = text.chars().nth(20).unwrap();
        assert!(sign == '+' || sign == '-');
    }

    #[test]
    fn test_read_entries_skips_hidden() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(".index-sort"), "size-desc").unwrap();
        std::fs::write(temp_dir.path().join(".hidden"), "x").unwrap();
        std::fs::write(temp_dir.path().join("shown.txt"), "x").unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let roots = ServeRoots::new("/", temp_dir.path(), None);
        let lister = DirectoryLister::new(&roots);
        let mut names: Vec<String> = lister
            .read_entries(temp_dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["shown.txt", "sub"]);
    }

    #[test]
    fn test_read_entries_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let roots = ServeRoots::new("/", temp_dir.path(), None);
        let lister = DirectoryLister::new(&roots);
        assert!(matches!(
            lister.read_entries(&temp_dir.path().join("nope")),
            Err(ProxyError::ListingReadError(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_entries_use_target_attributes_inside_jail_only() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("big.bin"), vec![0u8; 4096]).unwrap();

        let jail = TempDir::new().unwrap();
        std::fs::write(jail.path().join("target.bin"), vec![0u8; 2048]).unwrap();
        std::fs::create_dir(jail.path().join("dir")).unwrap();
        std::os::unix::fs::symlink("target.bin", jail.path().join("inside-link")).unwrap();
        std::os::unix::fs::symlink("dir", jail.path().join("dir-link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("big.bin"), jail.path().join("out-link"))
            .unwrap();
        std::os::unix::fs::symlink("missing", jail.path().join("dangling")).unwrap();

        let roots = ServeRoots::new("/", jail.path(), None);
        let lister = DirectoryLister::new(&roots);
        let entries = lister.read_entries(jail.path()).unwrap();
        let find = |name: &str| entries.iter().find(|e| e.name == name).unwrap().clone();

        let inside = find("inside-link");
        assert!(inside.followed_symlink);
        assert_eq!(inside.size, 2048);

        assert!(find("dir-link").is_dir);

        let out = find("out-link");
        assert!(!out.followed_symlink);
        assert_ne!(out.size, 4096);

        assert!(!find("dangling").followed_symlink);
    }

    #[test]
    fn test_render_marks_directories_and_escapes_names() {
        let temp_dir = TempDir::new().unwrap();
        let roots = ServeRoots::new("/files", temp_dir.path(), None);
        let lister = DirectoryLister::new(&roots);
        let sub = temp_dir.path().join("sub");

        let entries = vec![
            DirectoryEntry {
                name: "docs".to_string(),
                size: 4096,
                modified: SystemTime::UNIX_EPOCH,
                is_dir: true,
                followed_symlink: false,
            },
            DirectoryEntry {
                name: "<b>.txt".to_string(),
                size: 2_097_152,
                modified: SystemTime::UNIX_EPOCH,
                is_dir: false,
                followed_symlink: false,
            },
        ];
        let html = lister.render(&sub, &entries, Some(SortSpec::default()));

        assert!(html.contains("<title>/files/sub</title>"));
        assert!(html.contains(r#"<a href="/files/sub/docs/">docs/</a>"#));
        assert!(html.contains(r#"<td class="size">-</td>"#));
        assert!(html.contains("&lt;b&gt;.txt"));
        assert!(!html.contains("<b>.txt"));
        assert!(html.contains("2.00&nbsp;MiB"));
        assert!(html.contains("text/plain"));
        assert!(html.contains(r#"href="?sort=name-desc""#));
        assert!(html.contains(r#"href="?sort=size-asc""#));
        assert!(html.contains(r#"href="?sort=date-asc""#));
        assert!(html.contains(r#"<a href="/files/">../</a>"#));
    }

    #[test]
    fn test_render_jail_root_has_no_parent_row() {
        let temp_dir = TempDir::new().unwrap();
        let roots = ServeRoots::new("/files", temp_dir.path(), None);
        let lister = DirectoryLister::new(&roots);

        let html = lister.render(temp_dir.path(), &[], None);
        assert!(html.contains("<title>/files</title>"));
        assert!(!html.contains(">../</a>"));
        assert!(html.contains(r#"href="?sort=name-asc""#));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_chain_leaving_jail_keeps_own_attributes() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("big.bin"), vec![0u8; 4096]).unwrap();

        let jail = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("big.bin"), jail.path().join(".hop"))
            .unwrap();
        std::os::unix::fs::symlink(".hop", jail.path().join("innocent")).unwrap();
        std::fs::write(jail.path().join("real.bin"), vec![0u8; 2048]).unwrap();
        std::os::unix::fs::symlink("real.bin", jail.path().join(".inner")).unwrap();
        std::os::unix::fs::symlink(".inner", jail.path().join("chained")).unwrap();

        let roots = ServeRoots::new("/", jail.path(), None);
        let lister = DirectoryLister::new(&roots);
        let entries = lister.read_entries(jail.path()).unwrap();
        let find = |name: &str| entries.iter().find(|e| e.name == name).unwrap().clone();

        let innocent = find("innocent");
        assert!(!innocent.followed_symlink);
        assert_ne!(innocent.size, 4096);

        let chained = find("chained");
        assert!(chained.followed_symlink);
        assert_eq!(chained.size, 2048);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_entries_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(OsStr::from_bytes(b"bad\xff.txt")), "x").unwrap();
        std::fs::write(temp_dir.path().join("good.txt"), "x").unwrap();

        let roots = ServeRoots::new("/", temp_dir.path(), None);
        let lister = DirectoryLister::new(&roots);
        let names: Vec<String> = lister
            .read_entries(temp_dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["good.txt"]);
    }
}
