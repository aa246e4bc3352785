//! Property-based tests for listing order
//!
//! Directory-first: for any directory contents and any sort mode, every directory
//! entry precedes every non-directory entry.
//!
//! Determinism: two listings of the same contents with the same mode are identical.

use jail_index::config::ServeRoots;
use jail_index::directory_lister::DirectoryLister;
use jail_index::sort_policy::SortSpec;
use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};
use std::fs::File;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const MODES: [&str; 6] = [
    "name-asc",
    "name-desc",
    "date-asc",
    "date-desc",
    "size-asc",
    "size-desc",
];

#[derive(Debug, Clone)]
struct FixtureEntry {
    is_dir: bool,
    hidden: bool,
    size: u16,
    age_secs: u32,
}

#[derive(Debug, Clone)]
struct Fixture {
    entries: Vec<FixtureEntry>,
    mode: &'static str,
}

impl Arbitrary for Fixture {
    fn arbitrary(g: &mut Gen) -> Self {
        let count = u8::arbitrary(g) % 12;
        let entries = (0..count)
            .map(|_| FixtureEntry {
                is_dir: bool::arbitrary(g),
                hidden: u8::arbitrary(g) % 5 == 0,
                size: u16::arbitrary(g) % 4096,
                age_secs: u32::arbitrary(g) % 100_000,
            })
            .collect();
        Fixture {
            entries,
            mode: *g.choose(&MODES).unwrap_or(&"name-asc"),
        }
    }
}

fn build(fixture: &Fixture) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    for (i, entry) in fixture.entries.iter().enumerate() {
        let name = if entry.hidden {
            format!(".entry{}", i)
        } else {
            format!("entry{}", i)
        };
        let path = temp_dir.path().join(name);
        if entry.is_dir {
            std::fs::create_dir(&path).unwrap();
        } else {
            std::fs::write(&path, vec![0u8; entry.size as usize]).unwrap();
            let file = File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::now() - Duration::from_secs(entry.age_secs as u64))
                .unwrap();
        }
    }
    temp_dir
}

fn prop_directories_first(fixture: Fixture) -> TestResult {
    let temp_dir = build(&fixture);
    let jail = std::fs::canonicalize(temp_dir.path()).unwrap();
    let roots = ServeRoots::new("/", &jail, None);
    let lister = DirectoryLister::new(&roots);

    let mut entries = match lister.read_entries(&jail) {
        Ok(entries) => entries,
        Err(e) => return TestResult::error(format!("read failed: {}", e)),
    };
    let spec = SortSpec::resolve(None, Some(fixture.mode)).unwrap_or_default();
    spec.sort(&mut entries);

    if entries.iter().any(|e| e.name.starts_with('.')) {
        return TestResult::error("hidden entry listed");
    }
    let visible = fixture.entries.iter().filter(|e| !e.hidden).count();
    if entries.len() != visible {
        return TestResult::error(format!("expected {} entries, got {}", visible, entries.len()));
    }
    let first_file = entries.iter().position(|e| !e.is_dir).unwrap_or(entries.len());
    if entries[first_file..].iter().any(|e| e.is_dir) {
        return TestResult::error(format!("directory after file with {}", fixture.mode));
    }
    TestResult::passed()
}

fn prop_render_is_deterministic(fixture: Fixture) -> TestResult {
    let temp_dir = build(&fixture);
    let jail = std::fs::canonicalize(temp_dir.path()).unwrap();
    let roots = ServeRoots::new("/", &jail, None);
    let lister = DirectoryLister::new(&roots);
    let requested = SortSpec::resolve(None, Some(fixture.mode));

    match (
        lister.render_listing(&jail, requested),
        lister.render_listing(&jail, requested),
    ) {
        (Ok(first), Ok(second)) if first == second => TestResult::passed(),
        (Ok(_), Ok(_)) => TestResult::error(format!("listings differ for {}", fixture.mode)),
        (Err(e), _) | (_, Err(e)) => TestResult::error(format!("render failed: {}", e)),
    }
}

#[test]
fn test_property_directories_sort_first() {
    QuickCheck::new()
        .tests(50)
        .quickcheck(prop_directories_first as fn(Fixture) -> TestResult);
}

#[test]
fn test_property_listing_is_deterministic() {
    QuickCheck::new()
        .tests(30)
        .quickcheck(prop_render_is_deterministic as fn(Fixture) -> TestResult);
}
