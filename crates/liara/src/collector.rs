//! # File collection
//!
//! To prepare a source bundle we walk the project tree, listing directories
//! before files at every level, and ask the [`IgnoreResolver`] about each entry.
//!
//! Included files are read and hashed concurrently, and grouped by checksum into
//! a [`ContentMap`], so that files with identical contents are stored only once.

use std::{
    cmp::Ordering,
    collections::HashMap,
    fs::Metadata,
    io,
    path::{Path, PathBuf},
};

use common::hash;
use derive_more::{Display, Error, From};
use futures_util::{stream, StreamExt, TryStreamExt};
use itertools::Itertools;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use crate::{filter::IgnoreResolver, platform::Platform};

/// Maximum amount of files read at the same time.
const CONCURRENT_READS: usize = 15;

/// POSIX mode of executable files and directories.
pub(crate) const EXECUTABLE_MODE: u32 = 0o755;

/// POSIX mode of regular files.
pub(crate) const REGULAR_MODE: u32 = 0o644;

/// Errors that may occur during the file collection process.
#[derive(Debug, Display, From, Error)]
pub(crate) enum CollectError {
    /// IO-related error.
    Io(io::Error),

    /// [`walkdir`]-crate specific error.
    WalkDir(walkdir::Error),

    /// Unable to compile default ignore patterns.
    Ignore(ignore::Error),
}

/// A single regular file of the project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FileEntry {
    /// Content checksum.
    pub checksum: String,

    /// Path relative to the project root, with `/` separators.
    pub path: String,

    /// File size in bytes.
    pub size: u64,

    /// POSIX file mode.
    pub mode: u32,
}

/// A single directory of the project, preserved even when empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DirectoryEntry {
    /// Path relative to the project root, with `/` separators.
    pub path: String,

    /// POSIX directory mode.
    pub mode: u32,
}

/// File contents shared by one or more project files.
#[derive(Debug)]
pub(crate) struct Content {
    /// Raw file contents.
    pub data: Vec<u8>,

    /// Every file with these exact contents.
    pub files: Vec<FileEntry>,
}

/// File contents keyed by their checksum.
pub(crate) type ContentMap = HashMap<String, Content>;

/// Collected project files.
#[derive(Debug)]
pub(crate) struct Collection {
    /// Included regular files, sorted by path.
    pub files: Vec<FileEntry>,

    /// Included directories.
    pub directories: Vec<DirectoryEntry>,

    /// Deduplicated file contents.
    pub contents: ContentMap,
}

/// Absolute paths of project entries that passed ignore filtering.
#[derive(Default)]
pub(crate) struct Walked {
    /// Included directories, in walk order.
    pub directories: Vec<PathBuf>,

    /// Included regular files, in walk order.
    pub files: Vec<PathBuf>,
}

/// Walk the project tree, skipping ignored entries.
///
/// Symbolic links and other special files are skipped.
pub(crate) fn walk(root: &Path, resolver: &IgnoreResolver) -> Result<Walked, walkdir::Error> {
    let mut walked = Walked::default();

    let entries = WalkDir::new(root)
        .min_depth(1)
        .sort_by(directories_first)
        .into_iter()
        .filter_entry(|entry| !entry.file_type().is_dir() || resolver.should_descend(entry.path()));

    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type();

        if !resolver.is_included(entry.path(), file_type.is_dir()) {
            continue;
        }

        if file_type.is_dir() {
            walked.directories.push(entry.into_path());
        } else if file_type.is_file() {
            walked.files.push(entry.into_path());
        }
    }

    Ok(walked)
}

/// Collect included project files together with their contents.
pub(crate) async fn collect(
    root: &Path,
    platform: Option<Platform>,
) -> Result<Collection, CollectError> {
    let walked = walk(root, &IgnoreResolver::new(root, platform)?)?;

    let mut files: Vec<(FileEntry, Vec<u8>)> = stream::iter(walked.files)
        .map(|path| read_entry(root, path))
        .buffer_unordered(CONCURRENT_READS)
        .try_filter_map(|entry| async move { Ok(entry) })
        .try_collect()
        .await?;

    files.sort_by(|(a, _), (b, _)| a.path.cmp(&b.path));

    let mut contents = ContentMap::new();

    let files = files
        .into_iter()
        .map(|(entry, data)| {
            contents
                .entry(entry.checksum.clone())
                .or_insert_with(|| Content {
                    data,
                    files: Vec::new(),
                })
                .files
                .push(entry.clone());

            entry
        })
        .collect();

    let directories = walked
        .directories
        .iter()
        .filter_map(|path| relative_path(root, path))
        .map(|path| DirectoryEntry {
            path,
            mode: EXECUTABLE_MODE,
        })
        .collect();

    Ok(Collection {
        files,
        directories,
        contents,
    })
}

/// Read a single file and compute its metadata.
async fn read_entry(
    root: &Path,
    path: PathBuf,
) -> Result<Option<(FileEntry, Vec<u8>)>, CollectError> {
    let Some(relative) = relative_path(root, &path) else {
        return Ok(None);
    };

    let data = tokio::fs::read(&path).await?;
    let metadata = tokio::fs::metadata(&path).await?;

    let entry = FileEntry {
        checksum: hash::checksum(&data),
        path: relative,
        size: data.len() as u64,
        mode: file_mode(&metadata),
    };

    Ok(Some((entry, data)))
}

/// Path relative to the project root with `/` separators.
///
/// Paths that are not valid Unicode are reported and skipped.
pub(crate) fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;

    let Some(relative) = relative.to_str() else {
        warn!(path = %path.display(), "skipping path with non-unicode symbols");
        return None;
    };

    Some(relative.split(std::path::MAIN_SEPARATOR).join("/"))
}

/// Normalized POSIX mode of a regular file.
#[cfg(unix)]
pub(crate) fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    if metadata.permissions().mode() & 0o111 != 0 {
        EXECUTABLE_MODE
    } else {
        REGULAR_MODE
    }
}

/// Normalized POSIX mode of a regular file.
#[cfg(not(unix))]
pub(crate) fn file_mode(_metadata: &Metadata) -> u32 {
    REGULAR_MODE
}

/// Order directory entries so that subdirectories precede files.
fn directories_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    b.file_type()
        .is_dir()
        .cmp(&a.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}
