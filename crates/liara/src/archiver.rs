//! # Archiver
//!
//! Source bundles are gzip-compressed tar archives.
//!
//! To archive the project we walk the project directory with the same ignore rules
//! used for file collection, and re-check every entry right before it's appended.
//! Headers are written in deterministic mode, so that file modes are normalized
//! to either `0755` or `0644` and timestamps and ownership don't leak into the bundle.

use std::{
    fs::{self, File},
    io,
    path::Path,
};

use derive_more::{Display, Error, From};
use flate2::{write::GzEncoder, Compression};
use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::{debug, warn};

use crate::{
    collector::{relative_path, walk, ContentMap},
    filter::IgnoreResolver,
    platform::Platform,
};

/// Errors that may occur during the archive creation process.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ArchiverError {
    /// IO error.
    Io(io::Error),

    /// [`walkdir`]-crate specific error.
    WalkDir(walkdir::Error),

    /// Unable to compile default ignore patterns.
    Ignore(ignore::Error),

    /// Every file of the project matched some ignore rule.
    #[display(
        fmt = "All files of the project are ignored. Check your .liaraignore, .dockerignore and .gitignore files."
    )]
    AllFilesIgnored,
}

/// Archive the project located at `project` into the `dest` file.
///
/// Returns the size of the compressed archive in bytes.
pub(crate) fn build_archive(
    dest: &Path,
    project: &Path,
    platform: Option<Platform>,
) -> Result<u64, ArchiverError> {
    let resolver = IgnoreResolver::new(project, platform)?;
    let walked = walk(project, &resolver)?;

    if walked.files.is_empty() {
        return Err(ArchiverError::AllFilesIgnored);
    }

    let mut builder = Builder::new(GzEncoder::new(File::create(dest)?, Compression::best()));

    let entries = walked
        .directories
        .iter()
        .map(|path| (path, true))
        .chain(walked.files.iter().map(|path| (path, false)));

    for (path, is_dir) in entries {
        if !resolver.is_included(path, is_dir) {
            debug!(path = %path.display(), "entry excluded while archiving");
            continue;
        }

        let Some(name) = relative_path(project, path) else {
            continue;
        };

        let metadata = fs::metadata(path)?;
        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&metadata, HeaderMode::Deterministic);

        if is_dir {
            builder.append_data(&mut header, &name, io::empty())?;
        } else {
            builder.append_data(&mut header, &name, File::open(path)?)?;
        }
    }

    builder.into_inner()?.finish()?;

    Ok(fs::metadata(dest)?.len())
}

/// Archive only the files whose checksums are listed in `checksums`.
///
/// Used to upload contents that the platform reported as missing.
pub(crate) fn build_partial_archive(
    dest: &Path,
    contents: &ContentMap,
    checksums: &[String],
) -> Result<u64, ArchiverError> {
    let mut builder = Builder::new(GzEncoder::new(File::create(dest)?, Compression::best()));

    for checksum in checksums {
        let Some(content) = contents.get(checksum) else {
            warn!(%checksum, "requested contents are not part of the project");
            continue;
        };

        for file in &content.files {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(content.data.len() as u64);
            header.set_mode(file.mode);
            header.set_mtime(0);

            builder.append_data(&mut header, &file.path, content.data.as_slice())?;
        }
    }

    builder.into_inner()?.finish()?;

    Ok(fs::metadata(dest)?.len())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, fs, io::Read, path::Path};

    use common::hash;
    use flate2::read::GzDecoder;
    use tar::Archive;
    use tempfile::{NamedTempFile, TempDir};

    use super::{build_archive, build_partial_archive, ArchiverError};
    use crate::collector::collect;

    fn write(root: &Path, path: &str, contents: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// Read archive entries as `(path, contents)` pairs, omitting directories.
    fn read_files(path: &Path) -> BTreeSet<(String, String)> {
        let mut archive = Archive::new(GzDecoder::new(fs::File::open(path).unwrap()));

        archive
            .entries()
            .unwrap()
            .map(Result::unwrap)
            .filter(|entry| entry.header().entry_type().is_file())
            .map(|mut entry| {
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let mut contents = String::new();
                entry.read_to_string(&mut contents).unwrap();
                (path, contents)
            })
            .collect()
    }

    #[test]
    fn extracts_filtered_set() {
        for ignore_file in [".liaraignore", ".dockerignore", ".gitignore"] {
            let dir = TempDir::new().unwrap();
            let root = dir.path();

            write(root, ignore_file, "*.log\nbuild/\n");
            write(root, "index.js", "main");
            write(root, "lib/util.js", "util");
            write(root, "lib/debug.log", "noise");
            write(root, "build/out.js", "artifact");
            write(root, "node_modules/left-pad/index.js", "pad");

            let archive = NamedTempFile::new().unwrap();
            let size = build_archive(archive.path(), root, None).unwrap();

            assert!(size > 0);
            assert_eq!(
                read_files(archive.path()),
                BTreeSet::from([
                    (ignore_file.to_string(), String::from("*.log\nbuild/\n")),
                    (String::from("index.js"), String::from("main")),
                    (String::from("lib/util.js"), String::from("util")),
                ])
            );
        }
    }

    #[test]
    fn keeps_empty_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        write(root, "index.html", "");
        fs::create_dir_all(root.join("uploads")).unwrap();

        let archive = NamedTempFile::new().unwrap();
        build_archive(archive.path(), root, None).unwrap();

        let mut reader = Archive::new(GzDecoder::new(fs::File::open(archive.path()).unwrap()));
        let directories: Vec<_> = reader
            .entries()
            .unwrap()
            .map(Result::unwrap)
            .filter(|entry| entry.header().entry_type().is_dir())
            .map(|entry| entry.header().mode().unwrap())
            .collect();

        assert_eq!(directories, [0o755]);
    }

    #[test]
    fn all_files_ignored() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        write(root, ".liaraignore", "*\n");
        write(root, "index.js", "");
        write(root, "src/app.js", "");

        let archive = NamedTempFile::new().unwrap();

        assert!(matches!(
            build_archive(archive.path(), root, None),
            Err(ArchiverError::AllFilesIgnored)
        ));
    }

    #[tokio::test]
    async fn partial_archive() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        write(root, "a.txt", "shared");
        write(root, "b/c.txt", "shared");
        write(root, "d.txt", "unique");

        let collection = collect(root, None).await.unwrap();
        let archive = NamedTempFile::new().unwrap();

        build_partial_archive(
            archive.path(),
            &collection.contents,
            &[hash::checksum(b"shared"), String::from("unknown")],
        )
        .unwrap();

        assert_eq!(
            read_files(archive.path()),
            BTreeSet::from([
                (String::from("a.txt"), String::from("shared")),
                (String::from("b/c.txt"), String::from("shared")),
            ])
        );
    }
}
