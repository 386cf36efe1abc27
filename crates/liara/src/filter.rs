//! # Ignore rules
//!
//! Every directory of a project may contain its own ignore file. Only the first
//! file found out of [`IGNORE_FILES`] is loaded for a directory, so a `.liaraignore`
//! hides both `.dockerignore` and `.gitignore` placed next to it. Directories
//! deeper in the tree load their own files independently.
//!
//! Patterns are rewritten to be relative to the project root, which allows all
//! of them to be compiled against a single root. Nested files take priority over
//! their ancestors, so a nested negation can re-include paths excluded higher up.
//!
//! A fixed set of default patterns, extended with platform-specific ones, forms
//! the lowest priority layer and is active regardless of user ignore files.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use ignore::{
    gitignore::{Gitignore, GitignoreBuilder},
    Match,
};
use itertools::Itertools;
use tracing::{debug, warn};

use crate::platform::Platform;

/// Ignore file names in the order of their priority.
pub(crate) const IGNORE_FILES: [&str; 3] = [".liaraignore", ".dockerignore", ".gitignore"];

/// Patterns excluded from every deployment.
const DEFAULT_IGNORES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".idea",
    ".vscode",
    ".DS_Store",
    "*~",
    "*.swp",
    "*.bak",
    "node_modules",
    "bower_components",
];

/// Characters with a special meaning inside of glob patterns.
const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Literal path named by an anchored negation, relative to the project root.
struct NegatedPath {
    /// Path components up to the first one containing a glob.
    components: Vec<String>,

    /// Whether the pattern continues with a glob after the literal components.
    wildcard: bool,
}

impl NegatedPath {
    /// Check if the negation may re-include some path located under `dir`.
    fn reaches_into(&self, dir: &[String]) -> bool {
        let shared = self.components.len().min(dir.len());

        self.components[..shared] == dir[..shared]
            && (self.components.len() > dir.len() || self.wildcard)
    }
}

/// Compiled patterns of a single ignore file.
struct IgnoreSet {
    /// Pattern matcher rooted at the project root.
    matcher: Gitignore,

    /// Anchored negations, which may re-include contents of excluded directories.
    negations: Vec<NegatedPath>,
}

/// Per-path inclusion decisions for a single project tree.
pub(crate) struct IgnoreResolver {
    /// Project root directory.
    root: PathBuf,

    /// Default and platform-specific patterns.
    base: Gitignore,

    /// Ignore sets keyed by the directory that declares them.
    cache: RefCell<HashMap<PathBuf, Option<Rc<IgnoreSet>>>>,
}

impl IgnoreResolver {
    /// Create a new resolver for the project located at `root`.
    pub(crate) fn new(root: &Path, platform: Option<Platform>) -> Result<Self, ignore::Error> {
        let mut builder = GitignoreBuilder::new(root);

        let platform_ignores = platform.map(Platform::ignore_patterns).unwrap_or_default();

        for pattern in DEFAULT_IGNORES.iter().chain(platform_ignores) {
            builder.add_line(None, pattern)?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            base: builder.build()?,
            cache: RefCell::default(),
        })
    }

    /// Check if the path should be part of the source bundle.
    ///
    /// Default patterns are checked against the path and all of its ancestors
    /// first, so user negations can't re-include anything they exclude.
    pub(crate) fn is_included(&self, path: &Path, is_dir: bool) -> bool {
        if self.base_excludes(path, is_dir) {
            return false;
        }

        let Some(parent) = path.parent() else {
            return true;
        };

        let layers = self.layers(parent);

        for (candidate, candidate_is_dir) in self.candidates(path, is_dir) {
            for layer in &layers {
                match layer.matcher.matched(candidate, candidate_is_dir) {
                    Match::Ignore(_) => return false,
                    Match::Whitelist(_) => return true,
                    Match::None => {}
                }
            }
        }

        true
    }

    /// Check if the walk has to enter the directory.
    ///
    /// Excluded directories are still entered when an anchored negation in scope
    /// names some path inside of them. Directories excluded by default patterns
    /// are never entered.
    pub(crate) fn should_descend(&self, dir: &Path) -> bool {
        if self.base_excludes(dir, true) {
            return false;
        }

        if self.is_included(dir, true) {
            return true;
        }

        let relative = relative_components(&self.root, dir);

        self.layers(dir)
            .iter()
            .flat_map(|layer| &layer.negations)
            .any(|negation| negation.reaches_into(&relative))
    }

    /// The path and its ancestors below the project root, nearest first,
    /// paired with their directory flags.
    fn candidates<'a>(
        &'a self,
        path: &'a Path,
        is_dir: bool,
    ) -> impl Iterator<Item = (&'a Path, bool)> + 'a {
        path.ancestors()
            .take_while(move |ancestor| *ancestor != self.root && ancestor.starts_with(&self.root))
            .enumerate()
            .map(move |(depth, ancestor)| (ancestor, depth > 0 || is_dir))
    }

    /// Check if default patterns exclude the path or any of its ancestors.
    fn base_excludes(&self, path: &Path, is_dir: bool) -> bool {
        self.candidates(path, is_dir)
            .any(|(candidate, candidate_is_dir)| {
                self.base.matched(candidate, candidate_is_dir).is_ignore()
            })
    }

    /// Ignore sets applicable to entries of `dir`, nearest first.
    fn layers(&self, dir: &Path) -> Vec<Rc<IgnoreSet>> {
        dir.ancestors()
            .take_while(|ancestor| ancestor.starts_with(&self.root))
            .filter_map(|ancestor| self.ignore_set(ancestor))
            .collect()
    }

    /// Ignore set declared directly inside of `dir`.
    fn ignore_set(&self, dir: &Path) -> Option<Rc<IgnoreSet>> {
        if let Some(cached) = self.cache.borrow().get(dir) {
            return cached.clone();
        }

        let set = self.load(dir).map(Rc::new);
        self.cache
            .borrow_mut()
            .insert(dir.to_path_buf(), set.clone());
        set
    }

    /// Load and compile the highest priority ignore file of `dir`.
    fn load(&self, dir: &Path) -> Option<IgnoreSet> {
        let (file, contents) = IGNORE_FILES.iter().find_map(|name| {
            let file = dir.join(name);
            fs::read_to_string(&file).ok().map(|contents| (file, contents))
        })?;

        debug!(file = %file.display(), "loading ignore file");

        let components = relative_components(&self.root, dir);
        let prefix = components.iter().map(|component| escape_glob(component)).join("/");

        let mut builder = GitignoreBuilder::new(&self.root);
        let mut negations = Vec::new();

        for line in contents.lines() {
            let Some(pattern) = rebase_pattern(line, &prefix) else {
                continue;
            };

            negations.extend(negated_path(line, &components));

            if let Err(error) = builder.add_line(Some(file.clone()), &pattern) {
                warn!(%error, file = %file.display(), "skipping invalid ignore pattern");
            }
        }

        match builder.build() {
            Ok(matcher) => Some(IgnoreSet { matcher, negations }),
            Err(error) => {
                warn!(%error, file = %file.display(), "unable to compile ignore file");
                None
            }
        }
    }
}

/// Components of `path` relative to the project root.
fn relative_components(root: &Path, path: &Path) -> Vec<String> {
    path.strip_prefix(root)
        .map(|relative| {
            relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Escape glob metacharacters of a literal path component.
fn escape_glob(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if GLOB_CHARS.contains(&c) {
                format!("[{c}]")
            } else {
                c.to_string()
            }
        })
        .collect()
}

/// Literal path of an anchored negation declared in the directory `prefix`.
///
/// Unanchored negations, such as `!README.md`, only re-include entries
/// of directories that are walked anyway, so they are skipped.
fn negated_path(line: &str, prefix: &[String]) -> Option<NegatedPath> {
    let pattern = line.trim_end().strip_prefix('!')?;
    let anchored = pattern.starts_with('/') || pattern.trim_end_matches('/').contains('/');

    if !anchored {
        return None;
    }

    let mut components = prefix.to_vec();
    let mut wildcard = false;

    for component in pattern.split('/').filter(|component| !component.is_empty()) {
        if component.contains(GLOB_CHARS) {
            wildcard = true;
            break;
        }

        components.push(component.to_string());
    }

    Some(NegatedPath {
        components,
        wildcard,
    })
}

/// Rewrite a single ignore file line to be relative to the project root.
///
/// `prefix` is the glob-escaped path of the directory containing the ignore file,
/// relative to the project root and using `/` separators. Comments and blank
/// lines are dropped.
fn rebase_pattern(line: &str, prefix: &str) -> Option<String> {
    let line = line.trim_end();

    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if prefix.is_empty() {
        return Some(line.to_string());
    }

    let (negation, pattern) = match line.strip_prefix('!') {
        Some(pattern) => ("!", pattern),
        None => ("", line),
    };

    let anchored = pattern.starts_with('/') || pattern.trim_end_matches('/').contains('/');
    let pattern = pattern.strip_prefix('/').unwrap_or(pattern);

    Some(if anchored {
        format!("{negation}/{prefix}/{pattern}")
    } else {
        format!("{negation}/{prefix}/**/{pattern}")
    })
}
