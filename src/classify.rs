//! Format classification
//!
//! Decides which dialect a locator holds and how it is accessed. Every probe answers a
//! [`Recognition`]; probes are chained so the first recognized answer wins and failures
//! of the underlying I/O only mean "try the next strategy".

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;

use crate::{
    container::{Container, ZipContainer},
    utils::extension_of,
};

pub(crate) const CONTAINER_FILE: &str = "META-INF/container.xml";

const EPUB_EXTENSIONS: [&str; 2] = ["epub", "epub3"];
const DAISY_EXTENSIONS: [&str; 3] = ["daisy", "daisy2", "daisy3"];

/// Package documents a DAISY book may carry at its root
pub(crate) const DAISY_ANCHOR_NAMES: [&str; 3] = ["package.opf", "Book.opf", "speechgen.opf"];

#[cfg(feature = "comic")]
const COMIC_EXTENSIONS: [&str; 1] = ["cbz"];

/// Where a publication lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A file or directory on the local filesystem
    Path(PathBuf),

    /// An `http:` or `https:` address
    Url(String),
}

impl Locator {
    pub fn is_remote(&self) -> bool {
        matches!(self, Locator::Url(_))
    }

    /// Last segment of the locator, query and fragment excluded for URLs
    pub fn file_name(&self) -> String {
        match self {
            Locator::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            Locator::Url(url) => url_path(url)
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Lower-cased extension of the file name
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.file_name())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Path(path) => write!(f, "{}", path.display()),
            Locator::Url(url) => write!(f, "{url}"),
        }
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Locator::Url(value.to_string())
        } else {
            Locator::Path(PathBuf::from(value))
        }
    }
}

impl From<String> for Locator {
    fn from(value: String) -> Self {
        Locator::from(value.as_str())
    }
}

impl From<&Path> for Locator {
    fn from(value: &Path) -> Self {
        Locator::Path(value.to_path_buf())
    }
}

impl From<PathBuf> for Locator {
    fn from(value: PathBuf) -> Self {
        Locator::Path(value)
    }
}

fn url_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);
    without_query
        .find('/')
        .map(|index| &without_query[index..])
        .unwrap_or("/")
}

/// A supported container format family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Epub,
    Daisy,
    Comic,
}

impl Dialect {
    /// Name recorded in the provenance map of the publication
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Epub => "epub",
            Dialect::Daisy => "daisy",
            Dialect::Comic => "cbz",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    LocalExploded,
    LocalPacked,
    RemoteExploded,
    RemotePacked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub dialect: Dialect,
    pub mode: AccessMode,
}

/// Outcome of a classification probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recognition<T> {
    Recognized(T),
    NotRecognized,
}

impl<T> Recognition<T> {
    /// Runs `next` only when this probe did not recognize the locator
    pub fn or_else<F: FnOnce() -> Recognition<T>>(self, next: F) -> Recognition<T> {
        match self {
            Recognition::Recognized(value) => Recognition::Recognized(value),
            Recognition::NotRecognized => next(),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Recognition<U> {
        match self {
            Recognition::Recognized(value) => Recognition::Recognized(f(value)),
            Recognition::NotRecognized => Recognition::NotRecognized,
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, Recognition::Recognized(_))
    }

    pub fn recognized(self) -> Option<T> {
        match self {
            Recognition::Recognized(value) => Some(value),
            Recognition::NotRecognized => None,
        }
    }
}

impl<T> From<Option<T>> for Recognition<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Recognition::Recognized(value),
            None => Recognition::NotRecognized,
        }
    }
}

/// Existence check for remote resources, provided by the caller
pub trait RemoteProbe: Send + Sync {
    fn exists(&self, url: &str) -> bool;
}

/// Default probe: this crate performs no network I/O, so nothing exists remotely
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemoteProbe;

impl RemoteProbe for NoRemoteProbe {
    fn exists(&self, _url: &str) -> bool {
        false
    }
}

/// Decides the dialect and access mode of a locator
///
/// Dialects are tried in a fixed order (EPUB, DAISY, comic archive); inside a dialect the
/// probes run from the cheapest (extension) to the most expensive (opening the archive).
#[derive(Clone)]
pub struct FormatClassifier {
    remote_probe: Arc<dyn RemoteProbe>,
}

impl fmt::Debug for FormatClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatClassifier").finish_non_exhaustive()
    }
}

impl Default for FormatClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatClassifier {
    pub fn new() -> Self {
        Self {
            remote_probe: Arc::new(NoRemoteProbe),
        }
    }

    pub fn with_remote_probe(probe: Arc<dyn RemoteProbe>) -> Self {
        Self {
            remote_probe: probe,
        }
    }

    pub fn classify(&self, locator: &Locator) -> Recognition<Classification> {
        let recognition = self
            .classify_as(Dialect::Epub, locator)
            .or_else(|| self.classify_as(Dialect::Daisy, locator))
            .or_else(|| self.classify_as(Dialect::Comic, locator));

        debug!("Classified \"{locator}\" as {recognition:?}");
        recognition
    }

    /// Runs the probe chain of one dialect
    pub fn classify_as(&self, dialect: Dialect, locator: &Locator) -> Recognition<Classification> {
        let mode = match dialect {
            Dialect::Epub => self.classify_epub(locator),
            Dialect::Daisy => self.classify_daisy(locator),
            Dialect::Comic => self.classify_comic(locator),
        };
        mode.map(|mode| Classification { dialect, mode })
    }

    fn classify_epub(&self, locator: &Locator) -> Recognition<AccessMode> {
        let has_extension = locator
            .extension()
            .is_some_and(|extension| EPUB_EXTENSIONS.contains(&extension.as_str()));

        match locator {
            Locator::Url(url) => {
                if has_extension {
                    return Recognition::Recognized(AccessMode::RemotePacked);
                }

                let registry = format!("{}/{}", url.trim_end_matches('/'), CONTAINER_FILE);
                if self.remote_probe.exists(&registry) {
                    return Recognition::Recognized(AccessMode::RemoteExploded);
                }
                Recognition::NotRecognized
            }

            Locator::Path(path) => {
                if has_extension {
                    return Recognition::Recognized(AccessMode::LocalPacked);
                }

                if path.is_dir() {
                    if path.join(CONTAINER_FILE).is_file() {
                        return Recognition::Recognized(AccessMode::LocalExploded);
                    }
                    return Recognition::NotRecognized;
                }

                match open_archive(path) {
                    Some(archive) if archive.entry_exists(CONTAINER_FILE) => {
                        Recognition::Recognized(AccessMode::LocalPacked)
                    }
                    _ => Recognition::NotRecognized,
                }
            }
        }
    }

    fn classify_daisy(&self, locator: &Locator) -> Recognition<AccessMode> {
        let path = match locator {
            // Remote talking books are not supported, whatever the probes would say
            Locator::Url(_) => return Recognition::NotRecognized,
            Locator::Path(path) => path,
        };

        let has_extension = locator
            .extension()
            .is_some_and(|extension| DAISY_EXTENSIONS.contains(&extension.as_str()));
        if has_extension {
            return Recognition::Recognized(AccessMode::LocalPacked);
        }

        is_daisy_exploded(path).or_else(|| {
            let Some(archive) = open_archive(path) else {
                return Recognition::NotRecognized;
            };
            if archive.entry_exists(CONTAINER_FILE) {
                return Recognition::NotRecognized;
            }

            let entries = archive.entries().unwrap_or_default();
            match entries.iter().find(|entry| entry.ends_with(".opf")) {
                Some(entry) => {
                    debug!("Found the DAISY package \"{entry}\" in \"{}\"", path.display());
                    Recognition::Recognized(AccessMode::LocalPacked)
                }
                None => Recognition::NotRecognized,
            }
        })
    }

    #[cfg(feature = "comic")]
    fn classify_comic(&self, locator: &Locator) -> Recognition<AccessMode> {
        let has_extension = locator
            .extension()
            .is_some_and(|extension| COMIC_EXTENSIONS.contains(&extension.as_str()));

        match (has_extension, locator) {
            (true, Locator::Url(_)) => Recognition::Recognized(AccessMode::RemotePacked),
            (true, Locator::Path(_)) => Recognition::Recognized(AccessMode::LocalPacked),
            (false, _) => Recognition::NotRecognized,
        }
    }

    #[cfg(not(feature = "comic"))]
    fn classify_comic(&self, _locator: &Locator) -> Recognition<AccessMode> {
        Recognition::NotRecognized
    }
}

/// A directory holding one of the DAISY anchor names and no EPUB container registry
fn is_daisy_exploded(path: &Path) -> Recognition<AccessMode> {
    let has_anchor = DAISY_ANCHOR_NAMES
        .iter()
        .any(|name| path.join(name).is_file());
    if !has_anchor {
        return Recognition::NotRecognized;
    }

    // Ambiguous with an exploded EPUB: leave it to the archive inspection
    if path.join(CONTAINER_FILE).is_file() {
        return Recognition::NotRecognized;
    }

    Recognition::Recognized(AccessMode::LocalExploded)
}

fn open_archive(path: &Path) -> Option<ZipContainer<std::io::BufReader<std::fs::File>>> {
    if !path.is_file() {
        return None;
    }

    match ZipContainer::open(path) {
        Ok(archive) => Some(archive),
        Err(err) => {
            debug!("\"{}\" is not a readable archive: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        classify::{
            AccessMode, Classification, Dialect, FormatClassifier, Locator, Recognition,
            RemoteProbe,
        },
        test_support::{CONTAINER_XML, write_dir, write_zip},
    };

    struct ExplodedServer;

    impl RemoteProbe for ExplodedServer {
        fn exists(&self, url: &str) -> bool {
            url == "https://books.example.org/moby/META-INF/container.xml"
        }
    }

    fn recognized(dialect: Dialect, mode: AccessMode) -> Recognition<Classification> {
        Recognition::Recognized(Classification { dialect, mode })
    }

    #[test]
    fn test_locator_parsing() {
        let url = Locator::from("https://books.example.org/shelf/Moby.EPUB?token=1");
        assert!(url.is_remote());
        assert_eq!(url.file_name(), "Moby.EPUB");
        assert_eq!(url.extension().as_deref(), Some("epub"));

        let path = Locator::from("/tmp/books/alice.daisy3");
        assert!(!path.is_remote());
        assert_eq!(path.file_name(), "alice.daisy3");
    }

    #[test]
    fn test_classify_remote_epub() {
        let classifier = FormatClassifier::with_remote_probe(Arc::new(ExplodedServer));

        assert_eq!(
            classifier.classify(&Locator::from("https://books.example.org/moby.epub")),
            recognized(Dialect::Epub, AccessMode::RemotePacked)
        );
        assert_eq!(
            classifier.classify(&Locator::from("https://books.example.org/moby/")),
            recognized(Dialect::Epub, AccessMode::RemoteExploded)
        );
        assert_eq!(
            classifier.classify(&Locator::from("https://books.example.org/other")),
            Recognition::NotRecognized
        );
    }

    #[test]
    fn test_classify_remote_daisy_is_not_recognized() {
        let classifier = FormatClassifier::new();
        assert_eq!(
            classifier.classify(&Locator::from("https://books.example.org/alice.daisy")),
            Recognition::NotRecognized
        );
    }

    #[test]
    fn test_classify_by_extension_without_opening() {
        let classifier = FormatClassifier::new();

        assert_eq!(
            classifier.classify(&Locator::from("/nonexistent/book.EPUB")),
            recognized(Dialect::Epub, AccessMode::LocalPacked)
        );
        assert_eq!(
            classifier.classify(&Locator::from("/nonexistent/book.Daisy3")),
            recognized(Dialect::Daisy, AccessMode::LocalPacked)
        );
        assert_eq!(
            classifier.classify(&Locator::from("/nonexistent/book.daisy")),
            recognized(Dialect::Daisy, AccessMode::LocalPacked)
        );
    }

    #[test]
    fn test_classify_local_epub_probes() {
        let dir = tempfile::tempdir().unwrap();
        let exploded = dir.path().join("exploded");
        write_dir(&exploded, &[("META-INF/container.xml", CONTAINER_XML)]);
        let packed = write_zip(
            dir.path(),
            "book.zip",
            &[("mimetype", b"application/epub+zip"), ("META-INF/container.xml", CONTAINER_XML)],
        );

        let classifier = FormatClassifier::new();
        assert_eq!(
            classifier.classify(&Locator::from(exploded.as_path())),
            recognized(Dialect::Epub, AccessMode::LocalExploded)
        );
        assert_eq!(
            classifier.classify(&Locator::from(packed)),
            recognized(Dialect::Epub, AccessMode::LocalPacked)
        );
    }

    #[test]
    fn test_classify_local_daisy_probes() {
        let dir = tempfile::tempdir().unwrap();
        let exploded = dir.path().join("talking-book");
        write_dir(&exploded, &[("Book.opf", b"<package/>")]);
        let packed = write_zip(
            dir.path(),
            "book.zip",
            &[("book/dtbook.xml", b"<dtbook/>"), ("book/speechgen.opf", b"<package/>")],
        );

        let classifier = FormatClassifier::new();
        assert_eq!(
            classifier.classify(&Locator::from(exploded.as_path())),
            recognized(Dialect::Daisy, AccessMode::LocalExploded)
        );
        assert_eq!(
            classifier.classify(&Locator::from(packed)),
            recognized(Dialect::Daisy, AccessMode::LocalPacked)
        );
    }

    #[test]
    fn test_ambiguous_exploded_directory_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        write_dir(
            dir.path(),
            &[("package.opf", b"<package/>"), ("META-INF/container.xml", CONTAINER_XML)],
        );

        let classifier = FormatClassifier::new();
        let locator = Locator::from(dir.path());
        assert_eq!(
            classifier.classify_as(Dialect::Daisy, &locator),
            Recognition::NotRecognized
        );
        assert_eq!(
            classifier.classify(&locator),
            recognized(Dialect::Epub, AccessMode::LocalExploded)
        );
    }

    #[test]
    fn test_classify_unrecognized() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(dir.path(), "notes.zip", &[("notes.txt", b"nothing here")]);
        let text = dir.path().join("plain.txt");
        std::fs::write(&text, "not an archive").unwrap();

        let classifier = FormatClassifier::new();
        assert_eq!(classifier.classify(&Locator::from(archive)), Recognition::NotRecognized);
        assert_eq!(classifier.classify(&Locator::from(text)), Recognition::NotRecognized);
        assert_eq!(
            classifier.classify(&Locator::from(dir.path().join("empty-dir").as_path())),
            Recognition::NotRecognized
        );
    }

    #[cfg(feature = "comic")]
    #[test]
    fn test_classify_comic_archive() {
        let classifier = FormatClassifier::new();
        assert_eq!(
            classifier.classify(&Locator::from("/comics/issue-01.CBZ")),
            recognized(Dialect::Comic, AccessMode::LocalPacked)
        );
        assert_eq!(
            classifier.classify(&Locator::from("https://comics.example.org/issue-01.cbz")),
            recognized(Dialect::Comic, AccessMode::RemotePacked)
        );
    }
}
