//! Entry points
//!
//! [`PublicationParser`] classifies a locator, opens the matching container and hands it to
//! the assembler of the detected dialect. Remote locators are classified but never opened
//! here: a caller that can reach them passes its own [`Container`] to
//! [`PublicationParser::parse_container`].

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};

use crate::{
    classify::{
        AccessMode, Classification, Dialect, FormatClassifier, Locator, Recognition, RemoteProbe,
    },
    container::{Container, DirectoryContainer, ZipContainer},
    daisy::DaisyAssembler,
    epub::EpubAssembler,
    error::PublicationError,
    publication::{
        INTERNAL_CONTAINER, INTERNAL_FILENAME, INTERNAL_TYPE, InternalValue, Publication,
    },
};

/// Runtime switches of the assemblers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Substitute a flat table of contents built from the reading order when the
    /// navigation sources yield nothing
    pub toc_fallback_to_reading_order: bool,

    /// Load EPUB media overlays during assembly instead of on demand
    pub eager_media_overlays: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            toc_fallback_to_reading_order: true,
            eager_media_overlays: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublicationParser {
    classifier: FormatClassifier,
    options: ParseOptions,
}

impl PublicationParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `probe` to detect exploded publications behind remote locators
    pub fn with_remote_probe(mut self, probe: Arc<dyn RemoteProbe>) -> Self {
        self.classifier = FormatClassifier::with_remote_probe(probe);
        self
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    pub fn classify(&self, locator: impl Into<Locator>) -> Recognition<Classification> {
        self.classifier.classify(&locator.into())
    }

    /// Classifies, opens and assembles the publication at `locator`
    ///
    /// ## Return
    /// - `Err(PublicationError::UnrecognizedFormat)`: no dialect recognized the locator
    /// - `Err(PublicationError::UnsupportedLocator)`: the locator is remote
    /// - any assembly error of the detected dialect
    pub fn parse(&self, locator: impl Into<Locator>) -> Result<Publication, PublicationError> {
        let locator = locator.into();
        let Recognition::Recognized(classification) = self.classifier.classify(&locator) else {
            return Err(PublicationError::UnrecognizedFormat {
                locator: locator.to_string(),
            });
        };

        let container: Arc<dyn Container> = match (&locator, classification.mode) {
            (Locator::Path(path), AccessMode::LocalPacked) => Arc::new(ZipContainer::open(path)?),
            (Locator::Path(path), AccessMode::LocalExploded) => {
                Arc::new(DirectoryContainer::new(path))
            }
            _ => {
                return Err(PublicationError::UnsupportedLocator {
                    locator: locator.to_string(),
                });
            }
        };

        info!(
            "Parsing \"{}\" as {} ({:?})",
            locator,
            classification.dialect.as_str(),
            classification.mode
        );
        self.parse_container(classification.dialect, container, &locator.file_name())
    }

    /// Assembles a publication of `dialect` out of an already opened container
    pub fn parse_container(
        &self,
        dialect: Dialect,
        container: Arc<dyn Container>,
        file_name: &str,
    ) -> Result<Publication, PublicationError> {
        match dialect {
            Dialect::Epub => EpubAssembler::new(self.options).assemble(container, file_name),
            Dialect::Daisy => DaisyAssembler::new(self.options).assemble(container, file_name),

            #[cfg(feature = "comic")]
            Dialect::Comic => {
                crate::comic::ComicAssembler::new(self.options).assemble(container, file_name)
            }

            #[cfg(not(feature = "comic"))]
            Dialect::Comic => Err(PublicationError::UnrecognizedFormat {
                locator: file_name.to_string(),
            }),
        }
    }
}

/// Parses the publication at `locator` with the default options
pub fn parse(locator: impl Into<Locator>) -> Result<Publication, PublicationError> {
    PublicationParser::new().parse(locator)
}

/// Creates the publication every assembler starts from
///
/// Rejects a container without entries, then records the provenance of the publication
/// and stamps its modification date.
pub(crate) fn start_publication(
    dialect: Dialect,
    container: &Arc<dyn Container>,
    file_name: &str,
) -> Result<Publication, PublicationError> {
    if !container.has_entries() {
        return Err(PublicationError::EmptyContainer {
            locator: file_name.to_string(),
        });
    }

    let mut publication = Publication::new();
    publication.metadata.modified = Some(Utc::now());
    publication.add_internal_text(INTERNAL_FILENAME, file_name);
    publication.add_internal_text(INTERNAL_TYPE, dialect.as_str());
    publication.internal.insert(
        INTERNAL_CONTAINER.to_string(),
        InternalValue::Container(Arc::clone(container)),
    );

    debug!("Assembling \"{}\" as {}", file_name, dialect.as_str());
    Ok(publication)
}
