//! DAISY assembler
//!
//! Talking books carry an OEB-style package document (`package.opf`, `Book.opf`,
//! `speechgen.opf` or any `.opf` entry), an NCX for navigation and one SMIL document per
//! spine item. When the `dtb:multimediaType` marker says so, the synchronization documents
//! are loaded during assembly and their durations land on the reading-order links.

use std::sync::Arc;

use log::{debug, warn};

use crate::{
    classify::Dialect,
    container::Container,
    error::PublicationError,
    media_overlay::DaisyOverlayEnricher,
    navigation::{NavigationResolver, mark_unresolved, toc_from_reading_order},
    package::{
        DescriptorResolver, PackageDocument, add_contributors, add_description, add_identifier,
        add_language, add_other_metadata, add_publication_date, add_subjects, add_title,
        set_direction,
    },
    parser::{ParseOptions, start_publication},
    publication::{INTERNAL_PACKAGE_PATH, Publication},
    resources::SpineAndResourceResolver,
};

/// Assembles DAISY talking books
#[derive(Debug, Clone, Copy, Default)]
pub struct DaisyAssembler {
    options: ParseOptions,
}

impl DaisyAssembler {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Builds the publication held by `container`
    ///
    /// The multimedia marker is folded before the spine so the overlay hook can see it.
    pub fn assemble(
        &self,
        container: Arc<dyn Container>,
        file_name: &str,
    ) -> Result<Publication, PublicationError> {
        let mut publication = start_publication(Dialect::Daisy, &container, file_name)?;

        let package_path = DescriptorResolver::daisy().resolve(container.as_ref())?;
        let package = PackageDocument::load(container.as_ref(), &package_path)?;
        debug!("Read the talking book package \"{}\"", package_path);
        publication.add_internal_text(INTERNAL_PACKAGE_PATH, package_path);

        add_language(&mut publication, &package);
        add_title(&mut publication, &package);
        add_identifier(&mut publication, &package);
        add_other_metadata(&mut publication, &package);
        set_direction(&mut publication, &package);
        add_contributors(&mut publication, &package);

        let (reading_order, resources) = SpineAndResourceResolver::new(&DaisyOverlayEnricher)
            .resolve(&publication, &package, container.as_ref());
        if reading_order.is_empty() {
            return Err(PublicationError::EmptyReadingOrder);
        }
        publication.reading_order = reading_order;
        publication.resources = resources;

        let navigation = NavigationResolver::daisy()
            .resolve(&package, container.as_ref())
            .unwrap_or_else(|err| {
                warn!("Ignoring the NCX of \"{}\": {}", file_name, err);
                Default::default()
            });

        let mut toc = navigation.toc;
        if toc.is_empty() && self.options.toc_fallback_to_reading_order {
            toc = toc_from_reading_order(&publication);
        }
        let mut page_list = navigation.page_list;
        mark_unresolved(&mut toc, &publication);
        mark_unresolved(&mut page_list, &publication);
        publication.toc = toc;
        publication.page_list = page_list;

        add_subjects(&mut publication, &package);
        add_description(&mut publication, &package);
        add_publication_date(&mut publication, &package);

        Ok(publication)
    }
}
