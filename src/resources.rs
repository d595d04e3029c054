//! Reading order and resources
//!
//! Turns the manifest and spine of a package document into the links of a publication.

use std::collections::{HashMap, HashSet};

use log::warn;

use crate::{
    container::Container,
    error::PublicationError,
    package::PackageDocument,
    publication::{Encrypted, Link, MediaOverlay, Publication},
    types::{MEDIA_TYPE_OCTET_STREAM, ManifestItem},
    utils::guess_media_type,
};

/// Manifest properties copied into `Link::properties.contains`
const CONTAINED_PROPERTIES: [&str; 5] = ["mathml", "remote-resources", "scripted", "svg", "switch"];

/// Data an enrichment hook wants merged into a link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkEnrichment {
    pub media_overlay: Option<MediaOverlay>,

    /// Playback duration of the link in seconds
    pub duration: Option<f64>,
}

/// What an enrichment hook gets to look at
pub struct EnrichmentContext<'a> {
    pub publication: &'a Publication,
    pub package: &'a PackageDocument,
    pub container: &'a dyn Container,
}

/// Per-link hook invoked before a link is appended to the publication
///
/// A failing hook never fails the assembly: the error is logged and the link is kept
/// without enrichment.
pub trait LinkEnricher {
    fn enrich(
        &self,
        context: &EnrichmentContext<'_>,
        link: &Link,
        item: &ManifestItem,
    ) -> Result<Option<LinkEnrichment>, PublicationError>;
}

/// Hook that never enriches
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnrichment;

impl LinkEnricher for NoEnrichment {
    fn enrich(
        &self,
        _context: &EnrichmentContext<'_>,
        _link: &Link,
        _item: &ManifestItem,
    ) -> Result<Option<LinkEnrichment>, PublicationError> {
        Ok(None)
    }
}

/// Builds the reading order and resource list of a package document
///
/// Linear spine items become the reading order, in spine order. Every other manifest item,
/// non-linear spine items included, becomes a resource, in manifest order.
pub struct SpineAndResourceResolver<'a> {
    enricher: &'a dyn LinkEnricher,
    encryption: HashMap<String, Encrypted>,
}

impl<'a> SpineAndResourceResolver<'a> {
    pub fn new(enricher: &'a dyn LinkEnricher) -> Self {
        Self {
            enricher,
            encryption: HashMap::new(),
        }
    }

    /// Encryption properties keyed by container path, copied onto matching links
    pub fn with_encryption(mut self, encryption: HashMap<String, Encrypted>) -> Self {
        self.encryption = encryption;
        self
    }

    /// Returns `(reading_order, resources)`
    ///
    /// A package without manifest yields two empty lists. Spine references to unknown
    /// manifest ids are logged and skipped.
    pub fn resolve(
        &self,
        publication: &Publication,
        package: &PackageDocument,
        container: &dyn Container,
    ) -> (Vec<Link>, Vec<Link>) {
        let context = EnrichmentContext {
            publication,
            package,
            container,
        };

        let mut in_reading_order = HashSet::new();
        let mut reading_order = Vec::new();
        for spine_item in package.spine.items.iter().filter(|item| item.linear) {
            match package.manifest_item(&spine_item.idref) {
                Some(item) => {
                    in_reading_order.insert(item.id.as_str());
                    reading_order.push(self.build_enriched_link(&context, item));
                }
                None => warn!(
                    "The spine references \"{}\" which is not in the manifest",
                    spine_item.idref
                ),
            }
        }

        let resources = package
            .manifest
            .iter()
            .filter(|item| !in_reading_order.contains(item.id.as_str()))
            .map(|item| self.build_enriched_link(&context, item))
            .collect();

        (reading_order, resources)
    }

    fn build_enriched_link(&self, context: &EnrichmentContext<'_>, item: &ManifestItem) -> Link {
        let mut link = self.build_link(context.package, item);
        self.follow_fallbacks(context.package, item, &mut link);

        match self.enricher.enrich(context, &link, item) {
            Ok(Some(enrichment)) => link.merge(enrichment),
            Ok(None) => {}
            Err(err) => warn!("Failed to enrich \"{}\": {}", link.href, err),
        }

        link
    }

    /// Builds the link of a manifest item, without its fallback chain
    pub fn build_link(&self, package: &PackageDocument, item: &ManifestItem) -> Link {
        let media_type = item
            .media_type
            .clone()
            .or_else(|| guess_media_type(&item.href).map(str::to_string))
            .unwrap_or_else(|| MEDIA_TYPE_OCTET_STREAM.to_string());

        let mut link = Link::new(item.href.clone(), media_type);

        if item.has_property("cover-image") || is_legacy_cover(package, item) {
            link.rel.push("cover".to_string());
        }
        if item.has_property("nav") {
            link.rel.push("contents".to_string());
        }
        link.properties.contains = CONTAINED_PROPERTIES
            .iter()
            .filter(|property| item.has_property(property))
            .map(|property| property.to_string())
            .collect();
        link.properties.encrypted = self.encryption.get(&item.href).cloned();

        link
    }

    /// Appends the fallback chain of `item` to `link.alternate`, nearest fallback first
    fn follow_fallbacks(&self, package: &PackageDocument, item: &ManifestItem, link: &mut Link) {
        let mut visited = HashSet::from([item.id.as_str()]);
        let mut next = item.fallback.as_deref();

        while let Some(id) = next {
            if !visited.insert(id) {
                warn!("Fallback cycle through \"{}\" from \"{}\"", id, item.id);
                break;
            }

            match package.manifest_item(id) {
                Some(fallback) => {
                    link.alternate.push(self.build_link(package, fallback));
                    next = fallback.fallback.as_deref();
                }
                None => {
                    warn!(
                        "{}",
                        PublicationError::UnresolvedReference {
                            reference: id.to_string()
                        }
                    );
                    link.unresolved_fallback = Some(id.to_string());
                    break;
                }
            }
        }
    }
}

/// EPUB 2 declares its cover image through `<meta name="cover" content="item-id"/>`
fn is_legacy_cover(package: &PackageDocument, item: &ManifestItem) -> bool {
    package
        .meta
        .iter()
        .any(|meta| meta.property == "cover" && meta.value == item.id)
}
