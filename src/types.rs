//! Descriptor-level records
//!
//! The structures in this module mirror what is written in the descriptor documents
//! (package document, encryption file) before any resolution has happened. They are the
//! input of the resolvers that build the [`Publication`](crate::publication::Publication)
//! model and are not exposed through it.

/// Generic binary type used when neither the descriptor nor the file name says more
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Canonical media type of the legacy navigation-control document (NCX)
pub const MEDIA_TYPE_NCX: &str = "application/x-dtbncx+xml";

/// Generic XML type some talking books declare their NCX with
pub const MEDIA_TYPE_GENERIC_XML: &str = "text/xml";

/// Media type of synchronization documents
pub const MEDIA_TYPE_SMIL: &str = "application/smil+xml";

pub const MEDIA_TYPE_PACKAGE: &str = "application/oebps-package+xml";

/// Version family of a package document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageVersion {
    /// EPUB 2.x and the OEB 1.x packages of DAISY 3 books
    Version2,

    /// EPUB 3.x
    Version3,
}

/// Represents a metadata item in the package document
///
/// The `MetadataItem` structure represents a single piece of metadata from the package.
/// Metadata items contain information about the publication such as title, author,
/// identifier, language, and other descriptive information.
///
/// Dublin Core items keep their lower-cased local name as `property` (`title`, `creator`),
/// `meta` items keep their `property` (EPUB 3) or `name` (EPUB 2, DAISY) attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataItem {
    /// Optional unique identifier for this metadata item
    ///
    /// Used to reference this metadata item from refinements.
    pub id: Option<String>,

    /// The metadata property name
    pub property: String,

    /// The metadata value, whitespace normalized
    pub value: String,

    /// Optional language code for this metadata item
    pub lang: Option<String>,

    /// Refinements of this metadata item
    ///
    /// In EPUB 3.x, metadata items can have associated refinements that provide additional
    /// information about the main metadata item. For example, a creator metadata item might
    /// have refinements specifying the creator's role or file-as.
    ///
    /// In EPUB 2.x and DAISY packages, the attributes of the element (`opf:role`,
    /// `opf:file-as`, `opf:event`, ...) are parsed as refinements, with the namespace prefix
    /// removed from the property.
    pub refined: Vec<MetadataRefinement>,
}

impl MetadataItem {
    /// Returns the first refinement with the given property
    ///
    /// A prefixed refinement property (`media:duration`) also matches its local name.
    pub fn refinement(&self, property: &str) -> Option<&MetadataRefinement> {
        self.refined.iter().find(|refinement| {
            refinement.property == property
                || refinement
                    .property
                    .rsplit_once(':')
                    .is_some_and(|(_, local)| local == property)
        })
    }

    /// Returns every refinement with the given property, in document order
    pub fn refinements<'a>(
        &'a self,
        property: &'a str,
    ) -> impl Iterator<Item = &'a MetadataRefinement> {
        self.refined
            .iter()
            .filter(move |refinement| refinement.property == property)
    }
}

/// Represents a refinement of a metadata item
///
/// For example, a creator metadata item might have refinements specifying the creator's
/// role or the scheme used for an identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRefinement {
    /// The refinement property name
    ///
    /// Common refinement properties include "role", "file-as", "alternate-script", etc.
    pub property: String,

    /// The refinement value
    pub value: String,

    /// Optional language code for this refinement
    pub lang: Option<String>,

    /// Optional scheme identifier for this refinement
    ///
    /// Specifies the vocabulary or scheme used for the refinement value. For example,
    /// "marc:relators" for MARC relator codes.
    pub scheme: Option<String>,
}

/// Represents a resource item declared in the manifest
///
/// Every resource that is part of the publication is declared in the manifest. Manifest
/// items support the fallback mechanism, allowing alternative versions of a resource to be
/// specified for reading systems that cannot render the primary one.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestItem {
    /// The identifier of the item, referenced by the spine and by fallbacks
    pub id: String,

    /// The path of the resource relative to the container root
    ///
    /// Resolved against the directory of the package document and percent-decoded.
    pub href: String,

    /// The media type declared by the descriptor, if any
    pub media_type: Option<String>,

    /// Optional space-separated properties (`nav`, `cover-image`, ...)
    pub properties: Option<String>,

    /// Optional fallback resource identifier
    ///
    /// The value is the ID of another manifest item which should exist in the manifest.
    pub fallback: Option<String>,

    /// Optional identifier of the synchronization document of this item
    pub media_overlay: Option<String>,
}

impl ManifestItem {
    /// Whether `property` is one of the space-separated properties of the item
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|properties| properties.split_whitespace().any(|p| p == property))
    }
}

/// Represents an item in the spine, the reading order of the publication
#[derive(Debug, Clone, PartialEq)]
pub struct SpineItem {
    /// The ID of the manifest item that this spine item references
    pub idref: String,

    /// Optional identifier for this spine item
    pub id: Option<String>,

    /// Optional properties associated with this spine item
    pub properties: Option<String>,

    /// Indicates whether this item is part of the linear reading order
    ///
    /// Non-linear items are supplementary content (footnotes, answers) that is reached
    /// through hyperlinks; they end up among the resources of the publication.
    pub linear: bool,
}

/// Represents a `guide/reference` entry of an EPUB 2 or DAISY package
#[derive(Debug, Clone, PartialEq)]
pub struct GuideReference {
    /// The `type` attribute (`cover`, `toc`, `text`, ...)
    pub kind: String,

    pub title: Option<String>,

    /// Path relative to the container root, fragment preserved
    pub href: String,
}

/// Represents an `EncryptedData` entry of `META-INF/encryption.xml`
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionData {
    /// The encryption algorithm URI
    ///
    /// - IDPF font obfuscation: "http://www.idpf.org/2008/embedding"
    /// - Adobe font obfuscation: "http://ns.adobe.com/pdf/enc#RC"
    /// - LCP content encryption: "http://www.w3.org/2001/04/xmlenc#aes256-cbc"
    pub algorithm: String,

    /// The percent-decoded path of the encrypted resource relative to the container root
    pub uri: String,

    /// Compression method applied before encryption (`8` for deflate, `0` for none)
    pub compression_method: Option<String>,

    /// Length of the resource before compression and encryption
    pub original_length: Option<u64>,

    /// URI of the key retrieval method, if the key is not carried by the file itself
    pub retrieval_method: Option<String>,
}
