//! EPUB assembler
//!
//! Folds an OCF container (packed or exploded) into a [`Publication`]:
//!
//! 1. the package document is located through `META-INF/container.xml`, falling back to
//!    the first `.opf` entry of the container
//! 2. the Dublin Core metadata and `meta` properties are folded into the metadata
//! 3. `META-INF/encryption.xml` and `META-INF/license.lcpl` describe protected resources
//! 4. the spine and manifest become the reading order and resource list
//! 5. the navigation document (or the NCX) becomes the table of contents and page list

use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};

use crate::{
    classify::Dialect,
    container::Container,
    error::PublicationError,
    lcp::{LCP_RETRIEVAL_METHOD, LCP_SCHEME, LICENSE_FILE, LcpLicense},
    media_overlay::EpubOverlayEnricher,
    navigation::{NavigationResolver, mark_unresolved, toc_from_reading_order},
    package::{
        DescriptorResolver, PackageDocument, add_contributors, add_description, add_identifier,
        add_language, add_other_metadata, add_publication_date, add_subjects, add_title,
        set_direction,
    },
    parser::{ParseOptions, start_publication},
    publication::{Encrypted, INTERNAL_PACKAGE_PATH, Publication},
    resources::SpineAndResourceResolver,
    types::EncryptionData,
    utils::{FromXml, Namespaces, XmlElement, resolve_href},
};

/// Path of the encryption document
pub const ENCRYPTION_FILE: &str = "META-INF/encryption.xml";

const XMLENC_NAMESPACE: &str = "http://www.w3.org/2001/04/xmlenc#";
const XMLDSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";
const COMPRESSION_NAMESPACE: &str = "http://www.idpf.org/2016/encryption#compression";

/// Profiles of the LCP content keys the decryption engines are known to handle
const LCP_PROFILES: [&str; 2] = [
    "http://readium.org/lcp/basic-profile",
    "http://readium.org/lcp/profile-1.0",
];

/// The `EncryptedData` entries of `META-INF/encryption.xml`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncryptionDocument {
    pub items: Vec<EncryptionData>,
}

impl FromXml for EncryptionDocument {
    const NAMESPACES: Namespaces = &[
        ("enc", XMLENC_NAMESPACE),
        ("ds", XMLDSIG_NAMESPACE),
        ("comp", COMPRESSION_NAMESPACE),
    ];

    fn from_element(root: &XmlElement) -> Result<Self, PublicationError> {
        if root.name != "encryption" {
            return Err(PublicationError::NonCanonicalFile {
                tag: "encryption".to_string(),
            });
        }

        let mut items = Vec::new();
        for data in root.select("enc:EncryptedData", Self::NAMESPACES) {
            let algorithm = data
                .select_value("enc:EncryptionMethod/@Algorithm", Self::NAMESPACES)
                .ok_or_else(|| PublicationError::MissingRequiredAttribute {
                    tag: "EncryptionMethod".to_string(),
                    attribute: "Algorithm".to_string(),
                })?;
            let uri = data
                .select_value("enc:CipherData/enc:CipherReference/@URI", Self::NAMESPACES)
                .ok_or_else(|| PublicationError::MissingRequiredAttribute {
                    tag: "CipherReference".to_string(),
                    attribute: "URI".to_string(),
                })?;

            // Cipher references are relative to the container root
            let uri = match resolve_href("", &uri) {
                Ok(uri) => uri,
                Err(err) => {
                    warn!("Skipping the encryption entry of \"{}\": {}", uri, err);
                    continue;
                }
            };

            let compression = data.select_first(
                "enc:EncryptionProperties/enc:EncryptionProperty/comp:Compression",
                Self::NAMESPACES,
            );

            items.push(EncryptionData {
                algorithm,
                uri,
                compression_method: compression.and_then(|element| element.get_attr("Method")),
                original_length: compression
                    .and_then(|element| element.get_attr("OriginalLength"))
                    .and_then(|length| length.trim().parse().ok()),
                retrieval_method: data
                    .select_value("ds:KeyInfo/ds:RetrievalMethod/@URI", Self::NAMESPACES),
            });
        }

        Ok(Self { items })
    }
}

impl EncryptionData {
    /// Encryption properties copied onto the link of the resource
    pub fn to_encrypted(&self) -> Encrypted {
        let compression = self
            .compression_method
            .as_deref()
            .map(|method| match method.trim() {
                "8" => "deflate".to_string(),
                "0" => "none".to_string(),
                other => {
                    warn!("Unknown compression method \"{}\" of \"{}\"", other, self.uri);
                    other.to_string()
                }
            });

        let scheme = self
            .retrieval_method
            .as_deref()
            .is_some_and(|method| method.ends_with(LCP_RETRIEVAL_METHOD))
            .then(|| LCP_SCHEME.to_string());

        Encrypted {
            algorithm: self.algorithm.clone(),
            compression,
            original_length: self.original_length,
            profile: None,
            scheme,
        }
    }
}

/// Reads `META-INF/encryption.xml`, keyed by the path of each protected resource
///
/// A container without encryption document yields an empty map.
pub fn parse_encryption(
    container: &dyn Container,
) -> Result<HashMap<String, Encrypted>, PublicationError> {
    if !container.entry_exists(ENCRYPTION_FILE) {
        return Ok(HashMap::new());
    }

    let document = EncryptionDocument::from_bytes(container.read_bytes(ENCRYPTION_FILE)?)?;
    Ok(document
        .items
        .iter()
        .map(|item| (item.uri.clone(), item.to_encrypted()))
        .collect())
}

/// Reads `META-INF/license.lcpl`, if present
pub fn parse_license(container: &dyn Container) -> Result<Option<LcpLicense>, PublicationError> {
    if !container.entry_exists(LICENSE_FILE) {
        return Ok(None);
    }

    let license = LcpLicense::from_bytes(&container.read_bytes(LICENSE_FILE)?)?;
    if !LCP_PROFILES.contains(&license.encryption.profile.as_str()) {
        warn!(
            "The license \"{}\" uses the unsupported profile \"{}\"",
            license.id, license.encryption.profile
        );
    }
    Ok(Some(license))
}

/// Assembles EPUB publications
#[derive(Debug, Clone, Copy, Default)]
pub struct EpubAssembler {
    options: ParseOptions,
}

impl EpubAssembler {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Builds the publication held by `container`
    ///
    /// ## Return
    /// - `Err(PublicationError::EmptyContainer)`: the container has no entry
    /// - `Err(PublicationError::MissingAnchor)`: no package document was found
    /// - `Err(PublicationError::EmptyReadingOrder)`: the spine has no readable item
    pub fn assemble(
        &self,
        container: Arc<dyn Container>,
        file_name: &str,
    ) -> Result<Publication, PublicationError> {
        let mut publication = start_publication(Dialect::Epub, &container, file_name)?;

        let package_path = DescriptorResolver::epub().resolve(container.as_ref())?;
        let package = PackageDocument::load(container.as_ref(), &package_path)?;
        debug!(
            "Read the package \"{}\" ({:?})",
            package_path,
            package.package_version()
        );
        publication.add_internal_text(INTERNAL_PACKAGE_PATH, package_path);

        add_language(&mut publication, &package);
        add_title(&mut publication, &package);
        add_identifier(&mut publication, &package);
        add_other_metadata(&mut publication, &package);
        set_direction(&mut publication, &package);
        add_contributors(&mut publication, &package);
        add_subjects(&mut publication, &package);
        add_description(&mut publication, &package);
        add_publication_date(&mut publication, &package);

        publication.lcp = parse_license(container.as_ref())?;
        let mut encryption = parse_encryption(container.as_ref())?;
        if let Some(license) = &publication.lcp {
            for encrypted in encryption.values_mut() {
                if encrypted.scheme.as_deref() == Some(LCP_SCHEME) {
                    encrypted.profile = Some(license.encryption.profile.clone());
                }
            }
        }

        let enricher = EpubOverlayEnricher {
            eager: self.options.eager_media_overlays,
        };
        let (reading_order, resources) = SpineAndResourceResolver::new(&enricher)
            .with_encryption(encryption)
            .resolve(&publication, &package, container.as_ref());
        if reading_order.is_empty() {
            return Err(PublicationError::EmptyReadingOrder);
        }
        publication.reading_order = reading_order;
        publication.resources = resources;

        let navigation = NavigationResolver::epub()
            .resolve(&package, container.as_ref())
            .unwrap_or_else(|err| {
                warn!("Ignoring the navigation of \"{}\": {}", file_name, err);
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

        Ok(publication)
    }
}
