//! Package document
//!
//! Locating the anchor descriptor of a container, mapping it into a [`PackageDocument`],
//! and folding its metadata into the [`Publication`] model. EPUB and DAISY packages share
//! this module; DAISY Dublin Core elements are capitalized (`dc:Title`) and nested in
//! `dc-metadata`/`x-metadata` blocks, so metadata elements are matched by lower-cased local
//! name anywhere below `metadata`.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::{
    classify::{CONTAINER_FILE, DAISY_ANCHOR_NAMES, Recognition},
    container::Container,
    error::PublicationError,
    media_overlay::parse_clock_value,
    publication::{
        AdditionalValue, Contributor, Direction, INTERNAL_UNIQUE_IDENTIFIER, LocalizedString,
        Publication, Subject,
    },
    types::{
        GuideReference, MEDIA_TYPE_PACKAGE, ManifestItem, MetadataItem, MetadataRefinement,
        PackageVersion, SpineItem,
    },
    utils::{
        DC_NAMESPACE, FromXml, Namespaces, NormalizeWhitespace, OPF_NAMESPACE, XmlElement,
        XmlReader, parse_date, resolve_href,
    },
};

/// Suffix of package documents
pub const PACKAGE_SUFFIX: &str = ".opf";

const OPF2_NAMESPACE: &str = "http://openebook.org/namespaces/oeb-package/1.0/";
const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Languages written right to left when the package does not say otherwise
const RTL_LANGUAGES: [&str; 3] = ["ar", "fa", "he"];

/// One way of locating the anchor descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorStrategy {
    /// Well-known names at the container root, tried in order
    FixedPaths(&'static [&'static str]),

    /// `rootfile@full-path` of `META-INF/container.xml`
    ContainerRegistry,

    /// First entry, in enumeration order, ending with the suffix
    SuffixScan(&'static str),
}

impl AnchorStrategy {
    fn locate(&self, container: &dyn Container) -> Recognition<String> {
        match self {
            AnchorStrategy::FixedPaths(names) => names
                .iter()
                .find(|name| container.entry_exists(name))
                .map(|name| name.to_string())
                .into(),

            AnchorStrategy::ContainerRegistry => {
                if !container.entry_exists(CONTAINER_FILE) {
                    return Recognition::NotRecognized;
                }

                let rootfile = container
                    .read_bytes(CONTAINER_FILE)
                    .and_then(parse_container_registry);
                match rootfile {
                    Ok(path) if container.entry_exists(&path) => Recognition::Recognized(path),
                    Ok(path) => {
                        debug!("The registered package \"{path}\" is not in the container");
                        Recognition::NotRecognized
                    }
                    Err(err) => {
                        debug!("Unreadable container registry: {err}");
                        Recognition::NotRecognized
                    }
                }
            }

            AnchorStrategy::SuffixScan(suffix) => {
                find_anchor_descriptor(container, suffix).ok().into()
            }
        }
    }
}

/// Finds the anchor descriptor of a container with an ordered list of strategies
#[derive(Debug, Clone)]
pub struct DescriptorResolver {
    strategies: Vec<AnchorStrategy>,
}

impl DescriptorResolver {
    pub fn new(strategies: Vec<AnchorStrategy>) -> Self {
        Self { strategies }
    }

    /// Container registry, then suffix scan
    pub fn epub() -> Self {
        Self::new(vec![
            AnchorStrategy::ContainerRegistry,
            AnchorStrategy::SuffixScan(PACKAGE_SUFFIX),
        ])
    }

    /// Fixed DAISY names, then container registry, then suffix scan
    pub fn daisy() -> Self {
        Self::new(vec![
            AnchorStrategy::FixedPaths(&DAISY_ANCHOR_NAMES),
            AnchorStrategy::ContainerRegistry,
            AnchorStrategy::SuffixScan(PACKAGE_SUFFIX),
        ])
    }

    /// Returns the path of the anchor descriptor
    ///
    /// ## Return
    /// - `Err(PublicationError::MissingAnchor)`: no strategy located a descriptor
    pub fn resolve(&self, container: &dyn Container) -> Result<String, PublicationError> {
        for strategy in &self.strategies {
            if let Recognition::Recognized(path) = strategy.locate(container) {
                debug!("Located the package document \"{path}\" with {strategy:?}");
                return Ok(path);
            }
        }

        Err(PublicationError::MissingAnchor {
            expected: PACKAGE_SUFFIX.to_string(),
        })
    }
}

/// Returns the first entry of `container` whose name ends with `suffix`
///
/// Multiple candidates are not disambiguated: the first in enumeration order wins, even
/// when a later one sits at the container root.
pub fn find_anchor_descriptor(
    container: &dyn Container,
    suffix: &str,
) -> Result<String, PublicationError> {
    container
        .entries()?
        .into_iter()
        .find(|entry| entry.ends_with(suffix))
        .ok_or_else(|| PublicationError::MissingAnchor {
            expected: suffix.to_string(),
        })
}

/// Parses `META-INF/container.xml` and returns the path of the package document
///
/// When multiple `rootfile` elements exist, the first one declaring the package media
/// type is used, else the first one.
pub fn parse_container_registry(bytes: Vec<u8>) -> Result<String, PublicationError> {
    let root = XmlReader::parse_bytes(bytes)?;
    let rootfiles = root.find_elements_by_name("rootfile").collect::<Vec<_>>();

    let rootfile = rootfiles
        .iter()
        .find(|rootfile| rootfile.get_attr("media-type").as_deref() == Some(MEDIA_TYPE_PACKAGE))
        .or_else(|| rootfiles.first())
        .ok_or_else(|| PublicationError::NonCanonicalFile {
            tag: "rootfile".to_string(),
        })?;

    let path = rootfile
        .get_attr("full-path")
        .ok_or_else(|| PublicationError::MissingRequiredAttribute {
            tag: "rootfile".to_string(),
            attribute: "full-path".to_string(),
        })?;

    resolve_href("", &path)
}

/// The `spine` element
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spine {
    /// Manifest id of the NCX
    pub toc: Option<String>,

    pub page_progression_direction: Option<String>,

    pub items: Vec<SpineItem>,
}

/// A parsed package document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageDocument {
    /// Dublin Core elements, lower-cased local name as property
    pub dublin_core: Vec<MetadataItem>,

    /// `meta` elements that do not refine another element
    pub meta: Vec<MetadataItem>,

    /// Refinements whose target is not a metadata element, keyed by the refined id
    ///
    /// EPUB 3 refines manifest items this way (`media:duration` of a synchronization
    /// document).
    pub item_refinements: HashMap<String, Vec<MetadataRefinement>>,

    /// Manifest items in document order
    pub manifest: Vec<ManifestItem>,

    pub spine: Spine,

    pub guide: Vec<GuideReference>,

    pub unique_identifier: Option<String>,

    pub dir: Option<String>,

    pub lang: Option<String>,

    pub version: Option<String>,

    /// Entry path of the package document; manifest hrefs are resolved against it
    pub zip_path: String,
}

impl FromXml for PackageDocument {
    const NAMESPACES: Namespaces = &[
        ("dc", DC_NAMESPACE),
        ("opf", OPF_NAMESPACE),
        ("opf2", OPF2_NAMESPACE),
        ("xml", XML_NAMESPACE),
    ];

    fn from_element(root: &XmlElement) -> Result<Self, PublicationError> {
        if root.name != "package" {
            return Err(PublicationError::NonCanonicalFile {
                tag: "package".to_string(),
            });
        }

        let (dublin_core, meta, item_refinements) = root
            .select_first("opf:metadata | opf2:metadata", Self::NAMESPACES)
            .map(parse_metadata)
            .unwrap_or_default();

        let manifest = root
            .select("manifest/item", Self::NAMESPACES)
            .into_iter()
            .map(parse_manifest_item)
            .collect::<Result<Vec<_>, _>>()?;

        let spine = match root.select_first("spine", Self::NAMESPACES) {
            Some(spine) => Spine {
                toc: spine.get_attr("toc"),
                page_progression_direction: spine.get_attr("page-progression-direction"),
                items: spine
                    .select("itemref", Self::NAMESPACES)
                    .into_iter()
                    .map(parse_spine_item)
                    .collect::<Result<Vec<_>, _>>()?,
            },
            None => Spine::default(),
        };

        let guide = root
            .select("guide/reference", Self::NAMESPACES)
            .into_iter()
            .filter_map(|reference| {
                Some(GuideReference {
                    kind: reference.get_attr("type")?,
                    title: reference.get_attr("title"),
                    href: reference.get_attr("href")?,
                })
            })
            .collect();

        Ok(PackageDocument {
            dublin_core,
            meta,
            item_refinements,
            manifest,
            spine,
            guide,
            unique_identifier: root.select_value("@unique-identifier", Self::NAMESPACES),
            dir: root.select_value("@dir", Self::NAMESPACES),
            lang: root.select_value("@lang | @xml:lang", Self::NAMESPACES),
            version: root.select_value("@version", Self::NAMESPACES),
            zip_path: String::new(),
        })
    }
}

impl PackageDocument {
    /// Reads the package document at `path` and resolves its hrefs against it
    ///
    /// Items whose href climbs out of the container are dropped with a warning.
    pub fn load(container: &dyn Container, path: &str) -> Result<Self, PublicationError> {
        let mut package = Self::from_bytes(container.read_bytes(path)?)?;
        package.zip_path = path.to_string();

        let base = package.zip_path.clone();
        package
            .manifest
            .retain_mut(|item| match resolve_href(&base, &item.href) {
                Ok(href) => {
                    item.href = href;
                    true
                }
                Err(err) => {
                    warn!("Skipping manifest item \"{}\": {}", item.id, err);
                    false
                }
            });
        package
            .guide
            .retain_mut(|reference| match resolve_href(&base, &reference.href) {
                Ok(href) => {
                    reference.href = href;
                    true
                }
                Err(err) => {
                    warn!("Skipping guide reference \"{}\": {}", reference.kind, err);
                    false
                }
            });

        Ok(package)
    }

    pub fn manifest_item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.id == id)
    }

    /// First refinement of a manifest item with the given property
    pub fn item_refinement(&self, id: &str, property: &str) -> Option<&MetadataRefinement> {
        self.item_refinements.get(id)?.iter().find(|refinement| {
            refinement.property == property
                || refinement
                    .property
                    .rsplit_once(':')
                    .is_some_and(|(_, local)| local == property)
        })
    }

    /// Determines the package version
    ///
    /// When the version attribute is absent or abnormal, the version is identified through
    /// characteristics of the package: an NCX declared on the spine for 2.x, a navigation
    /// document for 3.x. Anything else is treated as 2.x.
    pub fn package_version(&self) -> PackageVersion {
        if let Some(version) = &self.version {
            if version.starts_with('3') {
                return PackageVersion::Version3;
            }
            if version.starts_with('2') {
                return PackageVersion::Version2;
            }
        }

        if self.spine.toc.is_some() {
            return PackageVersion::Version2;
        }

        if self
            .manifest
            .iter()
            .any(|item| item.id == "nav" || item.has_property("nav"))
        {
            return PackageVersion::Version3;
        }

        warn!(
            "Unable to identify the version of \"{}\", reading it as 2.x",
            self.zip_path
        );
        PackageVersion::Version2
    }

    /// Dublin Core items with the given lower-cased name
    pub fn dc_items<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetadataItem> {
        self.dublin_core
            .iter()
            .filter(move |item| item.property == name)
    }

    /// Value of the identifier selected by `unique-identifier`, else the first identifier
    pub fn unique_identifier_value(&self) -> Option<String> {
        let unique = self.unique_identifier.as_deref();
        self.dc_items("identifier")
            .find(|item| item.id.is_some() && item.id.as_deref() == unique)
            .or_else(|| self.dc_items("identifier").next())
            .map(|item| item.value.clone())
    }
}

/// Collects the Dublin Core and `meta` items below `metadata`, refinements attached
fn parse_metadata(
    metadata: &XmlElement,
) -> (
    Vec<MetadataItem>,
    Vec<MetadataItem>,
    HashMap<String, Vec<MetadataRefinement>>,
) {
    let mut dublin_core = Vec::new();
    let mut meta = Vec::new();
    let mut refinements = HashMap::<String, Vec<MetadataRefinement>>::new();

    for element in metadata.descendants().skip(1) {
        let is_dublin_core = element.namespace.as_deref() == Some(DC_NAMESPACE)
            || element.prefix.as_deref() == Some("dc");

        if is_dublin_core {
            dublin_core.push(parse_dc_element(element));
            continue;
        }

        if element.name != "meta" {
            continue;
        }

        match (element.get_attr("property"), element.get_attr("name")) {
            (Some(property), _) => {
                let value = element.text().normalize_whitespace();
                let lang = element.get_attr_local("lang");

                if let Some(refines) = element.get_attr("refines") {
                    let id = refines.strip_prefix('#').unwrap_or(&refines).to_string();
                    refinements.entry(id).or_default().push(MetadataRefinement {
                        property,
                        value,
                        lang,
                        scheme: element.get_attr("scheme"),
                    });
                } else {
                    meta.push(MetadataItem {
                        id: element.get_attr("id"),
                        property,
                        value,
                        lang,
                        refined: vec![],
                    });
                }
            }

            (None, Some(name)) => meta.push(MetadataItem {
                id: element.get_attr("id"),
                property: name,
                value: element
                    .get_attr("content")
                    .unwrap_or_default()
                    .normalize_whitespace(),
                lang: None,
                refined: vec![],
            }),

            (None, None) => warn!("Ignoring a meta element without property or name"),
        }
    }

    for item in dublin_core.iter_mut().chain(meta.iter_mut()) {
        if let Some(id) = &item.id {
            if let Some(refined) = refinements.remove(id) {
                item.refined.extend(refined);
            }
        }
    }

    (dublin_core, meta, refinements)
}

/// In EPUB 2.x and DAISY packages, supplementary metadata is carried by the attributes of
/// the element (`opf:role`, `opf:file-as`, `opf:event`); they become refinements.
fn parse_dc_element(element: &XmlElement) -> MetadataItem {
    let mut refined = element
        .attributes
        .iter()
        .filter(|(name, _)| !matches!(name.as_str(), "id" | "lang" | "xml:lang" | "dir"))
        .map(|(name, value)| MetadataRefinement {
            property: name
                .rsplit_once(':')
                .map(|(_, local)| local.to_string())
                .unwrap_or_else(|| name.clone()),
            value: value.normalize_whitespace(),
            lang: None,
            scheme: None,
        })
        .collect::<Vec<_>>();
    refined.sort_by(|a, b| a.property.cmp(&b.property));

    MetadataItem {
        id: element.get_attr("id"),
        property: element.name.to_lowercase(),
        value: element.text().normalize_whitespace(),
        lang: element.get_attr_local("lang"),
        refined,
    }
}

fn parse_manifest_item(element: &XmlElement) -> Result<ManifestItem, PublicationError> {
    let id = element
        .get_attr("id")
        .ok_or_else(|| PublicationError::MissingRequiredAttribute {
            tag: element.tag_name(),
            attribute: "id".to_string(),
        })?;
    let href = element
        .get_attr("href")
        .ok_or_else(|| PublicationError::MissingRequiredAttribute {
            tag: element.tag_name(),
            attribute: "href".to_string(),
        })?;

    Ok(ManifestItem {
        id,
        href,
        media_type: element
            .get_attr("media-type")
            .filter(|media_type| !media_type.trim().is_empty()),
        properties: element.get_attr("properties"),
        fallback: element.get_attr("fallback"),
        media_overlay: element.get_attr("media-overlay"),
    })
}

fn parse_spine_item(element: &XmlElement) -> Result<SpineItem, PublicationError> {
    let idref = element
        .get_attr("idref")
        .ok_or_else(|| PublicationError::MissingRequiredAttribute {
            tag: element.tag_name(),
            attribute: "idref".to_string(),
        })?;

    Ok(SpineItem {
        idref,
        id: element.get_attr("id"),
        properties: element.get_attr("properties"),
        linear: element
            .get_attr("linear")
            .map(|linear| linear.trim() != "no")
            .unwrap_or(true),
    })
}

pub fn add_language(publication: &mut Publication, package: &PackageDocument) {
    let languages = package
        .dc_items("language")
        .map(|item| item.value.clone())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();

    publication.metadata.language = match (languages.is_empty(), &package.lang) {
        (true, Some(lang)) => vec![lang.clone()],
        _ => languages,
    };
}

/// Main title (by `title-type` refinement when present, else the first title)
///
/// Alternate-script refinements turn the title into a language map.
pub fn add_title(publication: &mut Publication, package: &PackageDocument) {
    let titles = package.dc_items("title").collect::<Vec<_>>();
    let Some(main) = titles
        .iter()
        .find(|item| {
            item.refinement("title-type")
                .is_some_and(|refinement| refinement.value == "main")
        })
        .or_else(|| titles.first())
    else {
        return;
    };

    let alternates = main
        .refinements("alternate-script")
        .filter_map(|refinement| Some((refinement.lang.clone()?, refinement.value.clone())))
        .collect::<Vec<_>>();

    let title = if alternates.is_empty() {
        LocalizedString::Plain(main.value.clone())
    } else {
        let lang = main
            .lang
            .clone()
            .or_else(|| publication.metadata.language.first().cloned())
            .unwrap_or_else(|| "und".to_string());
        let mut map = alternates.into_iter().collect::<BTreeMap<_, _>>();
        map.insert(lang, main.value.clone());
        LocalizedString::Localized(map)
    };

    publication.metadata.title = Some(title);
    publication.metadata.sort_as = main
        .refinement("file-as")
        .map(|refinement| refinement.value.clone());
}

/// Identifiers, the unique one first; the unique one is also kept in the provenance map
pub fn add_identifier(publication: &mut Publication, package: &PackageDocument) {
    if let Some(unique) = package.unique_identifier_value() {
        publication.metadata.identifier.insert(unique.clone());
        publication.add_internal_text(INTERNAL_UNIQUE_IDENTIFIER, unique);
    }

    for item in package.dc_items("identifier") {
        if !item.value.is_empty() {
            publication.metadata.identifier.insert(item.value.clone());
        }
    }
}

/// `meta` pairs not otherwise modeled go to the additional metadata bag
///
/// Total durations (`media:duration`, `dtb:totalTime`) set the publication duration.
pub fn add_other_metadata(publication: &mut Publication, package: &PackageDocument) {
    for item in &package.meta {
        match item.property.as_str() {
            "media:duration" | "dtb:totalTime" => match parse_clock_value(&item.value) {
                Some(duration) => publication.metadata.duration = Some(duration),
                None => warn!("Malformed duration \"{}\" in {}", item.value, item.property),
            },

            _ => {
                publication.metadata.additional.insert(
                    item.property.clone(),
                    AdditionalValue::Text(item.value.clone()),
                );
            }
        }
    }
}

/// `spine@page-progression-direction`, else `package@dir`, else the script of the language
pub fn set_direction(publication: &mut Publication, package: &PackageDocument) {
    let declared = package
        .spine
        .page_progression_direction
        .as_deref()
        .or(package.dir.as_deref());

    publication.metadata.direction = match declared {
        Some("rtl") => Direction::Rtl,
        Some("ltr") => Direction::Ltr,
        _ => {
            let rtl_language = publication.metadata.language.first().is_some_and(|lang| {
                let primary = lang.split(['-', '_']).next().unwrap_or_default();
                RTL_LANGUAGES.contains(&primary.to_lowercase().as_str())
            });
            if rtl_language {
                Direction::Rtl
            } else {
                Direction::Auto
            }
        }
    };
}

/// Routes `creator`, `contributor` and `publisher` elements by MARC relator role
pub fn add_contributors(publication: &mut Publication, package: &PackageDocument) {
    for kind in ["creator", "contributor", "publisher"] {
        for item in package.dc_items(kind) {
            if item.value.is_empty() {
                continue;
            }

            let role = item
                .refinement("role")
                .map(|refinement| refinement.value.trim().to_string());
            let mut contributor = Contributor::named(item.value.as_str());
            contributor.sort_as = item
                .refinement("file-as")
                .map(|refinement| refinement.value.clone());

            let metadata = &mut publication.metadata;
            let target = match (kind, role.as_deref()) {
                ("publisher", _) | (_, Some("pbl")) => &mut metadata.publisher,
                (_, Some("aut")) => &mut metadata.author,
                (_, Some("trl")) => &mut metadata.translator,
                (_, Some("edt")) => &mut metadata.editor,
                (_, Some("art")) => &mut metadata.artist,
                (_, Some("ill")) => &mut metadata.illustrator,
                (_, Some("clr")) => &mut metadata.colorist,
                (_, Some("nrt")) => &mut metadata.narrator,
                ("creator", None) => &mut metadata.author,
                (_, role) => {
                    contributor.role = role.map(|role| vec![role.to_string()]).unwrap_or_default();
                    &mut metadata.contributor
                }
            };
            target.push(contributor);
        }
    }
}

pub fn add_subjects(publication: &mut Publication, package: &PackageDocument) {
    for item in package.dc_items("subject") {
        if item.value.is_empty() {
            continue;
        }

        publication.metadata.subject.push(Subject {
            name: LocalizedString::Plain(item.value.clone()),
            sort_as: None,
            scheme: item
                .refinement("authority")
                .map(|refinement| refinement.value.clone()),
            code: item
                .refinement("term")
                .map(|refinement| refinement.value.clone()),
        });
    }
}

/// `dc:date`, the one with `event="publication"` preferred
pub fn add_publication_date(publication: &mut Publication, package: &PackageDocument) {
    let dates = package.dc_items("date").collect::<Vec<_>>();
    let date = dates
        .iter()
        .find(|item| {
            item.refinement("event")
                .is_some_and(|refinement| refinement.value == "publication")
        })
        .or_else(|| dates.first());

    if let Some(date) = date {
        publication.metadata.published = parse_date(&date.value);
        if publication.metadata.published.is_none() {
            warn!("Unrecognized publication date \"{}\"", date.value);
        }
    }
}

pub fn add_description(publication: &mut Publication, package: &PackageDocument) {
    publication.metadata.description = package
        .dc_items("description")
        .map(|item| item.value.clone())
        .find(|value| !value.is_empty());
}
