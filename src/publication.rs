//! Publication model
//!
//! A [`Publication`] is produced once per parse call by one of the dialect assemblers and
//! is read-only afterwards. It serializes to (and deserializes from) a JSON manifest with
//! camelCase field names, `@context`/`@type` JSON-LD keys and `type` for media types.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    container::{ByteRange, Container, ResourceStream},
    error::PublicationError,
    lcp::LcpLicense,
    media_overlay::MediaOverlaySync,
    resources::LinkEnrichment,
    transform::TransformPipeline,
    utils::split_fragment,
};

/// JSON-LD context of every produced publication
pub const WEBPUB_CONTEXT: &str = "https://readium.org/webpub-manifest/context.jsonld";

/// RDF type of every produced publication
pub const SCHEMA_BOOK: &str = "http://schema.org/Book";

/// Provenance key: original file name of the locator
pub const INTERNAL_FILENAME: &str = "filename";

/// Provenance key: dialect the publication was assembled from (`epub`, `daisy`, `cbz`)
pub const INTERNAL_TYPE: &str = "type";

/// Provenance key: backing container handle
pub const INTERNAL_CONTAINER: &str = "zip";

/// Provenance key: path of the package document inside the container
pub const INTERNAL_PACKAGE_PATH: &str = "package";

/// Provenance key: value of the identifier selected by `package@unique-identifier`
pub const INTERNAL_UNIQUE_IDENTIFIER: &str = "unique-identifier";

/// An opaque value of the provenance map
#[derive(Debug, Clone)]
pub enum InternalValue {
    Text(String),
    Container(Arc<dyn Container>),
}

/// Aggregate root of the model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    #[serde(
        rename = "@context",
        default,
        with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub context: Vec<String>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Ordered reading path, in descriptor order
    #[serde(default)]
    pub reading_order: Vec<Link>,

    /// Every other resource of the publication
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Link>,

    /// Table of contents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toc: Vec<TocNode>,

    /// Page list of the navigation document or NCX, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_list: Vec<TocNode>,

    /// Provenance map: source kind, backing container, original file name
    #[serde(skip)]
    pub internal: BTreeMap<String, InternalValue>,

    /// License document found in `META-INF/license.lcpl`
    #[serde(skip)]
    pub lcp: Option<LcpLicense>,
}

impl Publication {
    /// Creates an empty publication carrying the JSON-LD context and RDF type
    pub fn new() -> Self {
        Self {
            context: vec![WEBPUB_CONTEXT.to_string()],
            metadata: Metadata {
                rdf_type: Some(SCHEMA_BOOK.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn add_internal_text(&mut self, key: &str, value: impl Into<String>) {
        self.internal
            .insert(key.to_string(), InternalValue::Text(value.into()));
    }

    /// Returns a textual provenance value
    pub fn internal_text(&self, key: &str) -> Option<&str> {
        match self.internal.get(key) {
            Some(InternalValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    /// The container this publication was assembled from
    pub fn container(&self) -> Option<Arc<dyn Container>> {
        match self.internal.get(INTERNAL_CONTAINER) {
            Some(InternalValue::Container(container)) => Some(Arc::clone(container)),
            _ => None,
        }
    }

    /// The identifier selected by the package's `unique-identifier` attribute
    pub fn unique_identifier(&self) -> Option<&str> {
        self.internal_text(INTERNAL_UNIQUE_IDENTIFIER)
    }

    /// Finds the link of the reading order or resource list pointing at `href`
    ///
    /// The fragment of `href` is ignored.
    pub fn link_by_href(&self, href: &str) -> Option<&Link> {
        let (path, _) = split_fragment(href);
        self.reading_order
            .iter()
            .chain(self.resources.iter())
            .find(|link| split_fragment(&link.href).0 == path)
    }

    /// Loads every media overlay of the reading order that is not initialized yet
    ///
    /// Overlays that fail to load are logged and left uninitialized; the others get
    /// their duration aggregated. Returns the number of overlays loaded by this call.
    pub fn load_media_overlays(&mut self) -> Result<usize, PublicationError> {
        let container = self
            .container()
            .ok_or_else(|| PublicationError::ResourceNotFound {
                resource: INTERNAL_CONTAINER.to_string(),
            })?;

        let mut loaded = 0;
        for link in self.reading_order.iter_mut() {
            let Some(overlay) = link.media_overlay.as_mut() else {
                continue;
            };
            if overlay.initialized {
                continue;
            }

            match MediaOverlaySync::load(container.as_ref(), overlay) {
                Ok(()) => loaded += 1,
                Err(err) => warn!(
                    "Failed to load the media overlay \"{}\" of \"{}\": {}",
                    overlay.smil_path, link.href, err
                ),
            }
        }
        Ok(loaded)
    }

    /// Reads the bytes of `link` from the backing container
    ///
    /// The first transform of `pipeline` supporting the link receives the raw stream and
    /// the requested range. Without a transform, the raw stream is restricted to `range`.
    pub fn open_resource(
        &self,
        link: &Link,
        range: Option<ByteRange>,
        pipeline: &TransformPipeline,
    ) -> Result<ResourceStream, PublicationError> {
        let container = self
            .container()
            .ok_or_else(|| PublicationError::ResourceNotFound {
                resource: link.href.clone(),
            })?;

        let (path, _) = split_fragment(&link.href);
        let raw = container.read_entry(path)?;

        match (pipeline.select(self, link), range) {
            (Some(transform), range) => {
                debug!("Applying {} to \"{}\"", transform.name(), link.href);
                transform.transform(self, link, raw, range)
            }
            (None, Some(range)) => raw.restrict(range),
            (None, None) => Ok(raw),
        }
    }

    /// Serializes the publication manifest
    pub fn to_json(&self) -> Result<String, PublicationError> {
        serde_json::to_string_pretty(self).map_err(PublicationError::from)
    }

    /// Deserializes a publication manifest
    ///
    /// The returned publication has no backing container.
    pub fn from_json(json: &str) -> Result<Self, PublicationError> {
        serde_json::from_str(json).map_err(PublicationError::from)
    }
}

/// Reading progression of the publication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ltr,
    Rtl,
    #[default]
    Auto,
}

impl Direction {
    pub fn is_auto(&self) -> bool {
        *self == Direction::Auto
    }
}

/// A plain string, or a language → string map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalizedString {
    Plain(String),
    Localized(BTreeMap<String, String>),
}

impl LocalizedString {
    /// The plain value, or the first value of the map in language order
    pub fn default_value(&self) -> Option<&str> {
        match self {
            LocalizedString::Plain(value) => Some(value),
            LocalizedString::Localized(map) => map.values().next().map(String::as_str),
        }
    }
}

impl From<&str> for LocalizedString {
    fn from(value: &str) -> Self {
        LocalizedString::Plain(value.to_string())
    }
}

impl From<String> for LocalizedString {
    fn from(value: String) -> Self {
        LocalizedString::Plain(value)
    }
}

/// A value of the open-ended metadata bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdditionalValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl AdditionalValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AdditionalValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub rdf_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<LocalizedString>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_as: Option<String>,

    #[serde(
        serialize_with = "one_or_many::serialize_set",
        deserialize_with = "one_or_many::deserialize",
        skip_serializing_if = "IndexSet::is_empty"
    )]
    pub identifier: IndexSet<String>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub language: Vec<String>,

    #[serde(rename = "readingProgression", skip_serializing_if = "Direction::is_auto")]
    pub direction: Direction,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,

    /// Parse time of the publication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub subject: Vec<Subject>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub author: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub translator: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub editor: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub artist: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub illustrator: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub letterer: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub penciler: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub colorist: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub inker: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub narrator: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub contributor: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub publisher: Vec<Contributor>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub imprint: Vec<Contributor>,

    /// Total playback duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_pages: Option<u32>,

    /// Dialect-specific fields not otherwise modeled (`dtb:multimediaType`, ...)
    #[serde(flatten)]
    pub additional: BTreeMap<String, AdditionalValue>,
}

impl Metadata {
    /// Textual value of an additional metadata key
    pub fn additional_text(&self, key: &str) -> Option<&str> {
        self.additional.get(key).and_then(AdditionalValue::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ContributorRepr")]
pub struct Contributor {
    pub name: LocalizedString,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_as: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    #[serde(with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub role: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

impl Contributor {
    pub fn named(name: impl Into<LocalizedString>) -> Self {
        Self {
            name: name.into(),
            sort_as: None,
            identifier: None,
            role: vec![],
            position: None,
        }
    }
}

/// Accepted JSON shapes of a contributor: a bare name, or the full object
#[derive(Deserialize)]
#[serde(untagged)]
enum ContributorRepr {
    Name(String),
    Full(ContributorFields),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContributorFields {
    name: LocalizedString,
    sort_as: Option<String>,
    identifier: Option<String>,
    #[serde(default, deserialize_with = "one_or_many::deserialize")]
    role: Vec<String>,
    position: Option<f64>,
}

impl From<ContributorRepr> for Contributor {
    fn from(value: ContributorRepr) -> Self {
        match value {
            ContributorRepr::Name(name) => Contributor::named(name),
            ContributorRepr::Full(fields) => Contributor {
                name: fields.name,
                sort_as: fields.sort_as,
                identifier: fields.identifier,
                role: fields.role,
                position: fields.position,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SubjectRepr")]
pub struct Subject {
    pub name: LocalizedString,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_as: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubjectRepr {
    Name(String),
    Full {
        name: LocalizedString,
        #[serde(rename = "sortAs")]
        sort_as: Option<String>,
        scheme: Option<String>,
        code: Option<String>,
    },
}

impl From<SubjectRepr> for Subject {
    fn from(value: SubjectRepr) -> Self {
        match value {
            SubjectRepr::Name(name) => Subject {
                name: LocalizedString::Plain(name),
                sort_as: None,
                scheme: None,
                code: None,
            },
            SubjectRepr::Full {
                name,
                sort_as,
                scheme,
                code,
            } => Subject {
                name,
                sort_as,
                scheme,
                code,
            },
        }
    }
}

/// Encryption properties of a link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Encrypted {
    /// Algorithm URI (`http://www.idpf.org/2008/embedding`, ...)
    pub algorithm: String,

    /// `deflate` or `none`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_length: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Key scheme, `http://readium.org/2014/11/lcp` for LCP-protected resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

impl Encrypted {
    pub fn is_deflated(&self) -> bool {
        self.compression.as_deref() == Some("deflate")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<Encrypted>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contains: Vec<String>,

    /// Path of the synchronization document of the link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_overlay: Option<String>,
}

impl LinkProperties {
    pub fn is_empty(&self) -> bool {
        self.encrypted.is_none() && self.contains.is_empty() && self.media_overlay.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// Percent-decoded path relative to the container root
    pub href: String,

    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,

    #[serde(default, with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub rel: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "LinkProperties::is_empty")]
    pub properties: LinkProperties,

    /// Playback duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    /// Fallback chain, nearest fallback first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate: Vec<Link>,

    #[serde(skip)]
    pub media_overlay: Option<MediaOverlay>,

    /// Fallback id that did not resolve to a manifest item
    #[serde(skip)]
    pub unresolved_fallback: Option<String>,
}

impl Link {
    pub fn new(href: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            media_type: media_type.into(),
            ..Default::default()
        }
    }

    /// Merges the result of an enrichment hook into the link
    pub fn merge(&mut self, enrichment: LinkEnrichment) {
        if let Some(overlay) = enrichment.media_overlay {
            self.properties.media_overlay = Some(overlay.smil_path.clone());
            self.media_overlay = Some(overlay);
        }
        if let Some(duration) = enrichment.duration {
            self.duration = Some(duration);
        }
    }

    pub fn has_rel(&self, rel: &str) -> bool {
        self.rel.iter().any(|r| r == rel)
    }
}

/// A node of the table of contents or page list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocNode {
    pub href: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TocNode>,

    /// `href` does not point at any link of the publication
    #[serde(skip)]
    pub unresolved: bool,
}

impl TocNode {
    pub fn new(title: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Synchronization data owned by one reading-order link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaOverlay {
    /// Path of the synchronization document relative to the container root
    pub smil_path: String,

    /// `false` until the synchronization document has been loaded
    pub initialized: bool,

    /// Aggregate duration in seconds, meaningful once `initialized` is set
    pub duration: Option<f64>,

    /// `head/meta` name → content pairs of the synchronization document
    pub head: BTreeMap<String, String>,

    /// Top-level nodes of the synchronization body
    pub nodes: Vec<MediaOverlayNode>,
}

impl MediaOverlay {
    pub fn new(smil_path: impl Into<String>) -> Self {
        Self {
            smil_path: smil_path.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaOverlayNode {
    /// Text fragment, `chapter.xhtml#id`
    pub text: Option<String>,

    /// Audio clip, `audio.mp3#t=begin,end`
    pub audio: Option<String>,

    /// `epub:type` values of the node
    pub role: Vec<String>,

    /// Duration in seconds: the clip length for leaves, the sum of the children otherwise
    pub duration: Option<f64>,

    pub children: Vec<MediaOverlayNode>,
}

/// Serde helpers for fields that serialize a single element bare and accept either shape
///
/// - zero elements: omitted by `skip_serializing_if`, an empty array otherwise
/// - one element: the bare element
/// - two or more: an array
///
/// Deserialization accepts an array or a single value (bare object or bare string).
pub(crate) mod one_or_many {
    use indexmap::IndexSet;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    pub fn serialize<S, T>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match values {
            [single] => single.serialize(serializer),
            values => values.serialize(serializer),
        }
    }

    pub fn serialize_set<S, T>(values: &IndexSet<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        let values = values.iter().collect::<Vec<_>>();
        serialize(&values, serializer)
    }

    pub fn deserialize<'de, D, T, C>(deserializer: D) -> Result<C, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
        C: FromIterator<T>,
    {
        Ok(match OneOrMany::<T>::deserialize(deserializer)? {
            OneOrMany::Many(values) => values.into_iter().collect(),
            OneOrMany::One(value) => std::iter::once(value).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use serde_json::{Value, json};

    use crate::{
        container::{ByteRange, Container, ResourceStream},
        error::PublicationError,
        publication::{
            AdditionalValue, Contributor, Direction, INTERNAL_CONTAINER, InternalValue, Link,
            LocalizedString, Metadata, Publication, SCHEMA_BOOK, TocNode, WEBPUB_CONTEXT,
        },
        test_support::zip_container,
        transform::{Transform, TransformPipeline},
    };

    fn contributor_one() -> Contributor {
        Contributor {
            name: LocalizedString::Plain("theName1".to_string()),
            sort_as: None,
            identifier: Some("theID1".to_string()),
            role: vec!["theRole1-A".to_string(), "theRole1-B".to_string()],
            position: Some(1.0),
        }
    }

    fn contributor_two() -> Contributor {
        Contributor {
            name: LocalizedString::Localized(BTreeMap::from([(
                "en".to_string(),
                "theName2".to_string(),
            )])),
            sort_as: None,
            identifier: Some("theID2".to_string()),
            role: vec!["theRole2".to_string()],
            position: None,
        }
    }

    fn metadata_from(imprint: Value) -> Metadata {
        serde_json::from_value(json!({ "imprint": imprint })).unwrap()
    }

    #[test]
    fn test_serialize_two_contributors_as_array() {
        let metadata = Metadata {
            imprint: vec![contributor_one(), contributor_two()],
            ..Default::default()
        };
        let json = serde_json::to_value(&metadata).unwrap();

        let imprint = json["imprint"].as_array().unwrap();
        assert_eq!(imprint.len(), 2);
        assert_eq!(imprint[0]["name"], "theName1");
        assert_eq!(imprint[0]["identifier"], "theID1");
        assert_eq!(imprint[0]["position"].as_f64(), Some(1.0));
        assert_eq!(imprint[0]["role"], json!(["theRole1-A", "theRole1-B"]));
        assert_eq!(imprint[1]["name"]["en"], "theName2");
        assert_eq!(imprint[1]["role"], "theRole2");
        assert!(imprint[1].get("position").is_none());
    }

    #[test]
    fn test_serialize_single_contributor_collapses_array() {
        let metadata = Metadata {
            imprint: vec![contributor_one()],
            ..Default::default()
        };
        let json = serde_json::to_value(&metadata).unwrap();

        assert!(json["imprint"].is_object());
        assert_eq!(json["imprint"]["name"], "theName1");
        assert!(json.get("author").is_none());
    }

    #[test]
    fn test_contributor_list_round_trip() {
        let metadata = Metadata {
            imprint: vec![contributor_one(), contributor_two()],
            ..Default::default()
        };
        let json = serde_json::to_string(&metadata).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.imprint, vec![contributor_one(), contributor_two()]);

        let single = Metadata {
            imprint: vec![Contributor::named("theName1")],
            ..Default::default()
        };
        let json = serde_json::to_string(&single).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.imprint.len(), 1);
        assert_eq!(back.imprint[0].name, LocalizedString::from("theName1"));
    }

    #[test]
    fn test_deserialize_contributor_shapes() {
        let full = json!({
            "name": "theName1",
            "identifier": "theID1",
            "position": 1,
            "role": ["theRole1-A", "theRole1-B"]
        });
        let map = json!({ "name": { "en": "theName2" }, "identifier": "theID2", "role": "theRole2" });

        let both = metadata_from(json!([full.clone(), map]));
        assert_eq!(both.imprint, vec![contributor_one(), contributor_two()]);

        let one = metadata_from(json!([full.clone()]));
        assert_eq!(one.imprint, vec![contributor_one()]);

        let bare = metadata_from(full);
        assert_eq!(bare.imprint, vec![contributor_one()]);
    }

    #[test]
    fn test_deserialize_contributor_names() {
        let name_map = json!({ "name": { "en": "theName2" } });
        let expected_map = LocalizedString::Localized(BTreeMap::from([(
            "en".to_string(),
            "theName2".to_string(),
        )]));

        let names = metadata_from(json!(["theName1", name_map.clone()]));
        assert_eq!(names.imprint.len(), 2);
        assert_eq!(names.imprint[0].name, LocalizedString::from("theName1"));
        assert_eq!(names.imprint[1].name, expected_map);

        let single_string = metadata_from(json!(["theName1"]));
        assert_eq!(single_string.imprint, vec![Contributor::named("theName1")]);

        let single_map = metadata_from(json!([name_map.clone()]));
        assert_eq!(single_map.imprint[0].name, expected_map);

        let bare_string = metadata_from(json!("theName1"));
        assert_eq!(bare_string.imprint, vec![Contributor::named("theName1")]);

        let bare_map = metadata_from(name_map);
        assert_eq!(bare_map.imprint.len(), 1);
        assert_eq!(bare_map.imprint[0].name, expected_map);
    }

    #[test]
    fn test_additional_metadata_is_flattened() {
        let mut metadata = Metadata::default();
        metadata.additional.insert(
            "dtb:multimediaType".to_string(),
            AdditionalValue::Text("audioFullText".to_string()),
        );
        metadata
            .additional
            .insert("fixed".to_string(), AdditionalValue::Bool(true));
        metadata
            .additional
            .insert("volume".to_string(), AdditionalValue::Number(3.0));

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["dtb:multimediaType"], "audioFullText");
        assert_eq!(json["fixed"], true);

        let back: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(back.additional_text("dtb:multimediaType"), Some("audioFullText"));
        assert_eq!(back.additional.get("fixed"), Some(&AdditionalValue::Bool(true)));
        assert_eq!(
            back.additional.get("volume"),
            Some(&AdditionalValue::Number(3.0))
        );
    }

    #[test]
    fn test_publication_manifest_shape() {
        let mut publication = Publication::new();
        publication.metadata.identifier.insert("urn:isbn:1".to_string());
        publication.metadata.language = vec!["en".to_string()];
        publication.metadata.direction = Direction::Rtl;
        publication
            .reading_order
            .push(crate::publication::Link::new("ch1.xhtml", "application/xhtml+xml"));
        publication.toc.push(TocNode::new("One", "ch1.xhtml"));

        let json: Value = serde_json::from_str(&publication.to_json().unwrap()).unwrap();
        assert_eq!(json["@context"], WEBPUB_CONTEXT);
        assert_eq!(json["metadata"]["@type"], SCHEMA_BOOK);
        assert_eq!(json["metadata"]["identifier"], "urn:isbn:1");
        assert_eq!(json["metadata"]["language"], "en");
        assert_eq!(json["metadata"]["readingProgression"], "rtl");
        assert_eq!(json["readingOrder"][0]["type"], "application/xhtml+xml");
        assert_eq!(json["toc"][0]["title"], "One");
        assert!(json.get("resources").is_none());

        let back = Publication::from_json(&publication.to_json().unwrap()).unwrap();
        assert_eq!(back.metadata, publication.metadata);
        assert_eq!(back.reading_order, publication.reading_order);
        assert_eq!(back.toc, publication.toc);
        assert!(back.container().is_none());
    }

    struct Uppercase {
        checks: Arc<AtomicUsize>,
    }

    impl Transform for Uppercase {
        fn name(&self) -> &str {
            "Uppercase"
        }

        fn supports(&self, _publication: &Publication, link: &Link) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            link.href.ends_with(".txt")
        }

        fn transform(
            &self,
            _publication: &Publication,
            _link: &Link,
            raw: ResourceStream,
            range: Option<ByteRange>,
        ) -> Result<ResourceStream, PublicationError> {
            let upper = raw.read_to_vec()?.to_ascii_uppercase();
            let stream = ResourceStream::from_bytes(upper);
            match range {
                Some(range) => stream.restrict(range),
                None => Ok(stream),
            }
        }
    }

    #[test]
    fn test_open_resource_checks_each_transform_once() {
        let mut publication = Publication::new();
        let container: Arc<dyn Container> = Arc::new(zip_container(&[
            ("notes.txt", b"hello reader".as_slice()),
            ("style.css", b"body {}".as_slice()),
        ]));
        publication.internal.insert(
            INTERNAL_CONTAINER.to_string(),
            InternalValue::Container(container),
        );

        let checks = Arc::new(AtomicUsize::new(0));
        let mut pipeline = TransformPipeline::new();
        pipeline.register(Box::new(Uppercase {
            checks: Arc::clone(&checks),
        }));

        let notes = Link::new("notes.txt", "text/plain");
        let output = publication
            .open_resource(&notes, Some(ByteRange::new(6, 11)), &pipeline)
            .unwrap();
        assert_eq!(output.read_to_vec().unwrap(), b"READER".to_vec());
        assert_eq!(checks.load(Ordering::SeqCst), 1);

        let style = Link::new("style.css", "text/css");
        let output = publication
            .open_resource(&style, Some(ByteRange::new(0, 3)), &pipeline)
            .unwrap();
        assert_eq!(output.read_to_vec().unwrap(), b"body".to_vec());
        assert_eq!(checks.load(Ordering::SeqCst), 2);
    }
}
