//! Media overlays
//!
//! Synchronization documents (SMIL) pair text fragments with audio clips. A reading-order
//! link owns at most one [`MediaOverlay`]; the overlay is attached uninitialized and
//! loaded later, at which point the durations of its tree are aggregated bottom-up.

use std::collections::BTreeMap;

use log::warn;

use crate::{
    container::Container,
    error::PublicationError,
    package::PackageDocument,
    publication::{Link, MediaOverlay, MediaOverlayNode, Publication},
    resources::{EnrichmentContext, LinkEnricher, LinkEnrichment},
    types::{MEDIA_TYPE_SMIL, ManifestItem},
    utils::{FromXml, Namespaces, XmlElement, extension_of, resolve_href},
};

/// Additional metadata key of the DAISY multimedia marker
pub const MULTIMEDIA_TYPE_KEY: &str = "dtb:multimediaType";

const EPUB_NAMESPACE: &str = "http://www.idpf.org/2007/ops";
const SMIL_NAMESPACE: &str = "http://www.w3.org/ns/SMIL";
const SMIL2_NAMESPACE: &str = "http://www.w3.org/2001/SMIL20/";

/// Values of `dtb:multimediaType` that carry synchronization documents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultimediaType {
    /// Full text with audio
    AudioFullText,

    /// Text with navigation, no audio
    TextNcx,

    /// Audio with navigation, no text
    AudioNcx,
}

impl MultimediaType {
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.trim() {
            "audioFullText" => Some(MultimediaType::AudioFullText),
            "textNCX" => Some(MultimediaType::TextNcx),
            "audioNCX" => Some(MultimediaType::AudioNcx),
            _ => None,
        }
    }

    /// The marker of `publication`, if it is one of the synchronized variants
    pub fn of(publication: &Publication) -> Option<Self> {
        publication
            .metadata
            .additional_text(MULTIMEDIA_TYPE_KEY)
            .and_then(Self::from_marker)
    }

    /// Whether the overlay duration is a playback duration of the owning link
    pub fn has_audio(&self) -> bool {
        matches!(self, MultimediaType::AudioFullText | MultimediaType::AudioNcx)
    }
}

/// Parses a SMIL clock value into seconds
///
/// Accepts full (`1:02:03.5`) and partial (`02:03.5`) clock values, timecounts with a
/// metric (`3.5s`, `250ms`, `1.5min`, `2h`), bare seconds, and the `npt=` prefix of DAISY
/// clip values.
pub fn parse_clock_value(value: &str) -> Option<f64> {
    let value = value.trim();
    let value = value.strip_prefix("npt=").unwrap_or(value).trim();
    if value.is_empty() {
        return None;
    }

    if value.contains(':') {
        let parts = value
            .split(':')
            .map(|part| part.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let seconds = match parts.as_slice() {
            [hours, minutes, seconds] => hours * 3600.0 + minutes * 60.0 + seconds,
            [minutes, seconds] => minutes * 60.0 + seconds,
            _ => return None,
        };
        return Some(seconds).filter(|seconds| seconds.is_finite() && *seconds >= 0.0);
    }

    let (number, scale) = if let Some(number) = value.strip_suffix("ms") {
        (number, 0.001)
    } else if let Some(number) = value.strip_suffix("min") {
        (number, 60.0)
    } else if let Some(number) = value.strip_suffix('h') {
        (number, 3600.0)
    } else if let Some(number) = value.strip_suffix('s') {
        (number, 1.0)
    } else {
        (value, 1.0)
    };

    number
        .trim()
        .parse::<f64>()
        .ok()
        .map(|number| number * scale)
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
}

/// A parsed synchronization document, paths relative to the document itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmilDocument {
    pub head: BTreeMap<String, String>,
    pub nodes: Vec<MediaOverlayNode>,
}

impl FromXml for SmilDocument {
    const NAMESPACES: Namespaces = &[
        ("epub", EPUB_NAMESPACE),
        ("smil", SMIL_NAMESPACE),
        ("smil2", SMIL2_NAMESPACE),
    ];

    fn from_element(root: &XmlElement) -> Result<Self, PublicationError> {
        if root.name != "smil" {
            return Err(PublicationError::NonCanonicalFile {
                tag: "smil".to_string(),
            });
        }

        let head = root
            .select("smil:head/smil:meta | smil2:head/smil2:meta", Self::NAMESPACES)
            .into_iter()
            .filter_map(|meta| Some((meta.get_attr("name")?, meta.get_attr("content")?)))
            .collect();

        let nodes = root
            .select_first("smil:body | smil2:body", Self::NAMESPACES)
            .map(parse_sequence)
            .unwrap_or_default();

        Ok(SmilDocument { head, nodes })
    }
}

/// Children of a `body` or `seq` element
fn parse_sequence(element: &XmlElement) -> Vec<MediaOverlayNode> {
    element.children().filter_map(parse_node).collect()
}

fn parse_node(element: &XmlElement) -> Option<MediaOverlayNode> {
    let role = element
        .get_attr("epub:type")
        .map(|types| types.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    match element.name.as_str() {
        "seq" => Some(MediaOverlayNode {
            text: element.get_attr("epub:textref"),
            role,
            children: parse_sequence(element),
            ..Default::default()
        }),

        "par" => {
            let text = element
                .find_children_by_name("text")
                .find_map(|text| text.get_attr("src"));
            let audio = element.find_children_by_name("audio").next();

            Some(MediaOverlayNode {
                text,
                audio: audio.and_then(audio_clip),
                role,
                duration: audio.and_then(clip_duration),
                children: element
                    .find_children_by_name("seq")
                    .filter_map(parse_node)
                    .collect(),
            })
        }

        "audio" => Some(MediaOverlayNode {
            audio: audio_clip(element),
            duration: clip_duration(element),
            role,
            ..Default::default()
        }),

        "text" => Some(MediaOverlayNode {
            text: element.get_attr("src"),
            role,
            ..Default::default()
        }),

        _ => None,
    }
}

/// `src#t=begin,end`, with both bounds in seconds
fn audio_clip(audio: &XmlElement) -> Option<String> {
    let src = audio.get_attr("src")?;
    let begin = audio.get_attr("clipBegin").and_then(|v| parse_clock_value(&v));
    let end = audio.get_attr("clipEnd").and_then(|v| parse_clock_value(&v));

    Some(match (begin, end) {
        (Some(begin), Some(end)) => format!("{src}#t={begin},{end}"),
        (Some(begin), None) => format!("{src}#t={begin}"),
        (None, Some(end)) => format!("{src}#t=0,{end}"),
        (None, None) => src,
    })
}

fn clip_duration(audio: &XmlElement) -> Option<f64> {
    let end = parse_clock_value(&audio.get_attr("clipEnd")?)?;
    let begin = audio
        .get_attr("clipBegin")
        .and_then(|v| parse_clock_value(&v))
        .unwrap_or(0.0);
    Some((end - begin).max(0.0))
}

/// Resolves the `src` of every node against the synchronization document
fn resolve_node_paths(nodes: &mut [MediaOverlayNode], base: &str) {
    for node in nodes {
        for src in [&mut node.text, &mut node.audio].into_iter().flatten() {
            match resolve_href(base, src) {
                Ok(resolved) => *src = resolved,
                Err(err) => warn!("Keeping unresolvable \"{}\" of \"{}\": {}", src, base, err),
            }
        }
        resolve_node_paths(&mut node.children, base);
    }
}

/// Attaches and loads media overlays
pub struct MediaOverlaySync;

impl MediaOverlaySync {
    /// Returns the uninitialized overlay of a manifest item
    ///
    /// The synchronization document is the one named by the item's `media-overlay`
    /// attribute, or the item itself when it is a synchronization document (DAISY spines
    /// list SMIL files directly).
    pub fn attach(item: &ManifestItem, package: &PackageDocument) -> Option<MediaOverlay> {
        if let Some(id) = &item.media_overlay {
            return match package.manifest_item(id) {
                Some(smil) => Some(MediaOverlay::new(smil.href.clone())),
                None => {
                    warn!(
                        "{}",
                        PublicationError::UnresolvedReference {
                            reference: id.to_string()
                        }
                    );
                    None
                }
            };
        }

        let is_smil = item.media_type.as_deref() == Some(MEDIA_TYPE_SMIL)
            || extension_of(&item.href).as_deref() == Some("smil");
        is_smil.then(|| MediaOverlay::new(item.href.clone()))
    }

    /// Reads and parses the synchronization document of `overlay`
    ///
    /// On success the tree, head metadata and aggregate duration are filled in and
    /// `initialized` is set. On failure the overlay is left untouched.
    pub fn load(
        container: &dyn Container,
        overlay: &mut MediaOverlay,
    ) -> Result<(), PublicationError> {
        let bytes = container.read_bytes(&overlay.smil_path)?;
        let SmilDocument { head, mut nodes } = SmilDocument::from_bytes(bytes)?;

        resolve_node_paths(&mut nodes, &overlay.smil_path);
        let duration = Self::aggregate(&mut nodes);

        overlay.head = head;
        overlay.nodes = nodes;
        overlay.duration = duration;
        overlay.initialized = true;
        Ok(())
    }

    /// Sets the duration of every inner node to the sum of its children's, bottom-up
    ///
    /// A node's own clip counts as well, so a `par` with audio and nested sequences adds
    /// both. Returns the total of `nodes`, `None` when no node carries any duration.
    pub fn aggregate(nodes: &mut [MediaOverlayNode]) -> Option<f64> {
        let mut total = None;
        for node in nodes.iter_mut() {
            let children = Self::aggregate(&mut node.children);
            node.duration = match (node.duration, children) {
                (Some(own), Some(children)) => Some(own + children),
                (own, children) => own.or(children),
            };
            if let Some(duration) = node.duration {
                total = Some(total.unwrap_or(0.0) + duration);
            }
        }
        total
    }
}

/// DAISY hook: every synchronized link gets its overlay loaded during assembly
///
/// Gated on the multimedia marker; the loaded duration becomes the link duration for the
/// audio variants only.
#[derive(Debug, Clone, Copy, Default)]
pub struct DaisyOverlayEnricher;

impl LinkEnricher for DaisyOverlayEnricher {
    fn enrich(
        &self,
        context: &EnrichmentContext<'_>,
        link: &Link,
        item: &ManifestItem,
    ) -> Result<Option<LinkEnrichment>, PublicationError> {
        let Some(kind) = MultimediaType::of(context.publication) else {
            return Ok(None);
        };
        let Some(mut overlay) = MediaOverlaySync::attach(item, context.package) else {
            return Ok(None);
        };

        if !overlay.initialized {
            if let Err(err) = MediaOverlaySync::load(context.container, &mut overlay) {
                warn!(
                    "Leaving the media overlay of \"{}\" uninitialized: {}",
                    link.href, err
                );
            }
        }

        let duration = if overlay.initialized && kind.has_audio() {
            overlay.duration
        } else {
            None
        };

        Ok(Some(LinkEnrichment {
            media_overlay: Some(overlay),
            duration,
        }))
    }
}

/// EPUB hook: attaches the overlay named by `media-overlay`
///
/// The link duration comes from the `media:duration` refinement of the synchronization
/// document. Overlays are loaded on demand unless `eager` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpubOverlayEnricher {
    pub eager: bool,
}

impl LinkEnricher for EpubOverlayEnricher {
    fn enrich(
        &self,
        context: &EnrichmentContext<'_>,
        link: &Link,
        item: &ManifestItem,
    ) -> Result<Option<LinkEnrichment>, PublicationError> {
        let Some(smil_id) = item.media_overlay.as_deref() else {
            return Ok(None);
        };
        let Some(mut overlay) = MediaOverlaySync::attach(item, context.package) else {
            return Ok(None);
        };

        if self.eager {
            if let Err(err) = MediaOverlaySync::load(context.container, &mut overlay) {
                warn!(
                    "Leaving the media overlay of \"{}\" uninitialized: {}",
                    link.href, err
                );
            }
        }

        let declared = context
            .package
            .item_refinement(smil_id, "duration")
            .and_then(|refinement| {
                let duration = parse_clock_value(&refinement.value);
                if duration.is_none() {
                    warn!("Malformed duration \"{}\" of \"{}\"", refinement.value, smil_id);
                }
                duration
            });

        Ok(Some(LinkEnrichment {
            duration: declared.or(overlay.duration),
            media_overlay: Some(overlay),
        }))
    }
}
