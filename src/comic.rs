//! Comic archive assembler
//!
//! A comic archive is a ZIP of page images, optionally described by a ComicRack
//! `ComicInfo.xml`. Pages are ordered by their entry names, digits compared as numbers.

use std::{cmp::Ordering, sync::Arc};

use log::{debug, warn};

use crate::{
    classify::Dialect,
    container::Container,
    error::PublicationError,
    navigation::{mark_unresolved, toc_from_reading_order},
    parser::{ParseOptions, start_publication},
    publication::{AdditionalValue, Contributor, Link, LocalizedString, Publication, TocNode},
    types::MEDIA_TYPE_OCTET_STREAM,
    utils::{FromXml, Namespaces, XmlElement, extension_of, guess_media_type, parse_date},
};

/// Name of the ComicRack metadata document
pub const COMIC_INFO_FILE: &str = "ComicInfo.xml";

/// Resource forks added by the macOS archiver
const MACOS_METADATA_DIR: &str = "__MACOSX";

/// A `Pages/Page` entry of `ComicInfo.xml`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComicPage {
    /// Zero-based index of the page in the reading order
    pub image: usize,

    /// `FrontCover`, `Story`, `Advertisement`, ...
    pub kind: Option<String>,

    pub bookmark: Option<String>,
}

/// ComicRack metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComicInfo {
    pub title: Option<String>,
    pub series: Option<String>,
    pub volume: Option<f64>,
    pub number: Option<f64>,
    pub writer: Option<String>,
    pub penciller: Option<String>,
    pub inker: Option<String>,
    pub colorist: Option<String>,
    pub scan_information: Option<String>,
    pub summary: Option<String>,
    pub year: Option<String>,
    pub page_count: Option<u32>,
    pub pages: Vec<ComicPage>,
}

impl FromXml for ComicInfo {
    const NAMESPACES: Namespaces = &[];

    fn from_element(root: &XmlElement) -> Result<Self, PublicationError> {
        if root.name != "ComicInfo" {
            return Err(PublicationError::NonCanonicalFile {
                tag: "ComicInfo".to_string(),
            });
        }

        let text = |selector: &str| root.select_value(selector, Self::NAMESPACES);
        let pages = root
            .select("Pages/Page", Self::NAMESPACES)
            .into_iter()
            .filter_map(|page| {
                let image = page.get_attr("Image")?.trim().parse().ok();
                if image.is_none() {
                    warn!("Skipping a ComicInfo page without a valid image index");
                }
                Some(ComicPage {
                    image: image?,
                    kind: page.get_attr("Type"),
                    bookmark: page.get_attr("Bookmark").filter(|mark| !mark.trim().is_empty()),
                })
            })
            .collect();

        Ok(Self {
            title: text("Title"),
            series: text("Series"),
            volume: root.select_parse("Volume", Self::NAMESPACES),
            number: root.select_parse("Number", Self::NAMESPACES),
            writer: text("Writer"),
            penciller: text("Penciller"),
            inker: text("Inker"),
            colorist: text("Colorist"),
            scan_information: text("ScanInformation"),
            summary: text("Summary"),
            year: text("Year"),
            page_count: root.select_parse("PageCount", Self::NAMESPACES),
            pages,
        })
    }
}

/// Compares entry names so that `page2` sorts before `page10`
pub fn natural_cmp(left: &str, right: &str) -> Ordering {
    let mut left = left.chars().peekable();
    let mut right = right.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,

            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_digits = take_digits(&mut left);
                let r_digits = take_digits(&mut right);
                let l_trimmed = l_digits.trim_start_matches('0');
                let r_trimmed = r_digits.trim_start_matches('0');

                let ordering = l_trimmed
                    .len()
                    .cmp(&r_trimmed.len())
                    .then_with(|| l_trimmed.cmp(r_trimmed))
                    .then_with(|| l_digits.len().cmp(&r_digits.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }

            (Some(l), Some(r)) => {
                let ordering = l.to_lowercase().cmp(r.to_lowercase()).then(l.cmp(&r));
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
        digits.push(c);
    }
    digits
}

/// Assembles comic archives
#[derive(Debug, Clone, Copy, Default)]
pub struct ComicAssembler {
    options: ParseOptions,
}

impl ComicAssembler {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Builds the publication held by `container`
    ///
    /// Image entries become the reading order, everything else a resource.
    pub fn assemble(
        &self,
        container: Arc<dyn Container>,
        file_name: &str,
    ) -> Result<Publication, PublicationError> {
        let mut publication = start_publication(Dialect::Comic, &container, file_name)?;

        let mut comic_info = None;
        let mut pages = Vec::new();
        for entry in container.entries()? {
            if entry.split('/').any(|segment| segment == MACOS_METADATA_DIR) {
                continue;
            }

            if entry.rsplit('/').next() == Some(COMIC_INFO_FILE) {
                match ComicInfo::from_bytes(container.read_bytes(&entry)?) {
                    Ok(info) => comic_info = Some(info),
                    Err(err) => warn!("Ignoring the malformed \"{}\": {}", entry, err),
                }
                continue;
            }

            let media_type = media_type_of(container.as_ref(), &entry);
            let link = Link::new(entry, media_type);
            if link.media_type.starts_with("image/") {
                pages.push(link);
            } else {
                publication.resources.push(link);
            }
        }

        if pages.is_empty() {
            return Err(PublicationError::EmptyReadingOrder);
        }
        pages.sort_by(|left, right| natural_cmp(&left.href, &right.href));
        publication.reading_order = pages;

        let title = match comic_info {
            Some(info) => {
                let title = info.title.clone().or_else(|| info.series.clone());
                add_comic_info(&mut publication, info);
                title
            }
            None => None,
        };
        publication.metadata.title = Some(LocalizedString::Plain(
            title.unwrap_or_else(|| file_stem(file_name)),
        ));

        if publication.toc.is_empty() && self.options.toc_fallback_to_reading_order {
            publication.toc = toc_from_reading_order(&publication);
        }
        let mut toc = std::mem::take(&mut publication.toc);
        mark_unresolved(&mut toc, &publication);
        publication.toc = toc;

        debug!(
            "Read {} pages and {} resources from \"{}\"",
            publication.reading_order.len(),
            publication.resources.len(),
            file_name
        );
        Ok(publication)
    }
}

/// Media type from the extension, else sniffed from the content
fn media_type_of(container: &dyn Container, entry: &str) -> String {
    if let Some(media_type) = guess_media_type(entry) {
        return media_type.to_string();
    }
    if extension_of(entry).is_some() {
        return MEDIA_TYPE_OCTET_STREAM.to_string();
    }

    match container.read_bytes(entry) {
        Ok(bytes) => infer::get(&bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| MEDIA_TYPE_OCTET_STREAM.to_string()),
        Err(err) => {
            warn!("Unable to sniff \"{}\": {}", entry, err);
            MEDIA_TYPE_OCTET_STREAM.to_string()
        }
    }
}

fn file_stem(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name.to_string(),
    }
}

/// Comma-separated names of a ComicInfo credit field
fn credits(names: Option<String>) -> Vec<Contributor> {
    names
        .iter()
        .flat_map(|names| names.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Contributor::named)
        .collect()
}

fn add_comic_info(publication: &mut Publication, info: ComicInfo) {
    let metadata = &mut publication.metadata;
    metadata.author = credits(info.writer);
    metadata.penciler = credits(info.penciller);
    metadata.inker = credits(info.inker);
    metadata.colorist = credits(info.colorist);
    metadata.description = info.summary;
    metadata.published = info.year.as_deref().and_then(parse_date);
    metadata.number_of_pages = info.page_count;

    if let Some(series) = info.series {
        metadata
            .additional
            .insert("series".to_string(), AdditionalValue::Text(series));
    }
    if let Some(volume) = info.volume {
        metadata
            .additional
            .insert("volume".to_string(), AdditionalValue::Number(volume));
    }
    if let Some(number) = info.number {
        metadata
            .additional
            .insert("number".to_string(), AdditionalValue::Number(number));
    }
    if let Some(scan_information) = info.scan_information {
        metadata.additional.insert(
            "scanInformation".to_string(),
            AdditionalValue::Text(scan_information),
        );
    }

    for page in info.pages {
        let Some(link) = publication.reading_order.get_mut(page.image) else {
            warn!("ComicInfo describes page {} which is not in the archive", page.image);
            continue;
        };

        if page.kind.as_deref() == Some("FrontCover") && !link.has_rel("cover") {
            link.rel.push("cover".to_string());
        }
        if let Some(bookmark) = page.bookmark {
            publication.toc.push(TocNode::new(bookmark, link.href.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cmp::Ordering, sync::Arc};

    use crate::{
        comic::{ComicAssembler, ComicInfo, natural_cmp},
        container::Container,
        error::PublicationError,
        parser::ParseOptions,
        publication::{AdditionalValue, INTERNAL_TYPE, LocalizedString, Publication},
        test_support::zip_container,
        utils::FromXml,
    };

    const COMIC_INFO: &str = r#"<?xml version="1.0"?>
<ComicInfo xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <Series>Space Cadets</Series>
  <Number>3</Number>
  <Volume>1</Volume>
  <Writer>Ann Writer, Bob Writer</Writer>
  <Penciller>Carl Pencil</Penciller>
  <Summary>The cadets go to space.</Summary>
  <Year>2019</Year>
  <PageCount>3</PageCount>
  <Pages>
    <Page Image="0" Type="FrontCover" Bookmark="Cover"/>
    <Page Image="1"/>
    <Page Image="2" Bookmark="Chapter 2"/>
    <Page Image="7" Bookmark="Nowhere"/>
  </Pages>
</ComicInfo>"#;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x02\0\0\0";

    fn comic(entries: &[(&str, &[u8])]) -> Result<Publication, PublicationError> {
        let container: Arc<dyn Container> = Arc::new(zip_container(entries));
        ComicAssembler::new(ParseOptions::default()).assemble(container, "space-cadets-03.cbz")
    }

    #[test]
    fn test_natural_order() {
        assert_eq!(natural_cmp("page2.jpg", "page10.jpg"), Ordering::Less);
        assert_eq!(natural_cmp("page10.jpg", "page9.jpg"), Ordering::Greater);
        assert_eq!(natural_cmp("a/01.png", "a/1.png"), Ordering::Greater);
        assert_eq!(natural_cmp("Page1", "page1"), Ordering::Less);
        assert_eq!(natural_cmp("x", "x"), Ordering::Equal);
        assert_eq!(natural_cmp("x", "x1"), Ordering::Less);
    }

    #[test]
    fn test_parse_comic_info() {
        let info = ComicInfo::from_bytes(COMIC_INFO.as_bytes().to_vec()).unwrap();
        assert_eq!(info.title, None);
        assert_eq!(info.series.as_deref(), Some("Space Cadets"));
        assert_eq!(info.number, Some(3.0));
        assert_eq!(info.page_count, Some(3));
        assert_eq!(info.pages.len(), 4);
        assert_eq!(info.pages[0].kind.as_deref(), Some("FrontCover"));
        assert_eq!(info.pages[1].bookmark, None);

        let err = ComicInfo::from_bytes(b"<Comic/>".to_vec()).unwrap_err();
        assert_eq!(
            err,
            PublicationError::NonCanonicalFile {
                tag: "ComicInfo".to_string()
            }
        );
    }

    #[test]
    fn test_assemble_comic() {
        let publication = comic(&[
            ("space/page10.jpg", b"\xff\xd8\xff"),
            ("space/page2.jpg", b"\xff\xd8\xff"),
            ("space/page1.jpg", b"\xff\xd8\xff"),
            ("space/ComicInfo.xml", COMIC_INFO.as_bytes()),
            ("space/credits.txt", b"thanks"),
            ("__MACOSX/space/._page1.jpg", b"\0\x05\x16\x07"),
        ])
        .unwrap();

        assert_eq!(publication.internal_text(INTERNAL_TYPE), Some("cbz"));
        let pages = publication
            .reading_order
            .iter()
            .map(|link| link.href.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            pages,
            vec!["space/page1.jpg", "space/page2.jpg", "space/page10.jpg"]
        );
        assert!(publication.reading_order[0].has_rel("cover"));

        assert_eq!(publication.resources.len(), 1);
        assert_eq!(publication.resources[0].href, "space/credits.txt");

        let metadata = &publication.metadata;
        assert_eq!(
            metadata.title,
            Some(LocalizedString::Plain("Space Cadets".to_string()))
        );
        assert_eq!(metadata.author.len(), 2);
        assert_eq!(metadata.penciler.len(), 1);
        assert_eq!(metadata.description.as_deref(), Some("The cadets go to space."));
        assert_eq!(metadata.number_of_pages, Some(3));
        assert!(metadata.published.is_some());
        assert_eq!(
            metadata.additional.get("number"),
            Some(&AdditionalValue::Number(3.0))
        );

        let toc = publication
            .toc
            .iter()
            .map(|node| (node.title.as_str(), node.href.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            toc,
            vec![("Cover", "space/page1.jpg"), ("Chapter 2", "space/page10.jpg")]
        );
    }

    #[test]
    fn test_pages_without_extension_are_sniffed() {
        let publication =
            comic(&[("scan-b", PNG), ("scan-a", PNG), ("notes", b"plain text")]).unwrap();

        assert_eq!(publication.reading_order.len(), 2);
        assert_eq!(publication.reading_order[0].href, "scan-a");
        assert_eq!(publication.reading_order[0].media_type, "image/png");
        assert_eq!(publication.resources[0].media_type, "application/octet-stream");

        assert_eq!(
            publication.metadata.title,
            Some(LocalizedString::Plain("space-cadets-03".to_string()))
        );
        assert_eq!(publication.toc.len(), 2);
    }

    #[test]
    fn test_archive_without_pages() {
        let err = comic(&[("readme.txt", b"no pages")]).unwrap_err();
        assert_eq!(err, PublicationError::EmptyReadingOrder);
    }
}
