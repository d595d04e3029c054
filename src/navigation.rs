//! Table of contents
//!
//! Selects the navigation source of a package document and builds the table of contents
//! and page list from it. Whether an empty table of contents is replaced by the reading
//! order is left to the assembler (see [`toc_from_reading_order`]).

use log::{debug, warn};

use crate::{
    container::Container,
    error::PublicationError,
    package::PackageDocument,
    publication::{Publication, TocNode},
    types::{MEDIA_TYPE_GENERIC_XML, MEDIA_TYPE_NCX, ManifestItem},
    utils::{XmlElement, XmlReader, resolve_href, split_fragment},
};

/// Legacy navigation-control document extension
pub const NCX_EXTENSION: &str = ".ncx";

/// Table of contents and page list of a publication
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Navigation {
    pub toc: Vec<TocNode>,
    pub page_list: Vec<TocNode>,
}

/// Which navigation sources a dialect consults, in preference order
#[derive(Debug, Clone, Copy)]
pub struct NavigationResolver {
    /// Try the XHTML navigation document (`properties="nav"`) first
    navigation_document: bool,

    /// Honour `spine@toc` before looking the NCX up by media type
    spine_toc: bool,
}

impl NavigationResolver {
    /// Navigation document, then `spine@toc`, then the NCX lookup
    pub fn epub() -> Self {
        Self {
            navigation_document: true,
            spine_toc: true,
        }
    }

    /// NCX lookup only
    pub fn daisy() -> Self {
        Self {
            navigation_document: false,
            spine_toc: false,
        }
    }

    /// Selects the navigation-control document of a package
    ///
    /// 1. the item whose media type is the NCX media type
    /// 2. an item of the generic XML media type whose href ends with `.ncx`
    pub fn select_ncx<'a>(&self, package: &'a PackageDocument) -> Option<&'a ManifestItem> {
        let declared = self
            .spine_toc
            .then(|| package.spine.toc.as_deref())
            .flatten()
            .and_then(|id| package.manifest_item(id));

        declared
            .or_else(|| {
                package
                    .manifest
                    .iter()
                    .find(|item| item.media_type.as_deref() == Some(MEDIA_TYPE_NCX))
            })
            .or_else(|| {
                package.manifest.iter().find(|item| {
                    item.media_type.as_deref() == Some(MEDIA_TYPE_GENERIC_XML)
                        && item.href.ends_with(NCX_EXTENSION)
                })
            })
    }

    /// Selects the XHTML navigation document of a package
    pub fn select_navigation_document<'a>(
        &self,
        package: &'a PackageDocument,
    ) -> Option<&'a ManifestItem> {
        if !self.navigation_document {
            return None;
        }
        package.manifest.iter().find(|item| item.has_property("nav"))
    }

    /// Builds the navigation of a package
    ///
    /// A navigation document without a `toc` nav falls through to the NCX. No source at
    /// all yields an empty navigation.
    pub fn resolve(
        &self,
        package: &PackageDocument,
        container: &dyn Container,
    ) -> Result<Navigation, PublicationError> {
        let mut navigation = Navigation::default();

        if let Some(item) = self.select_navigation_document(package) {
            debug!("Reading the navigation document \"{}\"", item.href);
            let root = XmlReader::parse_bytes(container.read_bytes(&item.href)?)?;
            navigation = parse_navigation_document(&root, &item.href)?;
        }

        if navigation.toc.is_empty() {
            if let Some(item) = self.select_ncx(package) {
                debug!("Reading the navigation control document \"{}\"", item.href);
                let root = XmlReader::parse_bytes(container.read_bytes(&item.href)?)?;
                let ncx = parse_ncx(&root, &item.href)?;

                navigation.toc = ncx.toc;
                if navigation.page_list.is_empty() {
                    navigation.page_list = ncx.page_list;
                }
            }
        }

        Ok(navigation)
    }
}

/// Parses an NCX document; hrefs are resolved against `base`
pub fn parse_ncx(root: &XmlElement, base: &str) -> Result<Navigation, PublicationError> {
    if root.name != "ncx" {
        return Err(PublicationError::NonCanonicalFile {
            tag: "ncx".to_string(),
        });
    }

    let toc = root
        .find_children_by_name("navMap")
        .next()
        .map(|nav_map| parse_nav_points(nav_map, base))
        .unwrap_or_default();

    let page_list = root
        .find_children_by_name("pageList")
        .next()
        .map(|page_list| {
            page_list
                .find_children_by_name("pageTarget")
                .map(|target| ncx_node(target, base, vec![]))
                .collect()
        })
        .unwrap_or_default();

    Ok(Navigation { toc, page_list })
}

/// Walks nested `navPoint` elements, keeping document order and depth
fn parse_nav_points(parent: &XmlElement, base: &str) -> Vec<TocNode> {
    parent
        .find_children_by_name("navPoint")
        .map(|nav_point| ncx_node(nav_point, base, parse_nav_points(nav_point, base)))
        .collect()
}

fn ncx_node(element: &XmlElement, base: &str, children: Vec<TocNode>) -> TocNode {
    let title = element
        .find_children_by_name("navLabel")
        .next()
        .map(|label| label.text())
        .unwrap_or_default();

    let href = element
        .find_children_by_name("content")
        .next()
        .and_then(|content| content.get_attr("src"))
        .map(|src| resolve_or_keep(base, &src))
        .unwrap_or_default();

    TocNode {
        href,
        title,
        children,
        unresolved: false,
    }
}

/// Parses the `toc` and `page-list` navs of an XHTML navigation document
pub fn parse_navigation_document(
    root: &XmlElement,
    base: &str,
) -> Result<Navigation, PublicationError> {
    let mut navigation = Navigation::default();

    for nav in root.find_elements_by_name("nav") {
        let types = nav.get_attr("epub:type").unwrap_or_default();
        let types = types.split_whitespace().collect::<Vec<_>>();

        let Some(list) = nav.find_children_by_name("ol").next() else {
            continue;
        };

        if types.contains(&"toc") && navigation.toc.is_empty() {
            navigation.toc = parse_nav_list(list, base)?;
        } else if types.contains(&"page-list") && navigation.page_list.is_empty() {
            navigation.page_list = parse_nav_list(list, base)?;
        }
    }

    Ok(navigation)
}

/// Converts `ol`/`li` lists into nodes, recursively
fn parse_nav_list(list: &XmlElement, base: &str) -> Result<Vec<TocNode>, PublicationError> {
    let mut nodes = Vec::new();
    for item in list.find_children_by_name("li") {
        let label = item
            .find_children_by_names(&["a", "span"])
            .next()
            .ok_or_else(|| PublicationError::NonCanonicalFile {
                tag: "a/span".to_string(),
            })?;

        let children = match item.find_children_by_name("ol").next() {
            Some(sub_list) => parse_nav_list(sub_list, base)?,
            None => vec![],
        };

        nodes.push(TocNode {
            href: label
                .get_attr("href")
                .map(|href| resolve_or_keep(base, &href))
                .unwrap_or_default(),
            title: label.text(),
            children,
            unresolved: false,
        });
    }

    Ok(nodes)
}

fn resolve_or_keep(base: &str, href: &str) -> String {
    resolve_href(base, href).unwrap_or_else(|err| {
        warn!("Keeping unresolvable \"{}\" of \"{}\": {}", href, base, err);
        href.to_string()
    })
}

/// Flags every node whose href does not point at a link of the publication
///
/// Nodes are kept either way. Nodes without href (section headings) are not flagged.
/// Returns the number of flagged nodes.
pub fn mark_unresolved(nodes: &mut [TocNode], publication: &Publication) -> usize {
    let mut count = 0;
    for node in nodes {
        let (path, _) = split_fragment(&node.href);
        if !path.is_empty() && publication.link_by_href(path).is_none() {
            warn!(
                "{}",
                PublicationError::UnresolvedReference {
                    reference: node.href.clone()
                }
            );
            node.unresolved = true;
            count += 1;
        }
        count += mark_unresolved(&mut node.children, publication);
    }
    count
}

/// A flat table of contents with one node per reading-order link
///
/// Titles come from the link title, else the file name of the href.
pub fn toc_from_reading_order(publication: &Publication) -> Vec<TocNode> {
    publication
        .reading_order
        .iter()
        .map(|link| {
            let title = link.title.clone().unwrap_or_else(|| {
                let (path, _) = split_fragment(&link.href);
                path.rsplit('/').next().unwrap_or(path).to_string()
            });
            TocNode::new(title, link.href.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::{
        navigation::{
            NavigationResolver, mark_unresolved, parse_navigation_document, parse_ncx,
            toc_from_reading_order,
        },
        package::PackageDocument,
        publication::{Link, Publication, TocNode},
        test_support::zip_container,
        utils::{FromXml, XmlReader},
    };

    const NCX: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head><meta name="dtb:uid" content="DTB-0001"/></head>
  <docTitle><text>Talking Book</text></docTitle>
  <navMap>
    <navPoint id="n1" playOrder="1">
      <navLabel><text>Part One</text></navLabel>
      <content src="../smil/one.smil#p1"/>
      <navPoint id="n1-1" playOrder="2">
        <navLabel><text>Chapter 1</text></navLabel>
        <content src="../smil/one.smil#p2"/>
        <navPoint id="n1-1-1" playOrder="3">
          <navLabel><text>Section 1.1</text></navLabel>
          <content src="../smil/one.smil#p3"/>
        </navPoint>
      </navPoint>
    </navPoint>
    <navPoint id="n2" playOrder="4">
      <navLabel><text>Part Two</text></navLabel>
      <content src="../smil/two.smil"/>
    </navPoint>
  </navMap>
  <pageList>
    <pageTarget id="pg1" type="normal" value="1">
      <navLabel><text>1</text></navLabel>
      <content src="../smil/one.smil#pg1"/>
    </pageTarget>
  </pageList>
</ncx>"#;

    const NAV: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
  <body>
    <nav epub:type="landmarks"><ol><li><a href="text/ch1.xhtml">Start</a></li></ol></nav>
    <nav epub:type="toc">
      <h1>Contents</h1>
      <ol>
        <li><a href="text/ch1.xhtml">Chapter <em>One</em></a></li>
        <li>
          <span>Appendices</span>
          <ol><li><a href="text/app%20a.xhtml#top">Appendix A</a></li></ol>
        </li>
      </ol>
    </nav>
    <nav epub:type="page-list" hidden="">
      <ol><li><a href="text/ch1.xhtml#page1">1</a></li></ol>
    </nav>
  </body>
</html>"#;

    fn titles(nodes: &[TocNode]) -> Vec<&str> {
        nodes.iter().map(|node| node.title.as_str()).collect()
    }

    #[test]
    fn test_parse_ncx_keeps_order_and_depth() {
        let root = XmlReader::parse(NCX).unwrap();
        let navigation = parse_ncx(&root, "book/speechgen.ncx").unwrap();

        assert_eq!(titles(&navigation.toc), vec!["Part One", "Part Two"]);
        assert_eq!(navigation.toc[0].href, "smil/one.smil#p1");
        assert_eq!(titles(&navigation.toc[0].children), vec!["Chapter 1"]);
        assert_eq!(
            titles(&navigation.toc[0].children[0].children),
            vec!["Section 1.1"]
        );
        assert_eq!(navigation.toc[1].href, "smil/two.smil");
        assert!(navigation.toc[1].children.is_empty());

        assert_eq!(navigation.page_list.len(), 1);
        assert_eq!(navigation.page_list[0].href, "smil/one.smil#pg1");
    }

    #[test]
    fn test_parse_navigation_document() {
        let root = XmlReader::parse(NAV).unwrap();
        let navigation = parse_navigation_document(&root, "OEBPS/nav.xhtml").unwrap();

        assert_eq!(titles(&navigation.toc), vec!["Chapter One", "Appendices"]);
        assert_eq!(navigation.toc[0].href, "OEBPS/text/ch1.xhtml");
        assert_eq!(navigation.toc[1].href, "");
        assert_eq!(
            navigation.toc[1].children[0].href,
            "OEBPS/text/app a.xhtml#top"
        );
        assert_eq!(navigation.page_list[0].href, "OEBPS/text/ch1.xhtml#page1");
    }

    fn package(manifest: &str, spine: &str) -> PackageDocument {
        let xml = format!("<package><manifest>{manifest}</manifest>{spine}</package>");
        PackageDocument::from_bytes(xml.into_bytes()).unwrap()
    }

    #[test]
    fn test_select_ncx_preference_order() {
        let resolver = NavigationResolver::daisy();

        let canonical = package(
            r#"<item id="x" href="toc.ncx" media-type="text/xml"/>
               <item id="n" href="nav.ncx" media-type="application/x-dtbncx+xml"/>"#,
            "",
        );
        assert_eq!(resolver.select_ncx(&canonical).unwrap().id, "n");

        let generic = package(
            r#"<item id="o" href="book.xml" media-type="text/xml"/>
               <item id="x" href="toc.ncx" media-type="text/xml"/>"#,
            "",
        );
        assert_eq!(resolver.select_ncx(&generic).unwrap().id, "x");

        let none = package(r#"<item id="o" href="book.xml" media-type="text/xml"/>"#, "");
        assert!(resolver.select_ncx(&none).is_none());

        let declared = package(
            r#"<item id="n" href="nav.ncx" media-type="application/x-dtbncx+xml"/>
               <item id="t" href="other.ncx" media-type="application/x-dtbncx+xml"/>"#,
            r#"<spine toc="t"/>"#,
        );
        assert_eq!(NavigationResolver::epub().select_ncx(&declared).unwrap().id, "t");
        assert_eq!(resolver.select_ncx(&declared).unwrap().id, "n");
    }

    #[test]
    fn test_resolve_prefers_navigation_document() {
        let package = package(
            r#"<item id="nav" href="OEBPS/nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
               <item id="ncx" href="book/speechgen.ncx" media-type="application/x-dtbncx+xml"/>"#,
            "",
        );
        let container = zip_container(&[
            ("OEBPS/nav.xhtml", NAV.as_bytes()),
            ("book/speechgen.ncx", NCX.as_bytes()),
        ]);

        let epub = NavigationResolver::epub().resolve(&package, &container).unwrap();
        assert_eq!(titles(&epub.toc), vec!["Chapter One", "Appendices"]);

        let daisy = NavigationResolver::daisy().resolve(&package, &container).unwrap();
        assert_eq!(titles(&daisy.toc), vec!["Part One", "Part Two"]);
    }

    #[test]
    fn test_resolve_without_source_is_empty() {
        let package = package(r#"<item id="a" href="a.xhtml"/>"#, "");
        let container = zip_container(&[("a.xhtml", b"<html/>")]);
        let navigation = NavigationResolver::epub().resolve(&package, &container).unwrap();
        assert!(navigation.toc.is_empty());
        assert!(navigation.page_list.is_empty());
    }

    #[test]
    fn test_mark_unresolved_keeps_nodes() {
        let mut publication = Publication::new();
        publication.reading_order = vec![Link::new("smil/one.smil", "application/smil+xml")];

        let root = XmlReader::parse(NCX).unwrap();
        let mut toc = parse_ncx(&root, "book/speechgen.ncx").unwrap().toc;

        assert_eq!(mark_unresolved(&mut toc, &publication), 1);
        assert_eq!(toc.len(), 2);
        assert!(!toc[0].unresolved);
        assert!(!toc[0].children[0].children[0].unresolved);
        assert!(toc[1].unresolved);
    }

    #[test]
    fn test_toc_from_reading_order() {
        let mut publication = Publication::new();
        let mut titled = Link::new("text/a.xhtml", "application/xhtml+xml");
        titled.title = Some("First".to_string());
        publication.reading_order = vec![titled, Link::new("text/b.xhtml#x", "application/xhtml+xml")];

        let toc = toc_from_reading_order(&publication);
        assert_eq!(titles(&toc), vec!["First", "b.xhtml"]);
        assert_eq!(toc[1].href, "text/b.xhtml#x");
    }
}
