use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use percent_encoding::percent_decode_str;
use quick_xml::{
    NsReader,
    encoding::Decoder,
    escape::resolve_predefined_entity,
    events::{BytesStart, Event},
};

use crate::error::PublicationError;

/// Prefix → namespace URI table used when evaluating selectors
pub type Namespaces = &'static [(&'static str, &'static str)];

pub const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";
pub const OPF_NAMESPACE: &str = "http://www.idpf.org/2007/opf";

/// Provides functionality to decode byte data into strings
///
/// This trait is primarily used to decode raw byte data (such as descriptor
/// documents read from a container) into a suitable string representation.
/// It supports automatic detection of multiple encoding formats,
/// including UTF-8 (with or without BOM), UTF-16 BE, and UTF-16 LE.
///
/// ## Notes
/// - When attempting to parse a byte stream lacking a BOM (Byte Order Mark), the parsing
///   results may be unreadable; caution should be exercised when using such streams.
pub trait DecodeBytes {
    fn decode(&self) -> Result<String, PublicationError>;
}

impl DecodeBytes for Vec<u8> {
    fn decode(&self) -> Result<String, PublicationError> {
        if self.is_empty() || self.len() < 4 {
            return Err(PublicationError::EmptyDataError);
        }

        match self[0..3] {
            // Check UTF-8 BOM (0xEF, 0xBB, 0xBF)
            [0xEF, 0xBB, 0xBF, ..] => {
                String::from_utf8(self[3..].to_vec()).map_err(PublicationError::from)
            }

            // Check UTF-16 BE BOM (0xFE, 0xFF)
            [0xFE, 0xFF, ..] => {
                let utf16_units: Vec<u16> = self[2..]
                    .chunks_exact(2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .collect();

                String::from_utf16(&utf16_units).map_err(PublicationError::from)
            }

            // Check UTF-16 LE BOM (0xFF, 0xFE)
            [0xFF, 0xFE, ..] => {
                let utf16_units: Vec<u16> = self[2..]
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect();

                String::from_utf16(&utf16_units).map_err(PublicationError::from)
            }

            // Try without BOM
            _ => {
                if let Ok(utf8_str) = String::from_utf8(self.to_vec()) {
                    return Ok(utf8_str);
                }

                if self.len() % 2 == 0 {
                    let utf16_units: Vec<u16> = self
                        .chunks_exact(2)
                        .map(|b| u16::from_be_bytes([b[0], b[1]]))
                        .collect();

                    if let Ok(utf16_str) = String::from_utf16(&utf16_units) {
                        return Ok(utf16_str);
                    }
                }

                // Final fallback
                Ok(String::from_utf8_lossy(self).to_string())
            }
        }
    }
}

/// Provides functionality for normalizing whitespace characters
///
/// This trait normalizes various sequences of whitespace characters
/// (including spaces, tabs, newlines, etc.) in a string into a single
/// whitespace character, removing leading and trailing whitespace characters.
pub trait NormalizeWhitespace {
    fn normalize_whitespace(&self) -> String;
}

impl NormalizeWhitespace for &str {
    fn normalize_whitespace(&self) -> String {
        self.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl NormalizeWhitespace for String {
    fn normalize_whitespace(&self) -> String {
        self.as_str().normalize_whitespace()
    }
}

/// Represents an element node in an XML document
#[derive(Debug)]
pub struct XmlElement {
    /// The local name of the element(excluding namespace prefix)
    pub name: String,

    /// The namespace prefix of the element
    pub prefix: Option<String>,

    /// The namespace of the element
    pub namespace: Option<String>,

    /// The attributes of the element
    ///
    /// The key is the qualified attribute name as written in the document
    /// (`xml:lang`, `opf:role`), the value is the unescaped attribute value.
    pub attributes: HashMap<String, String>,

    /// The text content of the element
    pub text: Option<String>,

    /// The CDATA content of the element
    pub cdata: Option<String>,

    /// The children of the element
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Create a new element
    pub fn new(name: String) -> Self {
        Self {
            name,
            prefix: None,
            namespace: None,
            attributes: HashMap::new(),
            text: None,
            cdata: None,
            children: Vec::new(),
        }
    }

    /// Get the full tag name of the element
    ///
    /// If the element has a namespace prefix, return "prefix:name" format;
    /// otherwise, return only the element name.
    pub fn tag_name(&self) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}:{}", prefix, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Gets the text content of the element and all its child elements
    ///
    /// Collects the text content of the current element and the text content of
    /// all its child elements, removing leading and trailing whitespace.
    pub fn text(&self) -> String {
        let mut result = String::new();

        if let Some(text_value) = &self.text {
            result.push_str(text_value);
        }

        for child in &self.children {
            result.push_str(&child.text());
        }

        result.trim().to_string()
    }

    /// Returns the value of the specified attribute
    pub fn get_attr(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    /// Returns the value of an attribute by local name, whatever prefix it was written with
    pub fn get_attr_local(&self, local: &str) -> Option<String> {
        self.get_attr(local).or_else(|| {
            self.attributes
                .iter()
                .find(|(key, _)| key.rsplit_once(':').is_some_and(|(_, name)| name == local))
                .map(|(_, value)| value.clone())
        })
    }

    /// Find all elements with the specified name, the element itself included
    pub fn find_elements_by_name(&self, name: &str) -> impl Iterator<Item = &XmlElement> {
        self.descendants().filter(move |element| element.name == name)
    }

    /// Find all elements with the specified name among the child elements of the current element
    pub fn find_children_by_name(&self, name: &str) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Find all elements with the specified name list among the child elements of the current element
    pub fn find_children_by_names(&self, names: &[&str]) -> impl Iterator<Item = &XmlElement> {
        self.children
            .iter()
            .filter(move |child| names.contains(&child.name.as_str()))
    }

    /// Get children elements
    pub fn children(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter()
    }

    /// Pre-order traversal of the element and everything below it
    pub fn descendants(&self) -> impl Iterator<Item = &XmlElement> {
        DescendantsIter::new(self)
    }

    /// Evaluates an XPath-like selector relative to this element
    ///
    /// Supported syntax: child steps separated by `/` (`manifest/item`), an optional
    /// namespace prefix per step resolved through `namespaces` (`opf:metadata`), and
    /// alternatives separated by `|`, evaluated left to right. Repeated matches are
    /// returned in document order.
    pub fn select(&self, selector: &str, namespaces: Namespaces) -> Vec<&XmlElement> {
        let mut found = Vec::new();
        for path in selector.split('|').map(str::trim) {
            let mut current = vec![self];
            for step in path.split('/').filter(|step| !step.is_empty() && *step != ".") {
                current = current
                    .into_iter()
                    .flat_map(|element| {
                        element
                            .children
                            .iter()
                            .filter(|child| child.matches_step(step, namespaces))
                    })
                    .collect();
            }
            found.extend(current);
        }
        found
    }

    /// Returns the first element matched by `selector`
    pub fn select_first(&self, selector: &str, namespaces: Namespaces) -> Option<&XmlElement> {
        self.select(selector, namespaces).into_iter().next()
    }

    /// Returns the string value of `selector`
    ///
    /// A final `@name` step selects an attribute; otherwise the text content of the first
    /// matching element is returned. Absent or empty values answer `None`.
    pub fn select_value(&self, selector: &str, namespaces: Namespaces) -> Option<String> {
        for path in selector.split('|').map(str::trim) {
            let value = match path.rsplit_once('@') {
                Some((elements, attribute)) => self
                    .select(elements.trim_end_matches('/'), namespaces)
                    .into_iter()
                    .find_map(|element| element.get_attr(attribute)),
                None => self
                    .select_first(path, namespaces)
                    .map(|element| element.text()),
            };

            if let Some(value) = value.filter(|value| !value.trim().is_empty()) {
                return Some(value);
            }
        }
        None
    }

    /// Returns the value of `selector` coerced to `T`; unparsable values answer `None`
    pub fn select_parse<T: std::str::FromStr>(
        &self,
        selector: &str,
        namespaces: Namespaces,
    ) -> Option<T> {
        self.select_value(selector, namespaces)
            .and_then(|value| value.trim().parse::<T>().ok())
    }

    fn matches_step(&self, step: &str, namespaces: Namespaces) -> bool {
        match step.split_once(':') {
            Some((prefix, local)) => {
                if self.name != local {
                    return false;
                }

                let expected = namespaces
                    .iter()
                    .find(|(name, _)| *name == prefix)
                    .map(|(_, uri)| *uri);
                match (expected, &self.namespace) {
                    (Some(expected), Some(actual)) => expected == actual,
                    _ => true,
                }
            }
            None => self.name == step,
        }
    }
}

struct DescendantsIter<'a> {
    stack: Vec<&'a XmlElement>,
}

impl<'a> DescendantsIter<'a> {
    fn new(root: &'a XmlElement) -> Self {
        Self { stack: vec![root] }
    }
}

impl<'a> Iterator for DescendantsIter<'a> {
    type Item = &'a XmlElement;

    fn next(&mut self) -> Option<Self::Item> {
        let element = self.stack.pop()?;
        self.stack.extend(element.children.iter().rev());
        Some(element)
    }
}

/// A descriptor document shape mapped out of an XML tree
///
/// Implementations describe their fields as selectors evaluated against the root
/// element with [`XmlElement::select`] and friends, resolving prefixes through
/// `NAMESPACES`.
pub trait FromXml: Sized {
    /// Prefix table for the selectors used by the implementation
    const NAMESPACES: Namespaces;

    fn from_element(root: &XmlElement) -> Result<Self, PublicationError>;

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, PublicationError> {
        let root = XmlReader::parse_bytes(bytes)?;
        Self::from_element(&root)
    }
}

/// XML parser used to parse XML content and build an XML element tree
pub struct XmlReader {}

impl XmlReader {
    /// Parses an XML from string and builds the root element
    ///
    /// This function takes an XML string, parses its content using the `quick_xml` library,
    /// and builds an `XmlElement` tree representing the structure of the entire XML document.
    ///
    /// ## Parameters
    /// - `content`: The XML string to be parsed
    ///
    /// ## Return
    /// - `Ok(XmlElement)`: The root element of the XML element tree
    /// - `Err(PublicationError)`: An error occurred during parsing
    pub fn parse(content: &str) -> Result<XmlElement, PublicationError> {
        if content.is_empty() {
            return Err(PublicationError::EmptyDataError);
        }

        let mut reader = NsReader::from_str(content);
        reader.config_mut().trim_text(false);

        let mut buf = Vec::new();
        let mut stack = Vec::<XmlElement>::new();
        let mut root = None;
        let mut namespace_map = HashMap::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Eof) => break,

                Ok(Event::Start(e)) => {
                    let element = Self::build_element(&e, reader.decoder(), &mut namespace_map)?;
                    stack.push(element);
                }

                Ok(Event::End(_)) => {
                    if let Some(element) = stack.pop() {
                        // If the stack is empty,
                        // the current element is the root element
                        if stack.is_empty() {
                            root = Some(element);
                        } else if let Some(parent) = stack.last_mut() {
                            parent.children.push(element);
                        }
                    }
                }

                // Self-closing element
                Ok(Event::Empty(e)) => {
                    let element = Self::build_element(&e, reader.decoder(), &mut namespace_map)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }

                Ok(Event::Text(e)) => {
                    if let Some(element) = stack.last_mut() {
                        let text = String::from_utf8_lossy(e.as_ref()).to_string();
                        if !text.trim().is_empty() {
                            element.text.get_or_insert_with(String::new).push_str(&text);
                        }
                    }
                }

                // Entity and character references are reported apart from the text around them
                Ok(Event::GeneralRef(e)) => {
                    if let Some(element) = stack.last_mut() {
                        let resolved = match e.resolve_char_ref()? {
                            Some(ch) => Some(ch.to_string()),
                            None => resolve_predefined_entity(&String::from_utf8_lossy(&e))
                                .map(str::to_string),
                        };
                        if let Some(resolved) = resolved {
                            element.text.get_or_insert_with(String::new).push_str(&resolved);
                        }
                    }
                }

                Ok(Event::CData(e)) => {
                    if let Some(element) = stack.last_mut() {
                        element.cdata = Some(String::from_utf8_lossy(e.as_ref()).to_string());
                    }
                }

                Err(err) => return Err(err.into()),

                // Comment, PI, Declaration, Doctype
                _ => {}
            }
            buf.clear();
        }

        if let Some(element) = root.as_mut() {
            Self::assign_namespace(element, &namespace_map);
        }

        root.ok_or(PublicationError::FailedParsingXml)
    }

    /// Parse XML from bytes and builds the root element
    pub fn parse_bytes(bytes: Vec<u8>) -> Result<XmlElement, PublicationError> {
        let content = bytes.decode()?;
        Self::parse(&content)
    }

    fn build_element(
        e: &BytesStart,
        decoder: Decoder,
        namespace_map: &mut HashMap<String, String>,
    ) -> Result<XmlElement, PublicationError> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
        let mut element = XmlElement::new(name);

        if let Some(prefix) = e.name().prefix() {
            element.prefix = Some(String::from_utf8_lossy(prefix.as_ref()).to_string());
        }

        for attr in e.attributes().flatten() {
            let attr_key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let attr_value = attr.decode_and_unescape_value(decoder)?.into_owned();

            // Handle namespace attributes
            if attr_key == "xmlns" || attr_key.starts_with("xmlns:") {
                match attr_key.split_once(':') {
                    Some((_, prefix)) => namespace_map.insert(prefix.to_string(), attr_value),
                    None => namespace_map.insert(attr_key, attr_value),
                };
                continue;
            }

            element.attributes.insert(attr_key, attr_value);
        }

        Ok(element)
    }

    /// Assign namespace to element recursively
    fn assign_namespace(element: &mut XmlElement, namespace_map: &HashMap<String, String>) {
        if let Some(prefix) = &element.prefix {
            if let Some(namespace) = namespace_map.get(prefix) {
                element.namespace = Some(namespace.clone());
            }
        } else if let Some(namespace) = namespace_map.get("xmlns") {
            element.namespace = Some(namespace.clone());
        }

        for child in element.children.iter_mut() {
            Self::assign_namespace(child, namespace_map);
        }
    }
}

/// Splits `href` into its path and optional fragment
pub fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (href, None),
    }
}

/// Whether `href` carries a URL scheme (`http:`, `data:`, ...) rather than a container path
pub fn is_absolute_url(href: &str) -> bool {
    href.split_once(':').is_some_and(|(scheme, _)| {
        scheme.len() > 1
            && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    })
}

/// Resolves an href found in `base_file` to a percent-decoded path relative to the
/// container root
///
/// - `/x` is relative to the container root
/// - `../x` climbs out of the directory of `base_file`; climbing above the root is rejected
/// - `#frag` refers to `base_file` itself
/// - URLs with a scheme are returned untouched
pub fn resolve_href(base_file: &str, href: &str) -> Result<String, PublicationError> {
    if is_absolute_url(href) {
        return Ok(href.to_string());
    }

    let (path, fragment) = split_fragment(href);
    let decoded = percent_decode_str(path).decode_utf8_lossy();

    let mut resolved = if decoded.is_empty() {
        base_file.to_string()
    } else {
        let mut segments = Vec::<&str>::new();
        if !decoded.starts_with('/') {
            if let Some((directory, _)) = base_file.rsplit_once('/') {
                segments.extend(directory.split('/').filter(|segment| !segment.is_empty()));
            }
        }

        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PublicationError::RelativeLinkLeakage {
                            path: href.to_string(),
                        });
                    }
                }
                segment => segments.push(segment),
            }
        }
        segments.join("/")
    };

    if let Some(fragment) = fragment {
        resolved.push('#');
        resolved.push_str(fragment);
    }
    Ok(resolved)
}

/// Lower-cased extension of the last path segment
pub fn extension_of(path: &str) -> Option<String> {
    let (path, _) = split_fragment(path);
    let file_name = path.rsplit('/').next()?;
    file_name
        .rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map(|(_, extension)| extension.to_lowercase())
}

/// Guesses a media type from the extension of `path`
pub fn guess_media_type(path: &str) -> Option<&'static str> {
    let media_type = match extension_of(path)?.as_str() {
        "xhtml" | "xht" => "application/xhtml+xml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "jxl" => "image/jxl",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "ncx" => "application/x-dtbncx+xml",
        "opf" => "application/oebps-package+xml",
        "smil" => "application/smil+xml",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(media_type)
}

/// Parses the date formats found in descriptors: RFC 3339, `YYYY-MM-DD`, `YYYY-MM`, `YYYY`
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Some(datetime.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d").ok())
        .or_else(|| {
            let year = value.parse::<i32>().ok().filter(|_| value.len() == 4)?;
            NaiveDate::from_ymd_opt(year, 1, 1)
        })?;

    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
