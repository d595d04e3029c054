//! Resource transforms
//!
//! A [`TransformPipeline`] holds an ordered list of transforms. At read time the first
//! transform that supports a link receives the raw entry stream and the requested range,
//! and returns the stream handed to the caller. Links no transform supports are read as
//! they are.

use std::fmt;

use log::debug;
use sha1::{Digest, Sha1};

use crate::{
    container::{ByteRange, ResourceStream},
    error::PublicationError,
    publication::{Link, Publication},
};

/// IDPF font obfuscation algorithm
pub const IDPF_OBFUSCATION: &str = "http://www.idpf.org/2008/embedding";

/// Adobe font obfuscation algorithm
pub const ADOBE_OBFUSCATION: &str = "http://ns.adobe.com/pdf/enc#RC";

/// Number of leading bytes obfuscated by the IDPF algorithm
const IDPF_OBFUSCATED_LENGTH: u64 = 1040;

/// Number of leading bytes obfuscated by the Adobe algorithm
const ADOBE_OBFUSCATED_LENGTH: u64 = 1024;

/// A conditional stream transformation, such as decryption
pub trait Transform: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Whether this transform applies to `link`
    ///
    /// Must not have side effects: the pipeline may call it any number of times.
    fn supports(&self, publication: &Publication, link: &Link) -> bool;

    /// Transforms the raw stream of `link`
    ///
    /// `raw` is the whole entry as stored in the container. When `range` is given, the
    /// returned stream holds only the plaintext bytes of that inclusive range.
    fn transform(
        &self,
        publication: &Publication,
        link: &Link,
        raw: ResourceStream,
        range: Option<ByteRange>,
    ) -> Result<ResourceStream, PublicationError>;
}

/// Ordered list of transforms
#[derive(Default)]
pub struct TransformPipeline {
    transforms: Vec<Box<dyn Transform>>,
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.transforms.iter().map(|transform| transform.name()))
            .finish()
    }
}

impl TransformPipeline {
    /// An empty pipeline; every resource passes through
    pub fn new() -> Self {
        Self::default()
    }

    /// A pipeline with the font obfuscation transforms registered
    pub fn with_defaults() -> Self {
        let mut pipeline = Self::new();
        pipeline
            .register(Box::new(IdpfObfuscation))
            .register(Box::new(AdobeObfuscation));
        pipeline
    }

    /// Appends a transform; earlier registrations win
    pub fn register(&mut self, transform: Box<dyn Transform>) -> &mut Self {
        self.transforms.push(transform);
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// First transform, in registration order, supporting `link`
    pub fn select(&self, publication: &Publication, link: &Link) -> Option<&dyn Transform> {
        self.transforms
            .iter()
            .find(|transform| transform.supports(publication, link))
            .map(|transform| transform.as_ref())
    }

    /// Applies the selected transform, or returns `raw` unchanged when none applies
    ///
    /// The error of a failing transform is returned as is; there is no retry and no
    /// fallback to the raw bytes.
    pub fn apply(
        &self,
        publication: &Publication,
        link: &Link,
        raw: ResourceStream,
        range: Option<ByteRange>,
    ) -> Result<ResourceStream, PublicationError> {
        match self.select(publication, link) {
            Some(transform) => {
                debug!("Applying {} to \"{}\"", transform.name(), link.href);
                transform.transform(publication, link, raw, range)
            }
            None => Ok(raw),
        }
    }
}

fn has_algorithm(link: &Link, algorithm: &str) -> bool {
    link.properties
        .encrypted
        .as_ref()
        .is_some_and(|encrypted| encrypted.algorithm == algorithm)
}

fn unique_identifier<'a>(
    publication: &'a Publication,
    link: &Link,
) -> Result<&'a str, PublicationError> {
    publication
        .unique_identifier()
        .ok_or_else(|| PublicationError::TransformRejected {
            href: link.href.clone(),
            reason: "the publication has no unique identifier".to_string(),
        })
}

/// XORs the first `limit` bytes of the resource with a repeating key
///
/// Only the requested range is read; key positions follow the absolute offsets.
fn xor_leading_bytes(
    mut raw: ResourceStream,
    range: Option<ByteRange>,
    key: &[u8],
    limit: u64,
) -> Result<ResourceStream, PublicationError> {
    let range = match range {
        Some(range) => range.clamp(raw.len())?,
        None if raw.is_empty() => return Ok(raw),
        None => ByteRange::new(0, raw.len() - 1),
    };

    let mut data = raw.read_at(range.begin, range.len())?;
    for (offset, byte) in (range.begin..).zip(data.iter_mut()) {
        if offset >= limit {
            break;
        }
        *byte ^= key[(offset % key.len() as u64) as usize];
    }

    Ok(ResourceStream::from_bytes(data))
}

/// IDPF font obfuscation
///
/// The key is the SHA-1 digest of the unique identifier with its whitespace removed;
/// the first 1040 bytes are XORed with the repeated digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdpfObfuscation;

impl IdpfObfuscation {
    pub fn key(unique_identifier: &str) -> Vec<u8> {
        let stripped = unique_identifier
            .chars()
            .filter(|c| !matches!(c, ' ' | '\t' | '\r' | '\n'))
            .collect::<String>();

        let mut hasher = Sha1::new();
        hasher.update(stripped.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl Transform for IdpfObfuscation {
    fn name(&self) -> &str {
        "IDPF font obfuscation"
    }

    fn supports(&self, _publication: &Publication, link: &Link) -> bool {
        has_algorithm(link, IDPF_OBFUSCATION)
    }

    fn transform(
        &self,
        publication: &Publication,
        link: &Link,
        raw: ResourceStream,
        range: Option<ByteRange>,
    ) -> Result<ResourceStream, PublicationError> {
        let key = Self::key(unique_identifier(publication, link)?);
        xor_leading_bytes(raw, range, &key, IDPF_OBFUSCATED_LENGTH)
    }
}

/// Adobe font obfuscation
///
/// The key is the 16 bytes spelled by the hex digits of the identifier's UUID
/// (`urn:uuid:` prefix and dashes dropped); the first 1024 bytes are XORed with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdobeObfuscation;

impl AdobeObfuscation {
    /// Returns `None` when the identifier does not hold 32 hex digits
    pub fn key(unique_identifier: &str) -> Option<Vec<u8>> {
        let uuid = unique_identifier.trim();
        let uuid = uuid.strip_prefix("urn:uuid:").unwrap_or(uuid);
        let digits = uuid
            .chars()
            .filter(|c| !matches!(c, '-' | ':'))
            .collect::<Vec<_>>();
        if digits.len() != 32 {
            return None;
        }

        digits
            .chunks(2)
            .map(|pair| {
                let high = pair[0].to_digit(16)?;
                let low = pair[1].to_digit(16)?;
                Some((high * 16 + low) as u8)
            })
            .collect()
    }
}

impl Transform for AdobeObfuscation {
    fn name(&self) -> &str {
        "Adobe font obfuscation"
    }

    fn supports(&self, _publication: &Publication, link: &Link) -> bool {
        has_algorithm(link, ADOBE_OBFUSCATION)
    }

    fn transform(
        &self,
        publication: &Publication,
        link: &Link,
        raw: ResourceStream,
        range: Option<ByteRange>,
    ) -> Result<ResourceStream, PublicationError> {
        let identifier = unique_identifier(publication, link)?;
        let key = Self::key(identifier).ok_or_else(|| PublicationError::TransformRejected {
            href: link.href.clone(),
            reason: format!("\"{identifier}\" is not a UUID"),
        })?;
        xor_leading_bytes(raw, range, &key, ADOBE_OBFUSCATED_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use sha1::{Digest, Sha1};

    use crate::{
        container::{ByteRange, ResourceStream},
        error::PublicationError,
        publication::{Encrypted, INTERNAL_UNIQUE_IDENTIFIER, Link, Publication},
        transform::{
            ADOBE_OBFUSCATION, AdobeObfuscation, IDPF_OBFUSCATION, IdpfObfuscation, Transform,
            TransformPipeline,
        },
    };

    const UUID: &str = "urn:uuid:12345678-9abc-def0-1234-56789abcdef0";

    fn font() -> Vec<u8> {
        (0..3000u32).map(|i| (i % 251) as u8).collect()
    }

    fn publication() -> Publication {
        let mut publication = Publication::new();
        publication.add_internal_text(INTERNAL_UNIQUE_IDENTIFIER, UUID);
        publication
    }

    fn encrypted_link(algorithm: &str) -> Link {
        let mut link = Link::new("fonts/font.otf", "font/otf");
        link.properties.encrypted = Some(Encrypted {
            algorithm: algorithm.to_string(),
            ..Default::default()
        });
        link
    }

    fn obfuscate(data: &[u8], key: &[u8], limit: usize) -> Vec<u8> {
        let mut data = data.to_vec();
        for index in 0..limit.min(data.len()) {
            data[index] ^= key[index % key.len()];
        }
        data
    }

    struct Recording {
        name: &'static str,
        supported: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Transform for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, _publication: &Publication, _link: &Link) -> bool {
            self.supported
        }

        fn transform(
            &self,
            _publication: &Publication,
            _link: &Link,
            _raw: ResourceStream,
            _range: Option<ByteRange>,
        ) -> Result<ResourceStream, PublicationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResourceStream::from_bytes(self.name.as_bytes().to_vec()))
        }
    }

    #[test]
    fn test_first_supporting_transform_is_applied() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let third_calls = Arc::new(AtomicUsize::new(0));

        let mut pipeline = TransformPipeline::new();
        pipeline
            .register(Box::new(Recording {
                name: "first",
                supported: false,
                calls: Arc::clone(&first_calls),
            }))
            .register(Box::new(Recording {
                name: "second-transform",
                supported: true,
                calls: Arc::clone(&second_calls),
            }))
            .register(Box::new(Recording {
                name: "third",
                supported: true,
                calls: Arc::clone(&third_calls),
            }));

        let link = Link::new("a.xhtml", "application/xhtml+xml");
        let output = pipeline
            .apply(
                &Publication::new(),
                &link,
                ResourceStream::from_bytes(vec![0; 64]),
                None,
            )
            .unwrap();

        assert_eq!(output.len(), "second-transform".len() as u64);
        assert_eq!(output.read_to_vec().unwrap(), b"second-transform");
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsupported_link_passes_through() {
        let pipeline = TransformPipeline::with_defaults();
        assert_eq!(pipeline.len(), 2);

        let link = Link::new("a.xhtml", "application/xhtml+xml");
        assert!(pipeline.select(&publication(), &link).is_none());

        let output = pipeline
            .apply(&publication(), &link, ResourceStream::from_bytes(font()), None)
            .unwrap();
        assert_eq!(output.len(), 3000);
        assert_eq!(output.read_to_vec().unwrap(), font());
    }

    #[test]
    fn test_idpf_obfuscation() {
        let key = IdpfObfuscation::key(UUID);
        let mut hasher = Sha1::new();
        hasher.update(UUID.as_bytes());
        assert_eq!(key, hasher.finalize().to_vec());
        assert_eq!(IdpfObfuscation::key(" urn:uuid:12345678-9abc-def0-1234-56789abcdef0\n"), key);

        let obfuscated = obfuscate(&font(), &key, 1040);
        let link = encrypted_link(IDPF_OBFUSCATION);
        let pipeline = TransformPipeline::with_defaults();

        let whole = pipeline
            .apply(&publication(), &link, ResourceStream::from_bytes(obfuscated.clone()), None)
            .unwrap();
        assert_eq!(whole.read_to_vec().unwrap(), font());

        let partial = pipeline
            .apply(
                &publication(),
                &link,
                ResourceStream::from_bytes(obfuscated),
                Some(ByteRange::new(1000, 1099)),
            )
            .unwrap();
        assert_eq!(partial.len(), 100);
        assert_eq!(partial.read_to_vec().unwrap(), font()[1000..1100].to_vec());
    }

    #[test]
    fn test_adobe_obfuscation() {
        let key = AdobeObfuscation::key(UUID).unwrap();
        assert_eq!(key.len(), 16);
        assert_eq!(key[0], 0x12);
        assert_eq!(key[15], 0xf0);
        assert!(AdobeObfuscation::key("isbn:9780000000001").is_none());

        let obfuscated = obfuscate(&font(), &key, 1024);
        let link = encrypted_link(ADOBE_OBFUSCATION);
        let pipeline = TransformPipeline::with_defaults();

        let partial = pipeline
            .apply(
                &publication(),
                &link,
                ResourceStream::from_bytes(obfuscated),
                Some(ByteRange::from_offset(1020)),
            )
            .unwrap();
        assert_eq!(partial.read_to_vec().unwrap(), font()[1020..].to_vec());
    }

    #[test]
    fn test_obfuscation_failures_are_surfaced() {
        let pipeline = TransformPipeline::with_defaults();
        let link = encrypted_link(IDPF_OBFUSCATION);

        let missing_identifier = pipeline
            .apply(&Publication::new(), &link, ResourceStream::from_bytes(font()), None)
            .unwrap_err();
        assert!(matches!(
            missing_identifier,
            PublicationError::TransformRejected { .. }
        ));

        let out_of_range = pipeline
            .apply(
                &publication(),
                &link,
                ResourceStream::from_bytes(font()),
                Some(ByteRange::new(5000, 6000)),
            )
            .unwrap_err();
        assert_eq!(
            out_of_range,
            PublicationError::InvalidRange {
                begin: 5000,
                end: 6000,
                length: 3000
            }
        );
    }
}
