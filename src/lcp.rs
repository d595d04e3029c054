//! LCP-protected resources
//!
//! The license document (`META-INF/license.lcpl`) is parsed into [`LcpLicense`]. Resources
//! whose encryption properties carry the LCP scheme are AES-256-CBC encrypted with a
//! leading 16-byte IV and PKCS#7 padding, optionally deflated before encryption.
//!
//! The block cipher itself is not part of this crate: it is reached through
//! [`ContentDecryptor`], which owns the content key. [`LcpTransform`] only does the block
//! arithmetic, so partial reads decrypt the cipher blocks covering the range and nothing
//! else.

use std::io::Read;

use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};

use crate::{
    container::{ByteRange, ResourceStream},
    error::PublicationError,
    publication::{Link, Publication},
    transform::Transform,
};

/// Path of the license document
pub const LICENSE_FILE: &str = "META-INF/license.lcpl";

/// Key scheme of LCP-protected resources
pub const LCP_SCHEME: &str = "http://readium.org/2014/11/lcp";

/// Retrieval method pointing at the content key of the license
pub const LCP_RETRIEVAL_METHOD: &str = "license.lcpl#/encryption/content_key";

/// Content encryption algorithm of LCP
pub const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";

const BLOCK_SIZE: u64 = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcpLicense {
    pub id: String,
    pub issued: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub provider: String,
    pub encryption: LcpEncryption,
    pub links: Vec<LcpLink>,
    pub rights: Option<LcpRights>,
}

impl LcpLicense {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PublicationError> {
        serde_json::from_slice(bytes).map_err(PublicationError::from)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcpEncryption {
    pub profile: String,
    pub content_key: LcpContentKey,
    pub user_key: LcpUserKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcpContentKey {
    pub algorithm: String,
    pub encrypted_value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcpUserKey {
    pub algorithm: String,
    pub text_hint: String,
    pub key_check: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcpLink {
    pub rel: String,
    pub href: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcpRights {
    pub print: Option<u64>,
    pub copy: Option<u64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// The decryption engine holding the content key
pub trait ContentDecryptor: Send + Sync {
    /// Decrypts whole cipher blocks in CBC mode, chaining from `iv`
    ///
    /// `blocks` is a multiple of 16 bytes long. Padding is left in place.
    fn decrypt_blocks(
        &self,
        license: &LcpLicense,
        iv: &[u8],
        blocks: &[u8],
    ) -> Result<Vec<u8>, PublicationError>;
}

/// Decrypts LCP-protected resources through a [`ContentDecryptor`]
pub struct LcpTransform<D: ContentDecryptor> {
    decryptor: D,
}

impl<D: ContentDecryptor> LcpTransform<D> {
    pub fn new(decryptor: D) -> Self {
        Self { decryptor }
    }

    fn rejected(link: &Link, reason: impl Into<String>) -> PublicationError {
        PublicationError::TransformRejected {
            href: link.href.clone(),
            reason: reason.into(),
        }
    }

    /// Decrypts the whole resource, strips the padding and inflates it when needed
    fn decrypt_all(
        &self,
        license: &LcpLicense,
        link: &Link,
        raw: ResourceStream,
        deflated: bool,
    ) -> Result<Vec<u8>, PublicationError> {
        let data = raw.read_to_vec()?;
        let (iv, blocks) = data.split_at(BLOCK_SIZE as usize);
        let mut plaintext = self.decryptor.decrypt_blocks(license, iv, blocks)?;

        let padding = padding_length(&plaintext).ok_or_else(|| Self::rejected(link, "invalid padding"))?;
        plaintext.truncate(plaintext.len() - padding);

        if !deflated {
            return Ok(plaintext);
        }

        let mut inflated = Vec::new();
        DeflateDecoder::new(plaintext.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|err| Self::rejected(link, format!("inflate failed: {err}")))?;
        Ok(inflated)
    }

    /// Plaintext length of an uncompressed resource, from its last two cipher blocks
    fn plaintext_length(
        &self,
        license: &LcpLicense,
        link: &Link,
        raw: &mut ResourceStream,
    ) -> Result<u64, PublicationError> {
        let length = raw.len();
        let tail = raw.read_at(length - 2 * BLOCK_SIZE, 2 * BLOCK_SIZE)?;
        let (iv, last) = tail.split_at(BLOCK_SIZE as usize);
        let last = self.decryptor.decrypt_blocks(license, iv, last)?;

        let padding = padding_length(&last).ok_or_else(|| Self::rejected(link, "invalid padding"))?;
        Ok(length - BLOCK_SIZE - padding as u64)
    }

    /// Decrypts the cipher blocks covering `range`, the preceding block serving as IV
    fn decrypt_range(
        &self,
        license: &LcpLicense,
        link: &Link,
        mut raw: ResourceStream,
        range: ByteRange,
    ) -> Result<Vec<u8>, PublicationError> {
        let range = range.clamp(self.plaintext_length(license, link, &mut raw)?)?;

        let first_block = range.begin / BLOCK_SIZE;
        let last_block = range.end / BLOCK_SIZE;

        // Plaintext block `n` is cipher block `n + 1`, cipher block `n` is its IV
        let cipher = raw.read_at(
            first_block * BLOCK_SIZE,
            (last_block - first_block + 2) * BLOCK_SIZE,
        )?;
        let (iv, blocks) = cipher.split_at(BLOCK_SIZE as usize);
        let plaintext = self.decryptor.decrypt_blocks(license, iv, blocks)?;

        let start = (range.begin - first_block * BLOCK_SIZE) as usize;
        let end = start + range.len() as usize;
        plaintext
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Self::rejected(link, "the decryptor returned a short buffer"))
    }
}

/// Length of a PKCS#7 padding, `None` when malformed
fn padding_length(plaintext: &[u8]) -> Option<usize> {
    let padding = *plaintext.last()? as usize;
    if padding == 0 || padding > BLOCK_SIZE as usize || padding > plaintext.len() {
        return None;
    }
    plaintext[plaintext.len() - padding..]
        .iter()
        .all(|byte| *byte as usize == padding)
        .then_some(padding)
}

impl<D: ContentDecryptor> Transform for LcpTransform<D> {
    fn name(&self) -> &str {
        "LCP"
    }

    fn supports(&self, publication: &Publication, link: &Link) -> bool {
        publication.lcp.is_some()
            && link.properties.encrypted.as_ref().is_some_and(|encrypted| {
                encrypted.algorithm == AES256_CBC
                    && encrypted.scheme.as_deref() == Some(LCP_SCHEME)
            })
    }

    fn transform(
        &self,
        publication: &Publication,
        link: &Link,
        raw: ResourceStream,
        range: Option<ByteRange>,
    ) -> Result<ResourceStream, PublicationError> {
        let license = publication
            .lcp
            .as_ref()
            .ok_or_else(|| Self::rejected(link, "the publication has no license"))?;
        let deflated = link
            .properties
            .encrypted
            .as_ref()
            .is_some_and(|encrypted| encrypted.is_deflated());

        if raw.len() < 2 * BLOCK_SIZE || raw.len() % BLOCK_SIZE != 0 {
            return Err(Self::rejected(
                link,
                format!("{} bytes is not an IV followed by cipher blocks", raw.len()),
            ));
        }

        let plaintext = match (range, deflated) {
            (None, _) => self.decrypt_all(license, link, raw, deflated)?,
            (Some(range), false) => self.decrypt_range(license, link, raw, range)?,

            // Deflated plaintext offsets are unknown until the whole resource is inflated
            (Some(range), true) => {
                let plaintext = self.decrypt_all(license, link, raw, deflated)?;
                let range = range.clamp(plaintext.len() as u64)?;
                plaintext[range.begin as usize..=range.end as usize].to_vec()
            }
        };

        Ok(ResourceStream::from_bytes(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{Compression, write::DeflateEncoder};

    use crate::{
        container::{ByteRange, ResourceStream},
        error::PublicationError,
        lcp::{AES256_CBC, ContentDecryptor, LCP_SCHEME, LcpLicense, LcpTransform},
        publication::{Encrypted, Link, Publication},
        transform::{Transform, TransformPipeline},
    };

    const KEY: [u8; 16] = *b"0123456789abcdef";
    const IV: [u8; 16] = [7; 16];

    /// CBC over a toy block cipher: a block is encrypted by XOR with the key
    struct ToyCbc;

    impl ContentDecryptor for ToyCbc {
        fn decrypt_blocks(
            &self,
            _license: &LcpLicense,
            iv: &[u8],
            blocks: &[u8],
        ) -> Result<Vec<u8>, PublicationError> {
            let mut previous = iv.to_vec();
            let mut plaintext = Vec::with_capacity(blocks.len());
            for block in blocks.chunks(16) {
                plaintext.extend(
                    block
                        .iter()
                        .zip(KEY.iter())
                        .zip(previous.iter())
                        .map(|((c, k), p)| c ^ k ^ p),
                );
                previous = block.to_vec();
            }
            Ok(plaintext)
        }
    }

    fn encrypt(plaintext: &[u8]) -> Vec<u8> {
        let padding = 16 - plaintext.len() % 16;
        let mut padded = plaintext.to_vec();
        padded.extend(std::iter::repeat_n(padding as u8, padding));

        let mut output = IV.to_vec();
        let mut previous = IV.to_vec();
        for block in padded.chunks(16) {
            let cipher = block
                .iter()
                .zip(KEY.iter())
                .zip(previous.iter())
                .map(|((p, k), c)| p ^ k ^ c)
                .collect::<Vec<_>>();
            output.extend(&cipher);
            previous = cipher;
        }
        output
    }

    fn text() -> Vec<u8> {
        (0..1000u32)
            .map(|i| b"abcdefghijklmnopqrstuvwxyz"[(i % 26) as usize])
            .collect()
    }

    fn licensed() -> Publication {
        let mut publication = Publication::new();
        publication.lcp = Some(LcpLicense {
            id: "license".to_string(),
            ..Default::default()
        });
        publication
    }

    fn protected_link(compression: Option<&str>) -> Link {
        let mut link = Link::new("OEBPS/chapter.xhtml", "application/xhtml+xml");
        link.properties.encrypted = Some(Encrypted {
            algorithm: AES256_CBC.to_string(),
            compression: compression.map(str::to_string),
            scheme: Some(LCP_SCHEME.to_string()),
            ..Default::default()
        });
        link
    }

    fn read(
        link: &Link,
        cipher: &[u8],
        range: Option<ByteRange>,
    ) -> Result<Vec<u8>, PublicationError> {
        LcpTransform::new(ToyCbc)
            .transform(&licensed(), link, ResourceStream::from_bytes(cipher.to_vec()), range)?
            .read_to_vec()
    }

    #[test]
    fn test_supports() {
        let transform = LcpTransform::new(ToyCbc);
        assert!(transform.supports(&licensed(), &protected_link(None)));
        assert!(!transform.supports(&Publication::new(), &protected_link(None)));

        let mut other_scheme = protected_link(None);
        other_scheme.properties.encrypted.as_mut().unwrap().scheme = None;
        assert!(!transform.supports(&licensed(), &other_scheme));
        assert!(!transform.supports(
            &licensed(),
            &Link::new("OEBPS/chapter.xhtml", "application/xhtml+xml")
        ));
    }

    #[test]
    fn test_whole_read() {
        let cipher = encrypt(&text());
        assert_eq!(read(&protected_link(None), &cipher, None).unwrap(), text());

        let aligned = encrypt(&text()[..992]);
        assert_eq!(aligned.len(), 16 + 1008);
        assert_eq!(
            read(&protected_link(None), &aligned, None).unwrap(),
            text()[..992].to_vec()
        );
    }

    #[test]
    fn test_partial_reads_match_plaintext() {
        let cipher = encrypt(&text());
        let link = protected_link(None);

        for (begin, end) in [(0, 0), (0, 15), (15, 16), (17, 40), (100, 611), (990, 999)] {
            assert_eq!(
                read(&link, &cipher, Some(ByteRange::new(begin, end))).unwrap(),
                text()[begin as usize..=end as usize].to_vec(),
                "range {begin}-{end}"
            );
        }

        assert_eq!(
            read(&link, &cipher, Some(ByteRange::new(995, 5000))).unwrap(),
            text()[995..].to_vec()
        );
        assert_eq!(
            read(&link, &cipher, Some(ByteRange::from_offset(1000))).unwrap_err(),
            PublicationError::InvalidRange {
                begin: 1000,
                end: u64::MAX,
                length: 1000
            }
        );
    }

    #[test]
    fn test_deflated_reads() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&text()).unwrap();
        let cipher = encrypt(&encoder.finish().unwrap());
        let link = protected_link(Some("deflate"));

        assert_eq!(read(&link, &cipher, None).unwrap(), text());
        assert_eq!(
            read(&link, &cipher, Some(ByteRange::new(500, 520))).unwrap(),
            text()[500..=520].to_vec()
        );
    }

    #[test]
    fn test_malformed_streams_are_rejected() {
        let link = protected_link(None);

        let truncated = read(&link, &encrypt(&text())[..40], None).unwrap_err();
        assert!(matches!(truncated, PublicationError::TransformRejected { .. }));

        let mut tampered = encrypt(&text());
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(matches!(
            read(&link, &tampered, None).unwrap_err(),
            PublicationError::TransformRejected { .. }
        ));
    }

    #[test]
    fn test_registered_in_pipeline() {
        let mut pipeline = TransformPipeline::with_defaults();
        pipeline.register(Box::new(LcpTransform::new(ToyCbc)));

        let link = protected_link(None);
        let output = pipeline
            .apply(
                &licensed(),
                &link,
                ResourceStream::from_bytes(encrypt(&text())),
                Some(ByteRange::new(10, 19)),
            )
            .unwrap();
        assert_eq!(output.len(), 10);
        assert_eq!(output.read_to_vec().unwrap(), text()[10..20].to_vec());
    }

    #[test]
    fn test_license_from_json() {
        let license = LcpLicense::from_bytes(
            br#"{
  "id": "ef15e740-697f-11e3-949a-0800200c9a66",
  "issued": "2013-11-04T01:08:15+01:00",
  "provider": "https://www.imaginaryebookretailer.com",
  "encryption": {
    "profile": "http://readium.org/lcp/basic-profile",
    "content_key": {
      "algorithm": "http://www.w3.org/2001/04/xmlenc#aes256-cbc",
      "encrypted_value": "/k8RpXqf4E2WEunCp76E8PjhS051NXwAXeTD1ioazYxCRGvHLAck/KQ3cCh5JxDmCK0nRLyAxs1X0aA3z55boQ=="
    },
    "user_key": {
      "algorithm": "http://www.w3.org/2001/04/xmlenc#sha256",
      "text_hint": "Enter your email address",
      "key_check": "jJEjUDipHK3OjGt6kFq7dcOLZuicQFUYwQ+TYkAIWKm6Xv6kpHFhF7LOkUK/Owww"
    }
  },
  "links": [
    {"rel": "hint", "href": "https://www.imaginaryebookretailer.com/lcp/hint", "type": "text/html"}
  ],
  "rights": {"print": 10, "copy": 2048}
}"#,
        )
        .unwrap();

        assert_eq!(license.id, "ef15e740-697f-11e3-949a-0800200c9a66");
        assert_eq!(license.encryption.content_key.algorithm, AES256_CBC);
        assert_eq!(license.encryption.user_key.text_hint, "Enter your email address");
        assert_eq!(license.links[0].media_type.as_deref(), Some("text/html"));
        assert_eq!(license.rights.unwrap().print, Some(10));
        assert!(license.issued.is_some());

        assert!(LcpLicense::from_bytes(b"not json").is_err());
    }
}
