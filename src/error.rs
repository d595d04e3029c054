//! Error Type Definition Module
//!
//! This module defines the error types that may be encountered while classifying,
//! assembling and reading publications. All errors are uniformly wrapped in the
//! `PublicationError` enumeration for convenient error handling by the caller.
//!
//! Format classification never produces an error: a probe that does not match answers
//! [`Recognition::NotRecognized`](crate::classify::Recognition) and the classifier moves
//! on to the next strategy.

use thiserror::Error;

/// Types of errors that can occur during publication processing
///
/// Assembly-level failures (missing anchor descriptor, empty container, empty reading
/// order) reject the whole parse. `TransformRejected` and `InvalidRange` only fail the
/// read that raised them.
#[derive(Debug, Error)]
pub enum PublicationError {
    /// ZIP archive related errors
    ///
    /// Errors occur when processing the ZIP structure of a packed publication,
    /// such as file corruption, unreadability, etc.
    #[error("Archive error: {source}")]
    ArchiveError { source: zip::result::ZipError },

    /// The container holds no entries at all.
    #[error("Empty container: \"{locator}\" does not contain any entry.")]
    EmptyContainer { locator: String },

    /// Data Decoding Error - Null data
    ///
    /// This error occurs when trying to decode an empty stream.
    #[error("Decode error: The data is empty.")]
    EmptyDataError,

    /// The descriptor produced no reading-order item.
    #[error("Empty reading order: The package document does not reference any readable item.")]
    EmptyReadingOrder,

    /// XML parsing failure error
    ///
    /// The event listener ended abnormally, resulting in the root node not being initialized.
    #[error(
        "Failed parsing XML error: Unknown problems occurred during XML parsing, causing parsing failure."
    )]
    FailedParsingXml,

    /// A partial-range request does not overlap the resource.
    #[error("Invalid range: bytes {begin}-{end} are outside a resource of {length} bytes.")]
    InvalidRange { begin: u64, end: u64, length: u64 },

    #[error("IO error: {source}")]
    IOError { source: std::io::Error },

    #[error("JSON error: {source}")]
    JsonError { source: serde_json::Error },

    /// No anchor descriptor (package document) could be located
    ///
    /// Fixed anchor names, the container registry and the suffix scan all failed.
    #[error("Missing anchor: The \"{expected}\" descriptor was not found in the container.")]
    MissingAnchor { expected: String },

    /// Missing required attribute error
    ///
    /// Triggered when an XML element lacks an attribute the document format requires.
    #[error(
        "Missing required attribute: The \"{attribute}\" attribute is a must attribute for the \"{tag}\" element."
    )]
    MissingRequiredAttribute { tag: String, attribute: String },

    /// Mutex error
    ///
    /// This error occurs when the lock around a shared archive is poisoned, which means
    /// that a thread has panicked while reading from it.
    #[error("Mutex error: Mutex was poisoned.")]
    MutexError,

    /// Non-canonical file structure error
    ///
    /// This error is triggered when required XML elements are missing from a descriptor.
    #[error("Non-canonical file: The \"{tag}\" elements was not found.")]
    NonCanonicalFile { tag: String },

    /// QuickXml error
    ///
    /// This error occurs when parsing XML data using the QuickXml library.
    #[error("QuickXml error: {source}")]
    QuickXmlError { source: quick_xml::Error },

    /// Relative link leak error
    ///
    /// This error occurs when a relative path link points outside of the container,
    /// which is a security protection mechanism.
    #[error("Relative link leakage: Path \"{path}\" is out of container range.")]
    RelativeLinkLeakage { path: String },

    /// Unable to find the resource error
    ///
    /// This error occurs when an attempt is made to read an entry that does not exist
    /// in the container.
    #[error("Resource not found: Unable to find resource from \"{resource}\".")]
    ResourceNotFound { resource: String },

    /// A registered transform failed to produce a stream
    ///
    /// Surfaced to the caller of the read unmodified; no plaintext fallback is attempted.
    #[error("Transform rejected: The stream of \"{href}\" could not be transformed: {reason}")]
    TransformRejected { href: String, reason: String },

    /// None of the known dialects recognized the locator.
    #[error("Unrecognized format: \"{locator}\" is not a supported publication.")]
    UnrecognizedFormat { locator: String },

    /// A navigation or fallback reference does not resolve to a known resource
    ///
    /// Assembly logs these, flags the affected node and keeps going.
    #[error("Unresolved reference: \"{reference}\" does not point to a known resource.")]
    UnresolvedReference { reference: String },

    /// The locator is recognized but cannot be opened by this crate (remote access).
    #[error("Unsupported locator: \"{locator}\" must be opened through a caller-provided container.")]
    UnsupportedLocator { locator: String },

    /// UTF-8 decoding error
    #[error("Decode error: {source}")]
    Utf8DecodeError { source: std::string::FromUtf8Error },

    /// UTF-16 decoding error
    #[error("Decode error: {source}")]
    Utf16DecodeError { source: std::string::FromUtf16Error },

    /// WalkDir error
    ///
    /// This error occurs when listing the entries of an exploded publication directory.
    #[error("WalkDir error: {source}")]
    WalkDirError { source: walkdir::Error },
}

impl From<zip::result::ZipError> for PublicationError {
    fn from(value: zip::result::ZipError) -> Self {
        PublicationError::ArchiveError { source: value }
    }
}

impl From<quick_xml::Error> for PublicationError {
    fn from(value: quick_xml::Error) -> Self {
        PublicationError::QuickXmlError { source: value }
    }
}

impl From<std::io::Error> for PublicationError {
    fn from(value: std::io::Error) -> Self {
        PublicationError::IOError { source: value }
    }
}

impl From<serde_json::Error> for PublicationError {
    fn from(value: serde_json::Error) -> Self {
        PublicationError::JsonError { source: value }
    }
}

impl From<std::string::FromUtf8Error> for PublicationError {
    fn from(value: std::string::FromUtf8Error) -> Self {
        PublicationError::Utf8DecodeError { source: value }
    }
}

impl From<std::string::FromUtf16Error> for PublicationError {
    fn from(value: std::string::FromUtf16Error) -> Self {
        PublicationError::Utf16DecodeError { source: value }
    }
}

impl From<walkdir::Error> for PublicationError {
    fn from(value: walkdir::Error) -> Self {
        PublicationError::WalkDirError { source: value }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PublicationError {
    fn from(_value: std::sync::PoisonError<T>) -> Self {
        PublicationError::MutexError
    }
}

#[cfg(test)]
impl PartialEq for PublicationError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::EmptyContainer { locator: l }, Self::EmptyContainer { locator: r }) => l == r,
            (
                Self::InvalidRange {
                    begin: l_begin,
                    end: l_end,
                    length: l_length,
                },
                Self::InvalidRange {
                    begin: r_begin,
                    end: r_end,
                    length: r_length,
                },
            ) => l_begin == r_begin && l_end == r_end && l_length == r_length,
            (Self::MissingAnchor { expected: l }, Self::MissingAnchor { expected: r }) => l == r,
            (
                Self::MissingRequiredAttribute {
                    tag: l_tag,
                    attribute: l_attribute,
                },
                Self::MissingRequiredAttribute {
                    tag: r_tag,
                    attribute: r_attribute,
                },
            ) => l_tag == r_tag && l_attribute == r_attribute,
            (Self::NonCanonicalFile { tag: l_tag }, Self::NonCanonicalFile { tag: r_tag }) => {
                l_tag == r_tag
            }
            (
                Self::RelativeLinkLeakage { path: l_path },
                Self::RelativeLinkLeakage { path: r_path },
            ) => l_path == r_path,
            (
                Self::ResourceNotFound {
                    resource: l_resource,
                },
                Self::ResourceNotFound {
                    resource: r_resource,
                },
            ) => l_resource == r_resource,
            (
                Self::TransformRejected {
                    href: l_href,
                    reason: l_reason,
                },
                Self::TransformRejected {
                    href: r_href,
                    reason: r_reason,
                },
            ) => l_href == r_href && l_reason == r_reason,
            (Self::UnrecognizedFormat { locator: l }, Self::UnrecognizedFormat { locator: r }) => {
                l == r
            }
            (
                Self::UnresolvedReference { reference: l },
                Self::UnresolvedReference { reference: r },
            ) => l == r,
            (Self::UnsupportedLocator { locator: l }, Self::UnsupportedLocator { locator: r }) => {
                l == r
            }
            (
                Self::Utf8DecodeError { source: l_source },
                Self::Utf8DecodeError { source: r_source },
            ) => l_source == r_source,

            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}
