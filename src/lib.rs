//! Publication library
//!
//! A Rust library that turns packaged digital publications into one normalized
//! publication model.
//!
//! The library recognizes EPUB 2 and EPUB 3 books, DAISY talking books and comic
//! archives, packed as ZIP files or exploded into directories. Whatever the dialect, the
//! result is a [`Publication`]: metadata, a reading order, resources, navigation and
//! synchronized audio overlays. Reads of individual resources go through a pipeline of
//! content transforms that undoes font obfuscation and, with a caller-provided
//! decryptor, LCP encryption.
//!
//! ## Features
//!
//! - Classify a file path, directory or URL into a dialect and an access mode.
//! - Assemble metadata, reading order, resources and navigation from the package descriptors.
//! - Load EPUB media overlays on demand and DAISY synchronization documents eagerly.
//! - Read resources in whole or by byte range, with transforms applied transparently.
//! - Serialize the publication model as JSON.
//!
//! ## Quick Start
//!
//! ### Parse a publication
//!
//! ```rust, ignore
//! # use lib_publication::{parser::parse, transform::TransformPipeline};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Classify, open and assemble
//! let mut publication = parse("path/to/book.epub")?;
//!
//! // Get metadata
//! println!("Title: {:?}", publication.metadata.title);
//! println!("Chapters: {}", publication.reading_order.len());
//!
//! // Read content
//! let pipeline = TransformPipeline::with_defaults();
//! let first = publication.reading_order[0].clone();
//! let _content = publication.open_resource(&first, None, &pipeline)?;
//!
//! // Load synchronized audio
//! publication.load_media_overlays()?;
//!
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `comic` (default): Enable `lib_publication::comic`, the assembler of comic archives.
//!   Pages without an extension are sniffed with the `infer` crate.

pub mod classify;
#[cfg(feature = "comic")]
pub mod comic;
pub mod container;
pub mod daisy;
pub mod epub;
pub mod error;
pub mod lcp;
pub mod media_overlay;
pub mod navigation;
pub mod package;
pub mod parser;
pub mod publication;
pub mod resources;
pub mod transform;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::PublicationError;
pub use parser::{ParseOptions, PublicationParser, parse};
pub use publication::Publication;
pub use utils::DecodeBytes;
