//! Wire codecs shared by the release-package format and the ingest
//! protocol: transpose-compressed hash lists, tokenized string tables, and
//! bit-packed chunk-reference blocks.

pub mod refpack;
pub mod strtab;
pub mod transpose;
pub mod wire;
