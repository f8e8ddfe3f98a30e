//! Content-addressed storage engine for build-release artifacts.
//!
//! Release directory trees are partitioned into content-defined chunks,
//! deduplicated against pack-file stores, and described by compact binary
//! release definitions that reference chunks by BLAKE3 identity. This
//! crate is the transport-free core: chunking, codecs, pack storage, and
//! release differencing. Servers and clients layer protocol on top.

pub mod bitio;
pub mod cancel;
pub mod chunker;
pub mod codec;
pub mod delta;
pub mod error;
pub mod hash;
pub mod package;
pub mod pack;
pub mod varint;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use hash::{Hash32, Hash8};
