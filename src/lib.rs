//! High-throughput reader and writer for OpenStreetMap PBF data.
//!
//! PBF files are a serial stream of length-prefixed, compressed blocks;
//! parsing is CPU-bound on decompression plus varint decoding. This crate
//! turns that serial stream into an in-order sequence of in-memory object
//! buffers while spreading the block work over a pool of threads, and
//! provides the symmetric path back to a valid PBF stream.
//!
//! Read flow: a dedicated reader thread frames blobs and tags each with a
//! dense sequence number, pool workers decode blocks into [`Buffer`]s, and
//! an ordered queue releases buffers to the consumer strictly in file
//! order. The write flow mirrors it: buffers are encoded in parallel and a
//! single writer thread compresses and frames them in submission order.
//!
//! ```no_run
//! use osmflow::{apply, Handler, Node, Reader};
//!
//! struct Count(u64);
//!
//! impl Handler for Count {
//!     fn node(&mut self, _node: &Node<'_>) {
//!         self.0 += 1;
//!     }
//! }
//!
//! # fn main() -> Result<(), osmflow::Error> {
//! let mut reader = Reader::open("planet.osm.pbf")?;
//! let mut count = Count(0);
//! apply(&mut reader, &mut count)?;
//! println!("{} nodes", count.0);
//! # Ok(())
//! # }
//! ```
//!
//! XML-based OSM files go through the same pipeline (serially) using the
//! same buffer model; formats are looked up in an explicit
//! [`FormatRegistry`] passed to [`Reader`]/[`Writer`].

pub mod error;
pub mod io;
pub mod memory;
pub mod osm;
pub mod thread;

pub use error::{BufferIsFull, Error};
pub use io::{
    BoundingBox, FileFormat, FormatRegistry, Header, InputFormat, OutputFormat, Overwrite,
    Reader, ReaderOptions, Writer, WriterOptions,
};
pub use memory::{
    Buffer, Changeset, ChangesetBuilder, GrowthPolicy, Item, ItemRef, Member, Node, NodeBuilder,
    OsmObject, Relation, RelationBuilder, Tag, Way, WayBuilder, WayNode,
};
pub use osm::{apply, Handler, ItemKind, Location, ReadTypes};
