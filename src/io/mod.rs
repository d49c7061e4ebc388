//! File I/O: format registry, reader/writer front-ends, and the formats.

pub mod format;
pub mod header;
pub mod pbf;
pub mod reader;
pub mod writer;
pub mod xml;

pub use format::{FileFormat, FormatRegistry, InputFormat, OutputFormat};
pub use header::{BoundingBox, Header};
pub use reader::{Reader, ReaderOptions};
pub use writer::{Overwrite, Writer, WriterOptions};
