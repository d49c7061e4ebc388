//! User-facing reader over any registered format.

use std::path::Path;

use crate::error::Error;
use crate::io::format::{FileFormat, FormatRegistry, InputFormat};
use crate::io::header::Header;
use crate::memory::{Buffer, DEFAULT_CAPACITY};
use crate::osm::types::ReadTypes;

/// Options controlling a [`Reader`].
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Object types to materialize; excluded groups are skipped.
    pub read_types: ReadTypes,
    /// Decode worker threads. Zero decodes on the reader thread itself,
    /// which is deterministic and right for tests and small inputs.
    pub num_threads: usize,
    /// Capacity of each decoded buffer.
    pub buffer_capacity: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            read_types: ReadTypes::ALL,
            num_threads: 2,
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ReaderOptions {
    /// Restricts the object types to read.
    #[must_use]
    pub fn read_types(mut self, read_types: ReadTypes) -> Self {
        self.read_types = read_types;
        self
    }

    /// Sets the decode worker count.
    #[must_use]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Uses one decode worker per available core.
    #[must_use]
    pub fn all_cores(mut self) -> Self {
        self.num_threads = num_cpus::get().max(1);
        self
    }
}

/// Reads OSM files, yielding decoded buffers in file order.
pub struct Reader {
    input: Box<dyn InputFormat>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").finish()
    }
}

impl Reader {
    /// Opens a file with default options and the default registry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::with_options(
            path,
            &FormatRegistry::with_defaults(),
            ReaderOptions::default(),
        )
    }

    /// Opens a file with explicit registry and options.
    ///
    /// The format is detected from the file extension; an unknown
    /// extension or a format with no registered factory fails with
    /// unsupported-format.
    pub fn with_options(
        path: impl AsRef<Path>,
        registry: &FormatRegistry,
        options: ReaderOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path).ok_or_else(|| {
            Error::unsupported_format(format!("unrecognized extension: {}", path.display()))
        })?;
        let file = std::fs::File::open(path)?;
        let input = registry.create_input(format, file, &options)?;
        Ok(Self { input })
    }

    /// The file header.
    #[must_use]
    pub fn header(&self) -> &Header {
        self.input.header()
    }

    /// Returns the next buffer, blocking until one is ready.
    ///
    /// `None` marks a clean end of input. After an error, the stream is
    /// abandoned and further calls fail.
    pub fn next_buffer(&mut self) -> Result<Option<Buffer>, Error> {
        self.input.next_buffer()
    }
}
