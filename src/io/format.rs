//! File-format registry and the input/output seam.
//!
//! A [`FormatRegistry`] maps a [`FileFormat`] to factory functions creating
//! boxed [`InputFormat`] / [`OutputFormat`] objects. The registry is an
//! explicit value: callers construct one (usually via
//! [`FormatRegistry::with_defaults`]) and pass it to `Reader`/`Writer`.
//! There is no process-wide singleton, which keeps tests deterministic and
//! registration visible at the call site.
//!
//! Dispatch through the boxed trait objects happens once per blob or
//! buffer, never per item, so the indirection cost is amortized away.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::error::Error;
use crate::io::header::Header;
use crate::io::pbf::{PbfInput, PbfOutput};
use crate::io::reader::ReaderOptions;
use crate::io::writer::WriterOptions;
use crate::io::xml::{XmlInput, XmlOutput};
use crate::memory::Buffer;

/// Supported on-disk formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// Binary PBF (the primary format).
    Pbf,
    /// OSM XML.
    Xml,
}

impl FileFormat {
    /// Detects the format from a file name.
    ///
    /// `.pbf` (including `.osm.pbf`) is PBF; `.osm` and `.xml` are XML.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "pbf" => Some(Self::Pbf),
            "osm" | "xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

/// A format's read side: yields decoded buffers in file order.
pub trait InputFormat: Send + std::fmt::Debug {
    /// The file header, decoded at open time.
    fn header(&self) -> &Header;

    /// Next buffer in file order; `None` at end of input.
    fn next_buffer(&mut self) -> Result<Option<Buffer>, Error>;
}

/// A format's write side: consumes buffers in submission order.
pub trait OutputFormat: Send + std::fmt::Debug {
    /// Writes all items of a buffer.
    fn write_buffer(&mut self, buffer: Buffer) -> Result<(), Error>;

    /// Flushes and finalizes the output. Mandatory for success.
    fn close(&mut self) -> Result<(), Error>;
}

/// Factory for a format's input side.
pub type InputFactory = fn(File, &ReaderOptions) -> Result<Box<dyn InputFormat>, Error>;

/// Factory for a format's output side.
pub type OutputFactory = fn(File, &Header, &WriterOptions) -> Result<Box<dyn OutputFormat>, Error>;

/// Registry of format factories.
#[derive(Default)]
pub struct FormatRegistry {
    inputs: HashMap<FileFormat, InputFactory>,
    outputs: HashMap<FileFormat, OutputFactory>,
}

impl FormatRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with PBF and XML registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_input(FileFormat::Pbf, PbfInput::open);
        registry.register_output(FileFormat::Pbf, PbfOutput::create);
        registry.register_input(FileFormat::Xml, XmlInput::open);
        registry.register_output(FileFormat::Xml, XmlOutput::create);
        registry
    }

    /// Registers (or replaces) an input factory.
    pub fn register_input(&mut self, format: FileFormat, factory: InputFactory) {
        self.inputs.insert(format, factory);
    }

    /// Registers (or replaces) an output factory.
    pub fn register_output(&mut self, format: FileFormat, factory: OutputFactory) {
        self.outputs.insert(format, factory);
    }

    /// Creates an input for the given format.
    pub fn create_input(
        &self,
        format: FileFormat,
        file: File,
        options: &ReaderOptions,
    ) -> Result<Box<dyn InputFormat>, Error> {
        let factory = self.inputs.get(&format).ok_or_else(|| {
            Error::unsupported_format(format!("no input factory for {format:?}"))
        })?;
        factory(file, options)
    }

    /// Creates an output for the given format.
    pub fn create_output(
        &self,
        format: FileFormat,
        file: File,
        header: &Header,
        options: &WriterOptions,
    ) -> Result<Box<dyn OutputFormat>, Error> {
        let factory = self.outputs.get(&format).ok_or_else(|| {
            Error::unsupported_format(format!("no output factory for {format:?}"))
        })?;
        factory(file, header, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection() {
        assert_eq!(
            FileFormat::from_path(Path::new("planet.osm.pbf")),
            Some(FileFormat::Pbf)
        );
        assert_eq!(
            FileFormat::from_path(Path::new("extract.osm")),
            Some(FileFormat::Xml)
        );
        assert_eq!(
            FileFormat::from_path(Path::new("extract.XML")),
            Some(FileFormat::Xml)
        );
        assert_eq!(FileFormat::from_path(Path::new("data.txt")), None);
        assert_eq!(FileFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn empty_registry_reports_unsupported() {
        let registry = FormatRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pbf");
        std::fs::write(&path, b"").unwrap();
        let file = File::open(&path).unwrap();
        let err = registry
            .create_input(FileFormat::Pbf, file, &ReaderOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }
}
