//! User-facing writer over any registered format.
//!
//! Whole buffers pass straight through to the output format. Single items
//! accumulate in an internal staging buffer that is flushed when full:
//! the buffer-is-full signal is caught here, the staged items are
//! submitted, and the append is retried on a fresh buffer.
//!
//! A writer is `okay` until either `close()` succeeds (`closed`) or any
//! failure occurs (`error`); after a failure every operation fails fast,
//! and closing an errored writer is refused. Dropping a writer closes it
//! and swallows any failure, so callers who care about durability must
//! call [`Writer::close`] themselves.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BufferIsFull, Error};
use crate::io::format::{FileFormat, FormatRegistry, OutputFormat};
use crate::io::header::Header;
use crate::memory::{Buffer, GrowthPolicy, ItemRef, DEFAULT_CAPACITY};

/// Overwrite policy for output files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overwrite {
    /// Fail with file-exists if the output path is already present.
    No,
    /// Replace an existing file.
    Allow,
}

/// Options controlling a [`Writer`].
#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Encode worker threads. Zero encodes on the caller's thread.
    pub num_threads: usize,
    /// Overwrite policy; default refuses to clobber existing files.
    pub overwrite: Overwrite,
    /// Compress blobs with zlib (PBF only); on by default.
    pub compress: bool,
    /// Capacity of the staging buffer used by [`Writer::write_item`].
    pub buffer_capacity: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            num_threads: 2,
            overwrite: Overwrite::No,
            compress: true,
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl WriterOptions {
    /// Sets the encode worker count.
    #[must_use]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Sets the overwrite policy.
    #[must_use]
    pub fn overwrite(mut self, overwrite: Overwrite) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Enables or disables blob compression.
    #[must_use]
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Okay,
    Error,
    Closed,
}

/// Writes OSM files from buffers or single items.
pub struct Writer {
    output: Box<dyn OutputFormat>,
    staging: Option<Buffer>,
    buffer_capacity: usize,
    status: Status,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("status", &self.status)
            .finish()
    }
}

impl Writer {
    /// Creates a file with default options and the default registry.
    pub fn create(path: impl AsRef<Path>, header: &Header) -> Result<Self, Error> {
        Self::with_options(
            path,
            &FormatRegistry::with_defaults(),
            header,
            WriterOptions::default(),
        )
    }

    /// Creates a file with explicit registry and options.
    pub fn with_options(
        path: impl AsRef<Path>,
        registry: &FormatRegistry,
        header: &Header,
        options: WriterOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path).ok_or_else(|| {
            Error::unsupported_format(format!("unrecognized extension: {}", path.display()))
        })?;

        let mut open_options = std::fs::OpenOptions::new();
        open_options.write(true);
        match options.overwrite {
            Overwrite::No => open_options.create_new(true),
            Overwrite::Allow => open_options.create(true).truncate(true),
        };
        let file = open_options.open(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                Error::FileExists {
                    path: PathBuf::from(path),
                }
            } else {
                Error::Io(err)
            }
        })?;

        debug!(path = %path.display(), ?format, "created output file");
        let output = registry.create_output(format, file, header, &options)?;
        Ok(Self {
            output,
            staging: None,
            buffer_capacity: options.buffer_capacity,
            status: Status::Okay,
        })
    }

    fn guard(&self) -> Result<(), Error> {
        match self.status {
            Status::Okay => Ok(()),
            Status::Error => Err(Error::WriterState {
                detail: "writer is in the error state",
            }),
            Status::Closed => Err(Error::WriterState {
                detail: "writer is closed",
            }),
        }
    }

    fn submit(&mut self, buffer: Buffer) -> Result<(), Error> {
        if let Err(err) = self.output.write_buffer(buffer) {
            self.status = Status::Error;
            return Err(err);
        }
        Ok(())
    }

    /// Flushes the staging buffer if it holds any committed items.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.guard()?;
        if let Some(staging) = self.staging.take() {
            if !staging.is_empty() {
                self.submit(staging)?;
            }
        }
        Ok(())
    }

    /// Writes a whole buffer, flushing staged items first so that output
    /// order matches call order.
    pub fn write(&mut self, buffer: Buffer) -> Result<(), Error> {
        self.guard()?;
        self.flush()?;
        if buffer.is_empty() {
            return Ok(());
        }
        self.submit(buffer)
    }

    /// Appends one item to the staging buffer, flushing and retrying when
    /// the buffer is full.
    pub fn write_item(&mut self, item: ItemRef<'_>) -> Result<(), Error> {
        self.guard()?;
        if self.staging.is_none() {
            self.staging = Some(Buffer::with_capacity(
                self.buffer_capacity,
                GrowthPolicy::Fixed,
            ));
        }

        let full = {
            let staging = self.staging.as_mut().map_or(Err(BufferIsFull), |buf| {
                buf.append_item(item.as_bytes())
            });
            staging.is_err()
        };
        if full {
            self.flush()?;
            let staging = self
                .staging
                .get_or_insert_with(|| {
                    Buffer::with_capacity(self.buffer_capacity, GrowthPolicy::Fixed)
                });
            if staging.append_item(item.as_bytes()).is_err() {
                // A single item larger than the staging buffer.
                self.status = Status::Error;
                return Err(Error::BufferFull);
            }
        }
        if let Some(staging) = self.staging.as_mut() {
            staging.commit();
        }
        Ok(())
    }

    /// Flushes everything and finalizes the file.
    ///
    /// Mandatory for success: only a clean return from `close()` means the
    /// data reached the operating system. Closing an errored writer fails;
    /// closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.status {
            Status::Closed => return Ok(()),
            Status::Error => {
                return Err(Error::WriterState {
                    detail: "cannot close a writer in the error state",
                })
            }
            Status::Okay => {}
        }
        self.flush()?;
        let result = self.output.close();
        match result {
            Ok(()) => {
                self.status = Status::Closed;
                Ok(())
            }
            Err(err) => {
                self.status = Status::Error;
                Err(err)
            }
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.status == Status::Okay {
            // Destructor fallback; failures are deliberately swallowed.
            let _ = self.close();
        }
    }
}
