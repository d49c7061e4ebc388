//! Parallel PBF write pipeline.
//!
//! # Architecture
//!
//! ```text
//!  write_buffer() ──▶ worker pool ──▶ sorted queue ──▶ writer thread ──▶ file
//!  (assign seq)      (encode blocks) (reorder by seq) (compress + frame)
//! ```
//!
//! Each submitted buffer becomes one encode task producing the buffer's
//! PrimitiveBlock payloads. Encoded payloads enter an ordered queue bounded
//! at [`OUTPUT_QUEUE_SIZE`]; a single writer thread pops them in submission
//! order, runs the compressor, and emits framed blobs, so output order
//! always matches submission order.
//!
//! The header blob is written synchronously before the writer thread
//! starts. `close` declares the end of the sequence, joins the writer
//! thread, and surfaces any failure; a failure latched by the writer
//! thread is also surfaced by the next `write_buffer` call.

use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prost::Message;
use tracing::{debug, trace};

use super::blob::{BlobWriter, OSM_DATA_TYPE, OSM_HEADER_TYPE};
use super::encode::BlockEncoder;
use super::proto;
use crate::error::Error;
use crate::io::format::OutputFormat;
use crate::io::header::Header;
use crate::io::writer::WriterOptions;
use crate::memory::Buffer;
use crate::osm::types::RESOLUTION_DIVISOR;
use crate::thread::{SortedQueue, ThreadPool};

/// Bound on the ordered queue of encoded-but-unwritten payloads.
pub const OUTPUT_QUEUE_SIZE: usize = 20;

const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(10);

type EncodedQueue = SortedQueue<Result<Vec<Vec<u8>>, Error>>;

/// Encodes the OSMHeader block for this file.
pub(crate) fn encode_header_block(header: &Header) -> Vec<u8> {
    let mut required = vec!["OsmSchema-V0.6".to_owned(), "DenseNodes".to_owned()];
    if header.multiple_object_versions {
        required.push("HistoricalInformation".to_owned());
    }
    let bbox = header.bbox.as_ref().map(|b| proto::HeaderBBox {
        left: Some(i64::from(b.left) * RESOLUTION_DIVISOR),
        right: Some(i64::from(b.right) * RESOLUTION_DIVISOR),
        top: Some(i64::from(b.top) * RESOLUTION_DIVISOR),
        bottom: Some(i64::from(b.bottom) * RESOLUTION_DIVISOR),
    });
    proto::HeaderBlock {
        bbox,
        required_features: required,
        optional_features: vec![],
        writingprogram: header.generator.clone(),
        source: header.source.clone(),
    }
    .encode_to_vec()
}

/// Parallel PBF output pipeline.
pub struct PbfOutput {
    pool: Option<Arc<ThreadPool>>,
    queue: Arc<EncodedQueue>,
    writer: Option<thread::JoinHandle<Result<(), Error>>>,
    failed: Arc<AtomicBool>,
    next_seq: u64,
    closed: bool,
}

impl std::fmt::Debug for PbfOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbfOutput")
            .field("next_seq", &self.next_seq)
            .field("closed", &self.closed)
            .finish()
    }
}

impl PbfOutput {
    /// Creates the output pipeline: writes the header blob synchronously,
    /// then spawns the writer thread.
    pub fn create(
        file: File,
        header: &Header,
        options: &WriterOptions,
    ) -> Result<Box<dyn OutputFormat>, Error> {
        let mut blob_writer = BlobWriter::new(BufWriter::new(file));
        blob_writer.write_blob(OSM_HEADER_TYPE, &encode_header_block(header), options.compress)?;
        debug!(generator = ?header.generator, "wrote file header");

        let queue = Arc::new(EncodedQueue::new());
        let failed = Arc::new(AtomicBool::new(false));
        let compress = options.compress;

        let writer = {
            let queue = Arc::clone(&queue);
            let failed = Arc::clone(&failed);
            thread::Builder::new()
                .name("osmflow-writer".to_owned())
                .spawn(move || {
                    let result = run_writer(blob_writer, &queue, compress);
                    if let Err(err) = &result {
                        failed.store(true, Ordering::SeqCst);
                        debug!(%err, "writer thread failed");
                    }
                    result
                })
                .map_err(Error::Io)?
        };

        Ok(Box::new(Self {
            pool: Some(Arc::new(ThreadPool::new(options.num_threads))),
            queue,
            writer: Some(writer),
            failed,
            next_seq: 0,
            closed: false,
        }))
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Body of the dedicated writer thread.
fn run_writer(
    mut blob_writer: BlobWriter<BufWriter<File>>,
    queue: &EncodedQueue,
    compress: bool,
) -> Result<(), Error> {
    while let Some(slot) = queue.wait_and_pop() {
        let payloads = slot?;
        for payload in payloads {
            trace!(bytes = payload.len(), "write data blob");
            blob_writer.write_blob(OSM_DATA_TYPE, &payload, compress)?;
        }
    }
    blob_writer.flush()
}

impl OutputFormat for PbfOutput {
    fn write_buffer(&mut self, buffer: Buffer) -> Result<(), Error> {
        if self.closed {
            return Err(Error::WriterState {
                detail: "write on closed output",
            });
        }
        if self.failed() {
            // The precise failure is reported by close(); fail fast here.
            return Err(Error::WriterState {
                detail: "writer thread failed",
            });
        }

        let n = self.next_seq;
        self.next_seq += 1;
        let task_queue = Arc::clone(&self.queue);
        let encoder = BlockEncoder::new();
        let pool = self.pool.as_ref().ok_or(Error::WriterState {
            detail: "write on closed output",
        })?;
        pool.submit(Box::new(move || {
            task_queue.push(encoder.encode_buffer(&buffer), n);
        }));

        // Keep the encoded backlog bounded; give up waiting if the writer
        // thread has already failed.
        while self.queue.len() >= OUTPUT_QUEUE_SIZE && !self.failed() {
            thread::sleep(BACKPRESSURE_SLEEP);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.queue.finish(self.next_seq);
        // Dropping the pool joins the workers; all pending encode tasks
        // publish their slots first, so the writer thread can drain.
        self.pool.take();

        let mut result = Ok(());
        if let Some(handle) = self.writer.take() {
            result = match handle.join() {
                Ok(res) => res,
                Err(_) => Err(Error::WriterState {
                    detail: "writer thread panicked",
                }),
            };
        }
        result
    }
}

impl Drop for PbfOutput {
    fn drop(&mut self) {
        // Mandatory close() is the caller's job; this fallback swallows
        // any failure.
        let _ = self.close();
    }
}
