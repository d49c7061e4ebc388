//! Parallel PBF read pipeline.
//!
//! # Architecture
//!
//! ```text
//!  file ──▶ reader thread ──▶ worker pool ──▶ sorted queue ──▶ next_buffer()
//!          (serial framing)  (decode blobs)  (reorder by seq)  (consumer pull)
//! ```
//!
//! The reader thread walks the framed stream, tags every data blob with a
//! dense sequence number, and submits a decode task per blob. Workers
//! publish `Result<Buffer, _>` into the sorted queue at their sequence
//! slot, so the consumer sees buffers in exact file order regardless of
//! worker scheduling, and a worker failure surfaces in-order as well.
//!
//! Backpressure: the reader sleeps while the pool's queue depth reaches
//! `num_threads * 4` or the sorted-queue window exceeds
//! `10 + num_threads * 10`, bounding memory without any further tuning.
//!
//! The file header blob is decoded synchronously during `open`, before any
//! thread is spawned; an unrecognized required feature is fatal there.

use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prost::Message;
use tracing::{debug, trace};

use super::blob::{decode_blob, BlobReader, OSM_DATA_TYPE, OSM_HEADER_TYPE};
use super::decode::BlockDecoder;
use super::proto;
use crate::error::Error;
use crate::io::format::InputFormat;
use crate::io::header::{BoundingBox, Header};
use crate::io::reader::ReaderOptions;
use crate::memory::Buffer;
use crate::osm::types::RESOLUTION_DIVISOR;
use crate::thread::{SortedQueue, ThreadPool};

/// Backpressure poll interval.
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(10);

/// Required features this reader understands.
const SUPPORTED_FEATURES: [&str; 3] = ["OsmSchema-V0.6", "DenseNodes", "HistoricalInformation"];

type ResultQueue = SortedQueue<Result<Buffer, Error>>;

/// Decodes the OSMHeader block and validates required features.
pub(crate) fn decode_header_block(data: &[u8]) -> Result<Header, Error> {
    let block = proto::HeaderBlock::decode(data)?;

    let mut header = Header::default();
    for feature in &block.required_features {
        if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
            return Err(Error::UnsupportedFeature {
                feature: feature.clone(),
            });
        }
        if feature == "HistoricalInformation" {
            header.multiple_object_versions = true;
        }
    }
    header.generator = block.writingprogram;
    header.source = block.source;
    if let Some(bbox) = block.bbox {
        header.bbox = Some(BoundingBox {
            left: (bbox.left.unwrap_or(0) / RESOLUTION_DIVISOR) as i32,
            right: (bbox.right.unwrap_or(0) / RESOLUTION_DIVISOR) as i32,
            top: (bbox.top.unwrap_or(0) / RESOLUTION_DIVISOR) as i32,
            bottom: (bbox.bottom.unwrap_or(0) / RESOLUTION_DIVISOR) as i32,
        });
    }
    Ok(header)
}

/// Parallel PBF input pipeline.
pub struct PbfInput {
    header: Header,
    queue: Arc<ResultQueue>,
    done: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
    pool: Option<Arc<ThreadPool>>,
    failed: bool,
}

impl std::fmt::Debug for PbfInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbfInput")
            .field("failed", &self.failed)
            .finish()
    }
}

impl PbfInput {
    /// Opens a PBF stream: decodes the header synchronously, then spawns
    /// the reader thread for the data blobs.
    pub fn open(file: File, options: &ReaderOptions) -> Result<Box<dyn InputFormat>, Error> {
        let mut blob_reader = BlobReader::new(BufReader::new(file));

        let header_blob = blob_reader.read_blob(OSM_HEADER_TYPE)?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file ends before the OSMHeader blob",
            ))
        })?;
        let header = decode_header_block(&decode_blob(&header_blob)?)?;
        debug!(generator = ?header.generator, "decoded file header");

        let queue = Arc::new(ResultQueue::new());
        let done = Arc::new(AtomicBool::new(false));

        if options.read_types.is_nothing() {
            queue.finish(0);
            return Ok(Box::new(Self {
                header,
                queue,
                done,
                reader: None,
                pool: None,
                failed: false,
            }));
        }

        let pool = Arc::new(ThreadPool::new(options.num_threads));
        let decoder = BlockDecoder::new(options.read_types, options.buffer_capacity);

        let reader = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            let pool = Arc::clone(&pool);
            let num_threads = options.num_threads;
            thread::Builder::new()
                .name("osmflow-reader".to_owned())
                .spawn(move || {
                    run_reader(blob_reader, pool, queue, done, decoder, num_threads);
                })
                .map_err(Error::Io)?
        };

        Ok(Box::new(Self {
            header,
            queue,
            done,
            reader: Some(reader),
            pool: Some(pool),
            failed: false,
        }))
    }
}

/// Body of the dedicated reader thread.
fn run_reader(
    mut blob_reader: BlobReader<BufReader<File>>,
    pool: Arc<ThreadPool>,
    queue: Arc<ResultQueue>,
    done: Arc<AtomicBool>,
    decoder: BlockDecoder,
    num_threads: usize,
) {
    let max_work_depth = num_threads * 4;
    let max_queue_window = 10 + num_threads * 10;
    let mut seq = 0u64;

    while !done.load(Ordering::SeqCst) {
        match blob_reader.read_blob(OSM_DATA_TYPE) {
            Ok(Some(blob)) => {
                let n = seq;
                seq += 1;
                trace!(seq = n, bytes = blob.len(), "dispatch decode task");

                let task_queue = Arc::clone(&queue);
                pool.submit(Box::new(move || {
                    // The task owns its raw compressed bytes; the result or
                    // the failure rides the queue slot to the consumer.
                    let result =
                        decode_blob(&blob).and_then(|raw| decoder.decode_block(&raw));
                    task_queue.push(result, n);
                }));

                // Throttle while the pool backlog or the result window is
                // too deep. Both bounds scale with the worker count.
                while !done.load(Ordering::SeqCst)
                    && ((num_threads > 0 && pool.depth() >= max_work_depth)
                        || queue.len() > max_queue_window)
                {
                    thread::sleep(BACKPRESSURE_SLEEP);
                }
            }
            Ok(None) => break,
            Err(err) => {
                // The failure takes the next sequence slot so the consumer
                // receives every preceding buffer first, then the error.
                let n = seq;
                seq += 1;
                queue.push(Err(err), n);
                break;
            }
        }
    }

    done.store(true, Ordering::SeqCst);
    queue.finish(seq);
}

impl InputFormat for PbfInput {
    fn header(&self) -> &Header {
        &self.header
    }

    fn next_buffer(&mut self) -> Result<Option<Buffer>, Error> {
        if self.failed {
            return Err(Error::format("stream abandoned after a previous error"));
        }
        match self.queue.wait_and_pop() {
            Some(Ok(buffer)) => Ok(Some(buffer)),
            Some(Err(err)) => {
                self.failed = true;
                self.done.store(true, Ordering::SeqCst);
                Err(err)
            }
            None => Ok(None),
        }
    }
}

impl Drop for PbfInput {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        // Dropping the pool last joins the workers; any still-running task
        // publishes into the queue, which nobody reads anymore.
        self.pool.take();
    }
}
