//! PBF format: framing, block codec, and the parallel pipelines.

pub mod blob;
pub mod decode;
pub mod encode;
pub mod input;
pub mod output;
pub mod proto;

pub use blob::{
    decode_blob, BlobReader, BlobWriter, MAX_BLOB_HEADER_SIZE, MAX_UNCOMPRESSED_BLOB_SIZE,
    OSM_DATA_TYPE, OSM_HEADER_TYPE,
};
pub use decode::BlockDecoder;
pub use encode::{BlockEncoder, MAX_GROUP_ITEMS};
pub use input::PbfInput;
pub use output::{PbfOutput, OUTPUT_QUEUE_SIZE};
