//! OSM value types and the consumer-facing handler interface.

pub mod handler;
pub mod types;

pub use handler::{apply, Handler};
pub use types::{
    timestamp_from_iso, timestamp_to_iso, ItemKind, Location, ReadTypes, COORDINATE_PRECISION,
    LONLAT_RESOLUTION, RESOLUTION_DIVISOR, UNDEFINED_COORDINATE,
};
