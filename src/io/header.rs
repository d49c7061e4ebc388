//! File-level header data shared by all formats.

use crate::osm::types::Location;

/// Bounding box in 10^7-scaled coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BoundingBox {
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
}

impl BoundingBox {
    /// True iff `location` lies inside the box (inclusive edges).
    #[must_use]
    pub fn contains(&self, location: Location) -> bool {
        location.is_defined()
            && (self.left..=self.right).contains(&location.lon())
            && (self.bottom..=self.top).contains(&location.lat())
    }
}

/// Metadata carried in a file's header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Bounding box of the data, if declared.
    pub bbox: Option<BoundingBox>,
    /// Program that wrote the file.
    pub generator: Option<String>,
    /// Data source, if declared.
    pub source: Option<String>,
    /// True when the file may contain multiple versions of an object
    /// (history files; the `HistoricalInformation` feature).
    pub multiple_object_versions: bool,
}
