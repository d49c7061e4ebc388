//! Hand-written prost messages for the OSM PBF schema.
//!
//! These mirror `fileformat.proto` and `osmformat.proto` field-for-field
//! for everything this crate reads or writes. Writing the derive structs
//! directly (instead of generating them) keeps `protoc` out of the build;
//! the tag numbers below are the wire contract and must not change.
//!
//! All scalar fields are declared `optional` even where the schema says
//! `required`; presence is validated at the use sites, which gives better
//! error messages than a blanket decode failure.

/// Envelope header preceding every Blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobHeader {
    #[prost(string, optional, tag = "1")]
    pub r#type: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub indexdata: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "3")]
    pub datasize: Option<i32>,
}

/// Compressed envelope around one HeaderBlock or PrimitiveBlock.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Blob {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub raw: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "2")]
    pub raw_size: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub zlib_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub lzma_data: Option<Vec<u8>>,
}

/// Bounding box in nanodegrees.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderBBox {
    #[prost(sint64, optional, tag = "1")]
    pub left: Option<i64>,
    #[prost(sint64, optional, tag = "2")]
    pub right: Option<i64>,
    #[prost(sint64, optional, tag = "3")]
    pub top: Option<i64>,
    #[prost(sint64, optional, tag = "4")]
    pub bottom: Option<i64>,
}

/// File-level header carried in the first blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderBlock {
    #[prost(message, optional, tag = "1")]
    pub bbox: Option<HeaderBBox>,
    #[prost(string, repeated, tag = "4")]
    pub required_features: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub optional_features: Vec<String>,
    #[prost(string, optional, tag = "16")]
    pub writingprogram: Option<String>,
    #[prost(string, optional, tag = "17")]
    pub source: Option<String>,
}

/// Shared string table; index 0 is reserved and must be empty.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringTable {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub s: Vec<Vec<u8>>,
}

/// The unit of parallel decoding.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrimitiveBlock {
    #[prost(message, optional, tag = "1")]
    pub stringtable: Option<StringTable>,
    #[prost(message, repeated, tag = "2")]
    pub primitivegroup: Vec<PrimitiveGroup>,
    /// Nanodegrees per coordinate unit; default 100.
    #[prost(int32, optional, tag = "17")]
    pub granularity: Option<i32>,
    /// Milliseconds per timestamp unit; default 1000.
    #[prost(int32, optional, tag = "18")]
    pub date_granularity: Option<i32>,
    #[prost(int64, optional, tag = "19")]
    pub lat_offset: Option<i64>,
    #[prost(int64, optional, tag = "20")]
    pub lon_offset: Option<i64>,
}

/// A homogeneous batch of objects; exactly one member is populated.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrimitiveGroup {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<Node>,
    #[prost(message, optional, tag = "2")]
    pub dense: Option<DenseNodes>,
    #[prost(message, repeated, tag = "3")]
    pub ways: Vec<Way>,
    #[prost(message, repeated, tag = "4")]
    pub relations: Vec<Relation>,
    #[prost(message, repeated, tag = "5")]
    pub changesets: Vec<ChangeSet>,
}

/// Per-object metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Info {
    #[prost(int32, optional, tag = "1")]
    pub version: Option<i32>,
    #[prost(int64, optional, tag = "2")]
    pub timestamp: Option<i64>,
    #[prost(int64, optional, tag = "3")]
    pub changeset: Option<i64>,
    #[prost(int32, optional, tag = "4")]
    pub uid: Option<i32>,
    #[prost(uint32, optional, tag = "5")]
    pub user_sid: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub visible: Option<bool>,
}

/// Plain (non-dense) node encoding.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    #[prost(sint64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(message, optional, tag = "4")]
    pub info: Option<Info>,
    #[prost(sint64, optional, tag = "8")]
    pub lat: Option<i64>,
    #[prost(sint64, optional, tag = "9")]
    pub lon: Option<i64>,
}

/// Delta-coded metadata arrays parallel to `DenseNodes::id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DenseInfo {
    #[prost(int32, repeated, tag = "1")]
    pub version: Vec<i32>,
    #[prost(sint64, repeated, tag = "2")]
    pub timestamp: Vec<i64>,
    #[prost(sint64, repeated, tag = "3")]
    pub changeset: Vec<i64>,
    #[prost(sint32, repeated, tag = "4")]
    pub uid: Vec<i32>,
    #[prost(sint32, repeated, tag = "5")]
    pub user_sid: Vec<i32>,
    #[prost(bool, repeated, tag = "6")]
    pub visible: Vec<bool>,
}

/// Size-optimized node encoding: parallel delta arrays plus a flat
/// `0`-terminated tag index stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DenseNodes {
    #[prost(sint64, repeated, tag = "1")]
    pub id: Vec<i64>,
    #[prost(message, optional, tag = "5")]
    pub denseinfo: Option<DenseInfo>,
    #[prost(sint64, repeated, tag = "8")]
    pub lat: Vec<i64>,
    #[prost(sint64, repeated, tag = "9")]
    pub lon: Vec<i64>,
    #[prost(int32, repeated, tag = "10")]
    pub keys_vals: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Way {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(message, optional, tag = "4")]
    pub info: Option<Info>,
    /// Delta-coded node ids.
    #[prost(sint64, repeated, tag = "8")]
    pub refs: Vec<i64>,
}

/// Relation member type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MemberType {
    Node = 0,
    Way = 1,
    Relation = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Relation {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(message, optional, tag = "4")]
    pub info: Option<Info>,
    /// String-table indices of member roles.
    #[prost(int32, repeated, tag = "8")]
    pub roles_sid: Vec<i32>,
    /// Delta-coded member ids.
    #[prost(sint64, repeated, tag = "9")]
    pub memids: Vec<i64>,
    #[prost(enumeration = "MemberType", repeated, tag = "10")]
    pub types: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeSet {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn blob_header_round_trip() {
        let hdr = BlobHeader {
            r#type: Some("OSMData".to_owned()),
            indexdata: None,
            datasize: Some(1234),
        };
        let bytes = hdr.encode_to_vec();
        let back = BlobHeader::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn dense_nodes_packed_round_trip() {
        let dense = DenseNodes {
            id: vec![1, 1, 1],
            denseinfo: None,
            lat: vec![0, 10, -5],
            lon: vec![0, 20, 5],
            keys_vals: vec![1, 2, 0, 0, 3, 4, 0],
        };
        let bytes = dense.encode_to_vec();
        let back = DenseNodes::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, dense);
    }
}
