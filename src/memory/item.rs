//! Item layout and zero-copy views over buffer bytes.
//!
//! Every item starts 8-byte aligned and begins with an 8-byte header. All
//! integers are little-endian. Offsets are relative to the item start.
//!
//! # Item layout
//! Header (all items):
//! - `size` (u32): total bytes including header, children, and padding
//! - `kind` (u8): [`ItemKind`] tag
//! - `flags` (u8): bit 0 = visible
//! - reserved (u16)
//!
//! OSM objects (node/way/relation/changeset) continue with:
//! - `id` (i64), `changeset` (i64), `timestamp` (i64, ms),
//!   `version` (u32), `uid` (u32), `user_len` (u32)
//! - nodes only: `lon` (i32), `lat` (i32)
//! - user-name bytes (`user_len` of them), then padding to 8
//! - child items, each 8-byte aligned, counted inside the parent's `size`
//!
//! Child list payloads:
//! - tag list: `payload_len` (u32), then repeated
//!   `(klen: u16, vlen: u16, key, value)`
//! - node-ref list: `count` (u32), then `count` entries of
//!   `(ref: i64, lon: i32, lat: i32)`
//! - member list: `payload_len` (u32), then repeated
//!   `(kind: u8, role_len: u16, ref: i64, role)`
//!
//! Views never copy; they parse fields at fixed offsets from a borrowed
//! slice, so they are valid only while the owning [`Buffer`](super::Buffer)
//! is alive.

use crate::osm::types::{ItemKind, Location};

/// Item header size in bytes.
pub(crate) const HEADER_SIZE: usize = 8;

pub(crate) const OFF_SIZE: usize = 0;
pub(crate) const OFF_KIND: usize = 4;
pub(crate) const OFF_FLAGS: usize = 5;

pub(crate) const OFF_ID: usize = 8;
pub(crate) const OFF_CHANGESET: usize = 16;
pub(crate) const OFF_TIMESTAMP: usize = 24;
pub(crate) const OFF_VERSION: usize = 32;
pub(crate) const OFF_UID: usize = 36;
pub(crate) const OFF_USER_LEN: usize = 40;

/// End of the fixed part for ways, relations, and changesets.
pub(crate) const OBJECT_FIXED_END: usize = 44;
pub(crate) const OFF_LON: usize = 44;
pub(crate) const OFF_LAT: usize = 48;
/// End of the fixed part for nodes.
pub(crate) const NODE_FIXED_END: usize = 52;

/// Offset of a list item's length/count word.
pub(crate) const LIST_LEN_OFF: usize = 8;
/// Offset of a list item's first payload byte.
pub(crate) const LIST_PAYLOAD_OFF: usize = 12;

/// Bytes per node-ref list entry.
pub(crate) const NODE_REF_ENTRY_SIZE: usize = 16;

pub(crate) const FLAG_VISIBLE: u8 = 1 << 0;

#[inline]
pub(crate) fn align_up(n: usize) -> usize {
    (n + 7) & !7
}

#[inline]
pub(crate) fn get_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

#[inline]
pub(crate) fn get_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[inline]
pub(crate) fn get_i32(b: &[u8], off: usize) -> i32 {
    get_u32(b, off) as i32
}

#[inline]
pub(crate) fn get_i64(b: &[u8], off: usize) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    i64::from_le_bytes(a)
}

/// Raw view of one item (header plus payload).
#[derive(Clone, Copy, Debug)]
pub struct ItemRef<'a> {
    bytes: &'a [u8],
}

impl<'a> ItemRef<'a> {
    /// Wraps a finalized item slice.
    ///
    /// # Panics
    /// Panics if the slice is shorter than the header or disagrees with its
    /// own size field.
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        assert!(bytes.len() >= HEADER_SIZE, "item slice too short");
        assert!(
            get_u32(bytes, OFF_SIZE) as usize == bytes.len(),
            "item size field mismatch"
        );
        Self { bytes }
    }

    /// Total item size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The item's kind tag, or `None` for an unknown tag.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> Option<ItemKind> {
        ItemKind::from_u8(self.bytes[OFF_KIND])
    }

    /// Raw bytes of the whole item, suitable for `Buffer::append_item`.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Decodes into a typed object view, or `None` for child-list items.
    #[must_use]
    pub fn decode(&self) -> Option<Item<'a>> {
        match self.kind()? {
            ItemKind::Node => Some(Item::Node(Node { bytes: self.bytes })),
            ItemKind::Way => Some(Item::Way(Way { bytes: self.bytes })),
            ItemKind::Relation => Some(Item::Relation(Relation { bytes: self.bytes })),
            ItemKind::Changeset => Some(Item::Changeset(Changeset { bytes: self.bytes })),
            _ => None,
        }
    }
}

/// A typed top-level object view.
#[derive(Clone, Copy, Debug)]
pub enum Item<'a> {
    Node(Node<'a>),
    Way(Way<'a>),
    Relation(Relation<'a>),
    Changeset(Changeset<'a>),
}

impl Item<'_> {
    /// The object's kind.
    #[must_use]
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Node(_) => ItemKind::Node,
            Self::Way(_) => ItemKind::Way,
            Self::Relation(_) => ItemKind::Relation,
            Self::Changeset(_) => ItemKind::Changeset,
        }
    }

    /// The object's id.
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::Node(o) => o.id(),
            Self::Way(o) => o.id(),
            Self::Relation(o) => o.id(),
            Self::Changeset(o) => o.id(),
        }
    }
}

/// Common accessors for OSM object views.
pub trait OsmObject {
    /// Raw bytes of the underlying item.
    #[doc(hidden)]
    fn item_bytes(&self) -> &[u8];

    /// End of the fixed field area for this object kind.
    #[doc(hidden)]
    fn fixed_end(&self) -> usize {
        OBJECT_FIXED_END
    }

    /// Object id.
    fn id(&self) -> i64 {
        get_i64(self.item_bytes(), OFF_ID)
    }

    /// Object version.
    fn version(&self) -> u32 {
        get_u32(self.item_bytes(), OFF_VERSION)
    }

    /// Id of the user who last touched the object.
    fn uid(&self) -> u32 {
        get_u32(self.item_bytes(), OFF_UID)
    }

    /// Changeset the object was last changed in.
    fn changeset_id(&self) -> i64 {
        get_i64(self.item_bytes(), OFF_CHANGESET)
    }

    /// Timestamp of the last change, in epoch milliseconds.
    fn timestamp_ms(&self) -> i64 {
        get_i64(self.item_bytes(), OFF_TIMESTAMP)
    }

    /// Visibility flag; deleted objects in history files are invisible.
    fn visible(&self) -> bool {
        self.item_bytes()[OFF_FLAGS] & FLAG_VISIBLE != 0
    }

    /// User name bytes (not guaranteed UTF-8).
    fn user(&self) -> &[u8] {
        let b = self.item_bytes();
        let len = get_u32(b, OFF_USER_LEN) as usize;
        let start = self.fixed_end();
        &b[start..start + len]
    }

    /// Iterates this object's child items.
    #[doc(hidden)]
    fn children(&self) -> ItemIter<'_> {
        let b = self.item_bytes();
        let user_len = get_u32(b, OFF_USER_LEN) as usize;
        let start = align_up(self.fixed_end() + user_len);
        ItemIter::new(&b[start.min(b.len())..])
    }

    /// Iterates the object's tags.
    fn tags(&self) -> TagIter<'_> {
        for child in self.children() {
            if child.kind() == Some(ItemKind::TagList) {
                let b = child.as_bytes();
                let len = get_u32(b, LIST_LEN_OFF) as usize;
                return TagIter {
                    bytes: &b[LIST_PAYLOAD_OFF..LIST_PAYLOAD_OFF + len],
                };
            }
        }
        TagIter { bytes: &[] }
    }
}

macro_rules! object_view {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug)]
        pub struct $name<'a> {
            bytes: &'a [u8],
        }

        impl OsmObject for $name<'_> {
            fn item_bytes(&self) -> &[u8] {
                self.bytes
            }
        }
    };
}

object_view! {
    /// View of a way item.
    Way
}
object_view! {
    /// View of a relation item.
    Relation
}
object_view! {
    /// View of a changeset item.
    Changeset
}

/// View of a node item.
#[derive(Clone, Copy, Debug)]
pub struct Node<'a> {
    bytes: &'a [u8],
}

// Nodes carry two extra fixed coordinate fields, so their user string and
// children start later than for the other object kinds.
impl OsmObject for Node<'_> {
    fn item_bytes(&self) -> &[u8] {
        self.bytes
    }

    fn fixed_end(&self) -> usize {
        NODE_FIXED_END
    }
}

impl Node<'_> {
    /// The node's location; undefined for invisible nodes.
    #[must_use]
    pub fn location(&self) -> Location {
        Location::new(get_i32(self.bytes, OFF_LON), get_i32(self.bytes, OFF_LAT))
    }
}

impl Way<'_> {
    /// Iterates the way's node references.
    #[must_use]
    pub fn nodes(&self) -> WayNodeIter<'_> {
        for child in self.children() {
            if child.kind() == Some(ItemKind::NodeRefList) {
                let b = child.as_bytes();
                let count = get_u32(b, LIST_LEN_OFF) as usize;
                let end = LIST_PAYLOAD_OFF + count * NODE_REF_ENTRY_SIZE;
                return WayNodeIter {
                    bytes: &b[LIST_PAYLOAD_OFF..end],
                };
            }
        }
        WayNodeIter { bytes: &[] }
    }
}

impl Relation<'_> {
    /// Iterates the relation's members.
    #[must_use]
    pub fn members(&self) -> MemberIter<'_> {
        for child in self.children() {
            if child.kind() == Some(ItemKind::MemberList) {
                let b = child.as_bytes();
                let len = get_u32(b, LIST_LEN_OFF) as usize;
                return MemberIter {
                    bytes: &b[LIST_PAYLOAD_OFF..LIST_PAYLOAD_OFF + len],
                };
            }
        }
        MemberIter { bytes: &[] }
    }
}

/// One key/value tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Iterator over a tag list payload.
#[derive(Clone, Debug)]
pub struct TagIter<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for TagIter<'a> {
    type Item = Tag<'a>;

    fn next(&mut self) -> Option<Tag<'a>> {
        if self.bytes.is_empty() {
            return None;
        }
        let klen = get_u16(self.bytes, 0) as usize;
        let vlen = get_u16(self.bytes, 2) as usize;
        let key = &self.bytes[4..4 + klen];
        let value = &self.bytes[4 + klen..4 + klen + vlen];
        self.bytes = &self.bytes[4 + klen + vlen..];
        Some(Tag { key, value })
    }
}

/// One node reference inside a way, with an optional cached location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WayNode {
    pub node_id: i64,
    pub location: Location,
}

/// Iterator over a node-ref list payload.
#[derive(Clone, Debug)]
pub struct WayNodeIter<'a> {
    bytes: &'a [u8],
}

impl Iterator for WayNodeIter<'_> {
    type Item = WayNode;

    fn next(&mut self) -> Option<WayNode> {
        if self.bytes.is_empty() {
            return None;
        }
        let node_id = get_i64(self.bytes, 0);
        let location = Location::new(get_i32(self.bytes, 8), get_i32(self.bytes, 12));
        self.bytes = &self.bytes[NODE_REF_ENTRY_SIZE..];
        Some(WayNode { node_id, location })
    }
}

impl ExactSizeIterator for WayNodeIter<'_> {
    fn len(&self) -> usize {
        self.bytes.len() / NODE_REF_ENTRY_SIZE
    }
}

/// One relation member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Member<'a> {
    pub kind: ItemKind,
    pub member_id: i64,
    pub role: &'a [u8],
}

/// Iterator over a member list payload.
#[derive(Clone, Debug)]
pub struct MemberIter<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for MemberIter<'a> {
    type Item = Member<'a>;

    fn next(&mut self) -> Option<Member<'a>> {
        if self.bytes.is_empty() {
            return None;
        }
        let kind = ItemKind::from_u8(self.bytes[0]).unwrap_or(ItemKind::Node);
        let role_len = get_u16(self.bytes, 1) as usize;
        let member_id = get_i64(self.bytes, 3);
        let role = &self.bytes[11..11 + role_len];
        self.bytes = &self.bytes[11 + role_len..];
        Some(Member {
            kind,
            member_id,
            role,
        })
    }
}

/// Iterator over a contiguous item region.
#[derive(Clone, Debug)]
pub struct ItemIter<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> ItemIter<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = ItemRef<'a>;

    fn next(&mut self) -> Option<ItemRef<'a>> {
        if self.off >= self.bytes.len() {
            return None;
        }
        let size = get_u32(self.bytes, self.off + OFF_SIZE) as usize;
        assert!(size >= HEADER_SIZE, "corrupt item size");
        assert!(size % 8 == 0, "unaligned item size");
        assert!(self.off + size <= self.bytes.len(), "item overruns region");
        let item = ItemRef::new(&self.bytes[self.off..self.off + size]);
        self.off += size;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pin the layout: a node with no user and no children is exactly
    // header (8) + fixed (44) padded to 56 bytes.
    #[test]
    fn minimal_node_layout() {
        let size = align_up(NODE_FIXED_END) as u32;
        assert_eq!(size, 56);

        let mut bytes = vec![0u8; size as usize];
        bytes[OFF_SIZE..OFF_SIZE + 4].copy_from_slice(&size.to_le_bytes());
        bytes[OFF_KIND] = ItemKind::Node.as_u8();
        bytes[OFF_FLAGS] = FLAG_VISIBLE;
        bytes[OFF_ID..OFF_ID + 8].copy_from_slice(&17i64.to_le_bytes());
        bytes[OFF_LON..OFF_LON + 4].copy_from_slice(&100i32.to_le_bytes());
        bytes[OFF_LAT..OFF_LAT + 4].copy_from_slice(&200i32.to_le_bytes());

        let item = ItemRef::new(&bytes);
        assert_eq!(item.kind(), Some(ItemKind::Node));
        match item.decode().unwrap() {
            Item::Node(node) => {
                assert_eq!(node.id(), 17);
                assert!(node.visible());
                assert_eq!(node.location(), Location::new(100, 200));
                assert_eq!(node.user(), b"");
                assert_eq!(node.tags().count(), 0);
            }
            other => panic!("expected node, got {other:?}"),
        }
    }

    #[test]
    fn item_iter_steps_by_size() {
        let mut bytes = Vec::new();
        for id in [1i64, 2] {
            let size = align_up(NODE_FIXED_END) as u32;
            let mut item = vec![0u8; size as usize];
            item[OFF_SIZE..OFF_SIZE + 4].copy_from_slice(&size.to_le_bytes());
            item[OFF_KIND] = ItemKind::Node.as_u8();
            item[OFF_ID..OFF_ID + 8].copy_from_slice(&id.to_le_bytes());
            bytes.extend_from_slice(&item);
        }
        let ids: Vec<i64> = ItemIter::new(&bytes)
            .map(|i| match i.decode().unwrap() {
                Item::Node(n) => n.id(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
