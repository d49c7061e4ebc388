//! Scoped builders appending items into a [`Buffer`].
//!
//! A builder reserves its item's fixed prefix on construction (type tag plus
//! a placeholder length) and finalizes the length and alignment padding when
//! it is finished or dropped. Child list builders take an exclusive borrow
//! on their parent, so a parent cannot be written to while a child is live
//! and builders always unwind in LIFO order; the borrow checker enforces
//! what the original parent-pointer scheme checked at runtime.
//!
//! On a fixed-size buffer any append can signal [`BufferIsFull`]. The
//! partially written item stays invisible (it is past the last commit);
//! the caller drops the builder tree, calls [`Buffer::rollback`], and
//! retries with a fresh buffer.

use crate::error::BufferIsFull;
use crate::memory::buffer::Buffer;
use crate::memory::item::{
    FLAG_VISIBLE, LIST_LEN_OFF, LIST_PAYLOAD_OFF, NODE_FIXED_END, NODE_REF_ENTRY_SIZE,
    OBJECT_FIXED_END, OFF_CHANGESET, OFF_FLAGS, OFF_ID, OFF_KIND, OFF_LAT, OFF_LON, OFF_SIZE,
    OFF_TIMESTAMP, OFF_UID, OFF_USER_LEN, OFF_VERSION,
};
use crate::osm::types::{ItemKind, Location};

/// Shared machinery for object builders.
#[derive(Debug)]
struct ObjectInner<'a> {
    buf: &'a mut Buffer,
    start: usize,
    has_user: bool,
    has_children: bool,
    finished: bool,
}

impl<'a> ObjectInner<'a> {
    fn begin(
        buf: &'a mut Buffer,
        kind: ItemKind,
        fixed_end: usize,
    ) -> Result<Self, BufferIsFull> {
        assert!(
            buf.written() % 8 == 0,
            "object builder must start on an aligned buffer"
        );
        let start = buf.reserve_zeroed(fixed_end)?;
        buf.write_at(start + OFF_KIND, &[kind.as_u8()]);
        buf.write_at(start + OFF_FLAGS, &[FLAG_VISIBLE]);
        Ok(Self {
            buf,
            start,
            has_user: false,
            has_children: false,
            finished: false,
        })
    }

    fn set_i64(&mut self, off: usize, value: i64) {
        self.buf.write_at(self.start + off, &value.to_le_bytes());
    }

    fn set_u32(&mut self, off: usize, value: u32) {
        self.buf.write_at(self.start + off, &value.to_le_bytes());
    }

    fn set_i32(&mut self, off: usize, value: i32) {
        self.buf.write_at(self.start + off, &value.to_le_bytes());
    }

    fn set_visible(&mut self, visible: bool) {
        let flags = if visible { FLAG_VISIBLE } else { 0 };
        self.buf.write_at(self.start + OFF_FLAGS, &[flags]);
    }

    fn set_user(&mut self, user: &[u8]) -> Result<(), BufferIsFull> {
        assert!(!self.has_user, "user already set");
        assert!(
            !self.has_children,
            "user must be set before any child list"
        );
        assert!(user.len() <= u32::MAX as usize, "user name too long");
        self.buf.append(user)?;
        self.buf.pad_to_alignment()?;
        let len = user.len() as u32;
        self.buf
            .write_at(self.start + OFF_USER_LEN, &len.to_le_bytes());
        self.has_user = true;
        Ok(())
    }

    /// Prepares the buffer for a child item and hands it out.
    fn child_buffer(&mut self) -> Result<&mut Buffer, BufferIsFull> {
        self.buf.pad_to_alignment()?;
        self.has_children = true;
        Ok(self.buf)
    }

    fn finalize(&mut self) -> Result<(), BufferIsFull> {
        if self.finished {
            return Ok(());
        }
        self.buf.pad_to_alignment()?;
        let size = self.buf.written() - self.start;
        assert!(size <= u32::MAX as usize, "item too large");
        self.buf
            .write_at(self.start + OFF_SIZE, &(size as u32).to_le_bytes());
        self.finished = true;
        Ok(())
    }
}

macro_rules! object_builder {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $fixed_end:expr) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name<'a> {
            inner: ObjectInner<'a>,
        }

        impl<'a> $name<'a> {
            /// Starts a new item, reserving its fixed prefix.
            pub fn new(buffer: &'a mut Buffer) -> Result<Self, BufferIsFull> {
                Ok(Self {
                    inner: ObjectInner::begin(buffer, $kind, $fixed_end)?,
                })
            }

            /// Sets the object id.
            pub fn id(&mut self, value: i64) -> &mut Self {
                self.inner.set_i64(OFF_ID, value);
                self
            }

            /// Sets the object version.
            pub fn version(&mut self, value: u32) -> &mut Self {
                self.inner.set_u32(OFF_VERSION, value);
                self
            }

            /// Sets the user id.
            pub fn uid(&mut self, value: u32) -> &mut Self {
                self.inner.set_u32(OFF_UID, value);
                self
            }

            /// Sets the changeset id.
            pub fn changeset(&mut self, value: i64) -> &mut Self {
                self.inner.set_i64(OFF_CHANGESET, value);
                self
            }

            /// Sets the timestamp in epoch milliseconds.
            pub fn timestamp(&mut self, ms: i64) -> &mut Self {
                self.inner.set_i64(OFF_TIMESTAMP, ms);
                self
            }

            /// Sets the visibility flag (default true).
            pub fn visible(&mut self, visible: bool) -> &mut Self {
                self.inner.set_visible(visible);
                self
            }

            /// Appends the user name. Must come before any child list.
            pub fn user(&mut self, user: &[u8]) -> Result<&mut Self, BufferIsFull> {
                self.inner.set_user(user)?;
                Ok(self)
            }

            /// Starts the tag list for this object.
            pub fn tags(&mut self) -> Result<TagListBuilder<'_>, BufferIsFull> {
                TagListBuilder::begin(self.inner.child_buffer()?)
            }

            /// Finalizes the item: appends padding and writes the length.
            ///
            /// The caller still has to call [`Buffer::commit`] to make the
            /// item visible.
            pub fn finish(mut self) -> Result<(), BufferIsFull> {
                self.inner.finalize()
            }
        }

        impl Drop for $name<'_> {
            fn drop(&mut self) {
                // Best effort; a full buffer here is rolled back by the caller.
                let _ = self.inner.finalize();
            }
        }
    };
}

object_builder! {
    /// Builds a node item.
    NodeBuilder, ItemKind::Node, NODE_FIXED_END
}
object_builder! {
    /// Builds a way item.
    WayBuilder, ItemKind::Way, OBJECT_FIXED_END
}
object_builder! {
    /// Builds a relation item.
    RelationBuilder, ItemKind::Relation, OBJECT_FIXED_END
}
object_builder! {
    /// Builds a changeset item.
    ChangesetBuilder, ItemKind::Changeset, OBJECT_FIXED_END
}

impl NodeBuilder<'_> {
    /// Sets the node location. Undefined by default.
    pub fn location(&mut self, location: Location) -> &mut Self {
        self.inner.set_i32(OFF_LON, location.lon());
        self.inner.set_i32(OFF_LAT, location.lat());
        self
    }
}

impl WayBuilder<'_> {
    /// Starts the node-ref list for this way.
    pub fn nodes(&mut self) -> Result<NodeRefListBuilder<'_>, BufferIsFull> {
        NodeRefListBuilder::begin(self.inner.child_buffer()?)
    }
}

impl RelationBuilder<'_> {
    /// Starts the member list for this relation.
    pub fn members(&mut self) -> Result<MemberListBuilder<'_>, BufferIsFull> {
        MemberListBuilder::begin(self.inner.child_buffer()?)
    }
}

/// Shared machinery for child list builders.
#[derive(Debug)]
struct ListInner<'a> {
    buf: &'a mut Buffer,
    start: usize,
    finished: bool,
}

impl<'a> ListInner<'a> {
    fn begin(buf: &'a mut Buffer, kind: ItemKind) -> Result<Self, BufferIsFull> {
        debug_assert!(buf.written() % 8 == 0);
        let start = buf.reserve_zeroed(LIST_PAYLOAD_OFF)?;
        buf.write_at(start + OFF_KIND, &[kind.as_u8()]);
        Ok(Self {
            buf,
            start,
            finished: false,
        })
    }

    fn payload_len(&self) -> usize {
        self.buf.written() - self.start - LIST_PAYLOAD_OFF
    }

    fn finalize(&mut self, len_word: u32) -> Result<(), BufferIsFull> {
        if self.finished {
            return Ok(());
        }
        self.buf
            .write_at(self.start + LIST_LEN_OFF, &len_word.to_le_bytes());
        self.buf.pad_to_alignment()?;
        let size = self.buf.written() - self.start;
        self.buf
            .write_at(self.start + OFF_SIZE, &(size as u32).to_le_bytes());
        self.finished = true;
        Ok(())
    }
}

/// Builds a tag list inside an object.
#[derive(Debug)]
pub struct TagListBuilder<'a> {
    inner: ListInner<'a>,
}

impl<'a> TagListBuilder<'a> {
    fn begin(buf: &'a mut Buffer) -> Result<Self, BufferIsFull> {
        Ok(Self {
            inner: ListInner::begin(buf, ItemKind::TagList)?,
        })
    }

    /// Appends one key/value tag.
    pub fn add_tag(&mut self, key: &[u8], value: &[u8]) -> Result<(), BufferIsFull> {
        assert!(key.len() <= u16::MAX as usize, "tag key too long");
        assert!(value.len() <= u16::MAX as usize, "tag value too long");
        self.inner.buf.append(&(key.len() as u16).to_le_bytes())?;
        self.inner.buf.append(&(value.len() as u16).to_le_bytes())?;
        self.inner.buf.append(key)?;
        self.inner.buf.append(value)?;
        Ok(())
    }

    /// Finalizes the list item.
    pub fn finish(mut self) -> Result<(), BufferIsFull> {
        let len = self.inner.payload_len() as u32;
        self.inner.finalize(len)
    }
}

impl Drop for TagListBuilder<'_> {
    fn drop(&mut self) {
        let len = self.inner.payload_len() as u32;
        let _ = self.inner.finalize(len);
    }
}

/// Builds a way's node-ref list.
#[derive(Debug)]
pub struct NodeRefListBuilder<'a> {
    inner: ListInner<'a>,
}

impl<'a> NodeRefListBuilder<'a> {
    fn begin(buf: &'a mut Buffer) -> Result<Self, BufferIsFull> {
        Ok(Self {
            inner: ListInner::begin(buf, ItemKind::NodeRefList)?,
        })
    }

    /// Appends one node reference with an optional cached location.
    pub fn add_node_ref(
        &mut self,
        node_id: i64,
        location: Location,
    ) -> Result<(), BufferIsFull> {
        let mut entry = [0u8; NODE_REF_ENTRY_SIZE];
        entry[0..8].copy_from_slice(&node_id.to_le_bytes());
        entry[8..12].copy_from_slice(&location.lon().to_le_bytes());
        entry[12..16].copy_from_slice(&location.lat().to_le_bytes());
        self.inner.buf.append(&entry)?;
        Ok(())
    }

    fn count(&self) -> u32 {
        (self.inner.payload_len() / NODE_REF_ENTRY_SIZE) as u32
    }

    /// Finalizes the list item.
    pub fn finish(mut self) -> Result<(), BufferIsFull> {
        let count = self.count();
        self.inner.finalize(count)
    }
}

impl Drop for NodeRefListBuilder<'_> {
    fn drop(&mut self) {
        let count = self.count();
        let _ = self.inner.finalize(count);
    }
}

/// Builds a relation's member list.
#[derive(Debug)]
pub struct MemberListBuilder<'a> {
    inner: ListInner<'a>,
}

impl<'a> MemberListBuilder<'a> {
    fn begin(buf: &'a mut Buffer) -> Result<Self, BufferIsFull> {
        Ok(Self {
            inner: ListInner::begin(buf, ItemKind::MemberList)?,
        })
    }

    /// Appends one member triple (type, ref, role).
    pub fn add_member(
        &mut self,
        kind: ItemKind,
        member_id: i64,
        role: &[u8],
    ) -> Result<(), BufferIsFull> {
        assert!(
            matches!(kind, ItemKind::Node | ItemKind::Way | ItemKind::Relation),
            "invalid member type"
        );
        assert!(role.len() <= u16::MAX as usize, "member role too long");
        self.inner.buf.append(&[kind.as_u8()])?;
        self.inner.buf.append(&(role.len() as u16).to_le_bytes())?;
        self.inner.buf.append(&member_id.to_le_bytes())?;
        self.inner.buf.append(role)?;
        Ok(())
    }

    /// Finalizes the list item.
    pub fn finish(mut self) -> Result<(), BufferIsFull> {
        let len = self.inner.payload_len() as u32;
        self.inner.finalize(len)
    }
}

impl Drop for MemberListBuilder<'_> {
    fn drop(&mut self) {
        let len = self.inner.payload_len() as u32;
        let _ = self.inner.finalize(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::buffer::{Buffer, GrowthPolicy, ALIGNMENT};
    use crate::memory::item::{Item, OsmObject};

    fn buffer() -> Buffer {
        Buffer::with_capacity(4096, GrowthPolicy::Fixed)
    }

    #[test]
    fn node_round_trip() {
        let mut buf = buffer();
        {
            let mut b = NodeBuilder::new(&mut buf).unwrap();
            b.id(42)
                .version(3)
                .uid(7)
                .changeset(99)
                .timestamp(1_500_000)
                .location(Location::new(100, 200));
            b.user(b"alice").unwrap();
            {
                let mut tags = b.tags().unwrap();
                tags.add_tag(b"amenity", b"cafe").unwrap();
                tags.add_tag(b"name", b"Central").unwrap();
                tags.finish().unwrap();
            }
            b.finish().unwrap();
        }
        buf.commit();

        let items: Vec<_> = buf.items().collect();
        assert_eq!(items.len(), 1);
        let node = match items[0].decode().unwrap() {
            Item::Node(n) => n,
            other => panic!("expected node, got {other:?}"),
        };
        assert_eq!(node.id(), 42);
        assert_eq!(node.version(), 3);
        assert_eq!(node.uid(), 7);
        assert_eq!(node.changeset_id(), 99);
        assert_eq!(node.timestamp_ms(), 1_500_000);
        assert!(node.visible());
        assert_eq!(node.user(), b"alice");
        assert_eq!(node.location(), Location::new(100, 200));
        let tags: Vec<_> = node.tags().map(|t| (t.key.to_vec(), t.value.to_vec())).collect();
        assert_eq!(
            tags,
            vec![
                (b"amenity".to_vec(), b"cafe".to_vec()),
                (b"name".to_vec(), b"Central".to_vec()),
            ]
        );
    }

    #[test]
    fn way_round_trip() {
        let mut buf = buffer();
        {
            let mut b = WayBuilder::new(&mut buf).unwrap();
            b.id(5).version(1);
            b.user(b"bob").unwrap();
            {
                let mut nodes = b.nodes().unwrap();
                nodes.add_node_ref(10, Location::undefined()).unwrap();
                nodes.add_node_ref(11, Location::new(1, 2)).unwrap();
                nodes.finish().unwrap();
            }
            {
                let mut tags = b.tags().unwrap();
                tags.add_tag(b"highway", b"residential").unwrap();
                tags.finish().unwrap();
            }
            b.finish().unwrap();
        }
        buf.commit();

        let way = match buf.items().next().unwrap().decode().unwrap() {
            Item::Way(w) => w,
            other => panic!("expected way, got {other:?}"),
        };
        assert_eq!(way.id(), 5);
        let refs: Vec<i64> = way.nodes().map(|n| n.node_id).collect();
        assert_eq!(refs, vec![10, 11]);
        assert!(!way.nodes().next().unwrap().location.is_defined());
        assert_eq!(way.tags().count(), 1);
    }

    #[test]
    fn relation_round_trip() {
        let mut buf = buffer();
        {
            let mut b = RelationBuilder::new(&mut buf).unwrap();
            b.id(77).visible(false);
            b.user(b"").unwrap();
            {
                let mut members = b.members().unwrap();
                members.add_member(ItemKind::Way, 5, b"outer").unwrap();
                members.add_member(ItemKind::Node, 42, b"").unwrap();
                members.finish().unwrap();
            }
            b.finish().unwrap();
        }
        buf.commit();

        let rel = match buf.items().next().unwrap().decode().unwrap() {
            Item::Relation(r) => r,
            other => panic!("expected relation, got {other:?}"),
        };
        assert_eq!(rel.id(), 77);
        assert!(!rel.visible());
        let members: Vec<_> = rel.members().collect();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].kind, ItemKind::Way);
        assert_eq!(members[0].member_id, 5);
        assert_eq!(members[0].role, b"outer");
        assert_eq!(members[1].kind, ItemKind::Node);
        assert_eq!(members[1].role, b"");
    }

    #[test]
    fn every_item_is_aligned() {
        let mut buf = buffer();
        for id in 0..10i64 {
            let mut b = NodeBuilder::new(&mut buf).unwrap();
            b.id(id);
            b.user(&vec![b'x'; id as usize]).unwrap();
            b.finish().unwrap();
            buf.commit();
        }
        let mut off = 0;
        for item in buf.items() {
            assert_eq!(off % ALIGNMENT, 0);
            assert_eq!(item.size() % ALIGNMENT, 0);
            off += item.size();
        }
        assert_eq!(off, buf.committed());
    }

    #[test]
    fn unwinding_leaves_no_trace() {
        let mut buf = Buffer::with_capacity(128, GrowthPolicy::Fixed);
        {
            let mut b = NodeBuilder::new(&mut buf).unwrap();
            b.id(1);
            b.finish().unwrap();
        }
        buf.commit();
        let committed = buf.committed();

        // This build fails partway through: the user name does not fit.
        {
            let result = NodeBuilder::new(&mut buf).and_then(|mut b| {
                b.id(2);
                b.user(&[b'x'; 200]).map(|_| ())
            });
            assert!(result.is_err());
        }
        buf.rollback();

        assert_eq!(buf.committed(), committed);
        assert_eq!(buf.written(), committed);
        assert_eq!(buf.items().count(), 1);
    }

    #[test]
    fn changeset_minimal() {
        let mut buf = buffer();
        {
            let mut b = ChangesetBuilder::new(&mut buf).unwrap();
            b.id(123);
            b.finish().unwrap();
        }
        buf.commit();
        match buf.items().next().unwrap().decode().unwrap() {
            Item::Changeset(c) => assert_eq!(c.id(), 123),
            other => panic!("expected changeset, got {other:?}"),
        }
    }
}
