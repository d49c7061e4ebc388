//! In-memory object buffers: the arena, item layout, and builders.

pub mod buffer;
pub mod builder;
pub mod item;

pub use buffer::{Buffer, GrowthPolicy, ALIGNMENT, DEFAULT_CAPACITY};
pub use builder::{
    ChangesetBuilder, MemberListBuilder, NodeBuilder, NodeRefListBuilder, RelationBuilder,
    TagListBuilder, WayBuilder,
};
pub use item::{
    Changeset, Item, ItemIter, ItemRef, Member, MemberIter, Node, OsmObject, Relation, Tag,
    TagIter, Way, WayNode, WayNodeIter,
};
