//! Callback interface for consumers of decoded buffers.
//!
//! The core pipeline delivers buffers; it never invokes handlers itself.
//! [`apply`] is the bridge for callers who prefer callbacks: it pulls
//! buffers from a reader and dispatches each object, with lifecycle
//! callbacks fired around each run of same-typed objects. All methods
//! have no-op defaults, so a handler implements only what it needs.

use crate::error::Error;
use crate::io::reader::Reader;
use crate::memory::{Changeset, Item, Node, Relation, Way};
use crate::osm::types::ItemKind;

/// Consumer callbacks for OSM objects.
#[allow(unused_variables)]
pub trait Handler {
    /// Called once before any object.
    fn init(&mut self) {}

    fn before_nodes(&mut self) {}
    fn node(&mut self, node: &Node<'_>) {}
    fn after_nodes(&mut self) {}

    fn before_ways(&mut self) {}
    fn way(&mut self, way: &Way<'_>) {}
    fn after_ways(&mut self) {}

    fn before_relations(&mut self) {}
    fn relation(&mut self, relation: &Relation<'_>) {}
    fn after_relations(&mut self) {}

    fn before_changesets(&mut self) {}
    fn changeset(&mut self, changeset: &Changeset<'_>) {}
    fn after_changesets(&mut self) {}

    /// Called once after the last object.
    fn done(&mut self) {}
}

fn before(handler: &mut impl Handler, kind: ItemKind) {
    match kind {
        ItemKind::Node => handler.before_nodes(),
        ItemKind::Way => handler.before_ways(),
        ItemKind::Relation => handler.before_relations(),
        ItemKind::Changeset => handler.before_changesets(),
        _ => {}
    }
}

fn after(handler: &mut impl Handler, kind: ItemKind) {
    match kind {
        ItemKind::Node => handler.after_nodes(),
        ItemKind::Way => handler.after_ways(),
        ItemKind::Relation => handler.after_relations(),
        ItemKind::Changeset => handler.after_changesets(),
        _ => {}
    }
}

/// Drains a reader, dispatching every object to `handler`.
///
/// `before_*`/`after_*` fire at each transition between object kinds, in
/// stream order; `init` and `done` bracket the whole run.
pub fn apply<H: Handler>(reader: &mut Reader, handler: &mut H) -> Result<(), Error> {
    handler.init();
    let mut current: Option<ItemKind> = None;

    while let Some(buffer) = reader.next_buffer()? {
        for item in buffer.items() {
            let Some(object) = item.decode() else {
                continue;
            };
            let kind = object.kind();
            if current != Some(kind) {
                if let Some(prev) = current {
                    after(handler, prev);
                }
                before(handler, kind);
                current = Some(kind);
            }
            match &object {
                Item::Node(node) => handler.node(node),
                Item::Way(way) => handler.way(way),
                Item::Relation(relation) => handler.relation(relation),
                Item::Changeset(changeset) => handler.changeset(changeset),
            }
        }
    }
    if let Some(prev) = current {
        after(handler, prev);
    }
    handler.done();
    Ok(())
}
