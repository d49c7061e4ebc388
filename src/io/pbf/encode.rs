//! PrimitiveBlock encoding from an item buffer.
//!
//! The inverse of [`decode`](super::decode): buffer items are partitioned
//! into homogeneous groups (nodes as DenseNodes), each block gets its own
//! string table interned from the strings seen in that block, and a new
//! block is flushed when the item count reaches the OSM PBF convention of
//! 8000 or the estimated size grows too large.
//!
//! Blocks are written with `granularity = 100`, zero offsets, and
//! `date_granularity = 1000`, so raw coordinate units coincide with the
//! in-memory 10^7 scaling and no division is needed on this path.

use ahash::AHashMap;
use prost::Message;

use super::proto;
use crate::error::Error;
use crate::memory::{Buffer, Changeset, Node, OsmObject, Relation, Way};
use crate::memory::Item;
use crate::osm::types::ItemKind;

/// Items per PrimitiveGroup / block flush threshold (OSM PBF convention).
pub const MAX_GROUP_ITEMS: usize = 8000;

/// Estimated-size flush threshold, comfortably under the 32 MiB blob cap.
const MAX_BLOCK_ESTIMATE: usize = 16 * 1024 * 1024;

/// Encodes buffers into PrimitiveBlock payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockEncoder;

impl BlockEncoder {
    /// Creates an encoder with the default block parameters.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encodes all items of a buffer into one or more block payloads.
    ///
    /// Item order is preserved: groups follow the buffer order, and blocks
    /// follow group order.
    pub fn encode_buffer(&self, buffer: &Buffer) -> Result<Vec<Vec<u8>>, Error> {
        let mut blocks = Vec::new();
        let mut state = BlockState::new();

        for item in buffer.items() {
            let object = item
                .decode()
                .ok_or_else(|| Error::format("unexpected child item at buffer top level"))?;
            state.add(&object, item.size());
            if state.item_count >= MAX_GROUP_ITEMS || state.estimate >= MAX_BLOCK_ESTIMATE {
                blocks.push(state.finish());
                state = BlockState::new();
            }
        }
        if state.item_count > 0 {
            blocks.push(state.finish());
        }
        Ok(blocks)
    }
}

/// Per-block string table with interning; index 0 is the empty string.
struct StringTableBuilder {
    map: AHashMap<Vec<u8>, u32>,
    table: Vec<Vec<u8>>,
}

impl StringTableBuilder {
    fn new() -> Self {
        let mut map = AHashMap::new();
        map.insert(Vec::new(), 0);
        Self {
            map,
            table: vec![Vec::new()],
        }
    }

    fn intern(&mut self, s: &[u8]) -> u32 {
        if let Some(&idx) = self.map.get(s) {
            return idx;
        }
        let idx = self.table.len() as u32;
        self.table.push(s.to_vec());
        self.map.insert(s.to_vec(), idx);
        idx
    }

    fn into_proto(self) -> proto::StringTable {
        proto::StringTable { s: self.table }
    }
}

/// Delta-encoding state for one DenseNodes group.
#[derive(Default)]
struct DenseState {
    dense: proto::DenseNodes,
    last_id: i64,
    last_lat: i64,
    last_lon: i64,
    last_timestamp: i64,
    last_changeset: i64,
    last_uid: i64,
    last_user_sid: i64,
    any_tags: bool,
    any_invisible: bool,
}

impl DenseState {
    fn push(&mut self, node: &Node<'_>, strings: &mut StringTableBuilder) {
        let info = self
            .dense
            .denseinfo
            .get_or_insert_with(proto::DenseInfo::default);

        let id = node.id();
        self.dense.id.push(id - self.last_id);
        self.last_id = id;

        // Undefined locations (invisible nodes) encode as raw zero; the
        // decoder ignores coordinates of invisible nodes.
        let loc = node.location();
        let (lat, lon) = if loc.is_defined() {
            (i64::from(loc.lat()), i64::from(loc.lon()))
        } else {
            (0, 0)
        };
        self.dense.lat.push(lat - self.last_lat);
        self.dense.lon.push(lon - self.last_lon);
        self.last_lat = lat;
        self.last_lon = lon;

        info.version.push(node.version() as i32);
        let ts = node.timestamp_ms();
        info.timestamp.push(ts - self.last_timestamp);
        self.last_timestamp = ts;
        let cs = node.changeset_id();
        info.changeset.push(cs - self.last_changeset);
        self.last_changeset = cs;
        let uid = i64::from(node.uid());
        info.uid.push((uid - self.last_uid) as i32);
        self.last_uid = uid;
        let sid = i64::from(strings.intern(node.user()));
        info.user_sid.push((sid - self.last_user_sid) as i32);
        self.last_user_sid = sid;
        info.visible.push(node.visible());
        if !node.visible() {
            self.any_invisible = true;
        }

        for tag in node.tags() {
            self.any_tags = true;
            self.dense.keys_vals.push(strings.intern(tag.key) as i32);
            self.dense.keys_vals.push(strings.intern(tag.value) as i32);
        }
        self.dense.keys_vals.push(0);
    }

    fn into_group(mut self) -> proto::PrimitiveGroup {
        if !self.any_tags {
            // All-zero terminator stream carries no information.
            self.dense.keys_vals.clear();
        }
        if !self.any_invisible {
            if let Some(info) = self.dense.denseinfo.as_mut() {
                info.visible.clear();
            }
        }
        proto::PrimitiveGroup {
            nodes: vec![],
            dense: Some(self.dense),
            ways: vec![],
            relations: vec![],
            changesets: vec![],
        }
    }
}

/// One homogeneous group under construction.
enum CurrentGroup {
    None,
    Dense(Box<DenseState>),
    Ways(Vec<proto::Way>),
    Relations(Vec<proto::Relation>),
    Changesets(Vec<proto::ChangeSet>),
}

impl CurrentGroup {
    fn kind(&self) -> Option<ItemKind> {
        match self {
            Self::None => None,
            Self::Dense(_) => Some(ItemKind::Node),
            Self::Ways(_) => Some(ItemKind::Way),
            Self::Relations(_) => Some(ItemKind::Relation),
            Self::Changesets(_) => Some(ItemKind::Changeset),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Dense(d) => d.dense.id.len(),
            Self::Ways(w) => w.len(),
            Self::Relations(r) => r.len(),
            Self::Changesets(c) => c.len(),
        }
    }
}

/// One PrimitiveBlock under construction.
struct BlockState {
    strings: StringTableBuilder,
    groups: Vec<proto::PrimitiveGroup>,
    current: CurrentGroup,
    item_count: usize,
    estimate: usize,
}

impl BlockState {
    fn new() -> Self {
        Self {
            strings: StringTableBuilder::new(),
            groups: Vec::new(),
            current: CurrentGroup::None,
            item_count: 0,
            estimate: 0,
        }
    }

    fn flush_group(&mut self) {
        let finished = std::mem::replace(&mut self.current, CurrentGroup::None);
        let group = match finished {
            CurrentGroup::None => return,
            CurrentGroup::Dense(dense) => dense.into_group(),
            CurrentGroup::Ways(ways) => proto::PrimitiveGroup {
                nodes: vec![],
                dense: None,
                ways,
                relations: vec![],
                changesets: vec![],
            },
            CurrentGroup::Relations(relations) => proto::PrimitiveGroup {
                nodes: vec![],
                dense: None,
                ways: vec![],
                relations,
                changesets: vec![],
            },
            CurrentGroup::Changesets(changesets) => proto::PrimitiveGroup {
                nodes: vec![],
                dense: None,
                ways: vec![],
                relations: vec![],
                changesets,
            },
        };
        self.groups.push(group);
    }

    fn add(&mut self, object: &Item<'_>, item_size: usize) {
        if self.current.kind() != Some(object.kind()) || self.current.len() >= MAX_GROUP_ITEMS {
            self.flush_group();
        }
        match object {
            Item::Node(node) => {
                if matches!(self.current, CurrentGroup::None) {
                    self.current = CurrentGroup::Dense(Box::default());
                }
                if let CurrentGroup::Dense(dense) = &mut self.current {
                    dense.push(node, &mut self.strings);
                }
            }
            Item::Way(way) => {
                if matches!(self.current, CurrentGroup::None) {
                    self.current = CurrentGroup::Ways(Vec::new());
                }
                if let CurrentGroup::Ways(ways) = &mut self.current {
                    ways.push(encode_way(way, &mut self.strings));
                }
            }
            Item::Relation(relation) => {
                if matches!(self.current, CurrentGroup::None) {
                    self.current = CurrentGroup::Relations(Vec::new());
                }
                if let CurrentGroup::Relations(relations) = &mut self.current {
                    relations.push(encode_relation(relation, &mut self.strings));
                }
            }
            Item::Changeset(changeset) => {
                if matches!(self.current, CurrentGroup::None) {
                    self.current = CurrentGroup::Changesets(Vec::new());
                }
                if let CurrentGroup::Changesets(changesets) = &mut self.current {
                    changesets.push(encode_changeset(changeset));
                }
            }
        }
        self.item_count += 1;
        self.estimate += item_size;
    }

    fn finish(mut self) -> Vec<u8> {
        self.flush_group();
        proto::PrimitiveBlock {
            stringtable: Some(self.strings.into_proto()),
            primitivegroup: self.groups,
            granularity: Some(100),
            date_granularity: Some(1000),
            lat_offset: Some(0),
            lon_offset: Some(0),
        }
        .encode_to_vec()
    }
}

fn encode_info<T: OsmObject>(object: &T, strings: &mut StringTableBuilder) -> proto::Info {
    proto::Info {
        version: Some(object.version() as i32),
        timestamp: Some(object.timestamp_ms()),
        changeset: Some(object.changeset_id()),
        uid: Some(object.uid() as i32),
        user_sid: Some(strings.intern(object.user())),
        visible: Some(object.visible()),
    }
}

fn encode_tags<T: OsmObject>(
    object: &T,
    strings: &mut StringTableBuilder,
) -> (Vec<u32>, Vec<u32>) {
    let mut keys = Vec::new();
    let mut vals = Vec::new();
    for tag in object.tags() {
        keys.push(strings.intern(tag.key));
        vals.push(strings.intern(tag.value));
    }
    (keys, vals)
}

fn encode_way(way: &Way<'_>, strings: &mut StringTableBuilder) -> proto::Way {
    let (keys, vals) = encode_tags(way, strings);
    let mut refs = Vec::new();
    let mut last = 0i64;
    for node in way.nodes() {
        refs.push(node.node_id - last);
        last = node.node_id;
    }
    proto::Way {
        id: Some(way.id()),
        keys,
        vals,
        info: Some(encode_info(way, strings)),
        refs,
    }
}

fn encode_relation(relation: &Relation<'_>, strings: &mut StringTableBuilder) -> proto::Relation {
    let (keys, vals) = encode_tags(relation, strings);
    let mut roles_sid = Vec::new();
    let mut memids = Vec::new();
    let mut types = Vec::new();
    let mut last = 0i64;
    for member in relation.members() {
        roles_sid.push(strings.intern(member.role) as i32);
        memids.push(member.member_id - last);
        last = member.member_id;
        let member_type = match member.kind {
            ItemKind::Way => proto::MemberType::Way,
            ItemKind::Relation => proto::MemberType::Relation,
            _ => proto::MemberType::Node,
        };
        types.push(member_type as i32);
    }
    proto::Relation {
        id: Some(relation.id()),
        keys,
        vals,
        info: Some(encode_info(relation, strings)),
        roles_sid,
        memids,
        types,
    }
}

fn encode_changeset(changeset: &Changeset<'_>) -> proto::ChangeSet {
    proto::ChangeSet {
        id: Some(changeset.id()),
    }
}
