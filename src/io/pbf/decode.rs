//! PrimitiveBlock decoding into an item buffer.
//!
//! One decoded blob becomes one [`Buffer`]. Coordinates are reconstructed
//! with the block's `granularity` and offsets:
//!
//! ```text
//! scaled = (raw * granularity + offset) / (10^9 / 10^7)
//! ```
//!
//! all in integer arithmetic. Timestamps scale by `date_granularity / 1000`
//! to epoch milliseconds; blocks declaring a `date_granularity` below 1000
//! are rejected, since integer truncation would silently zero every
//! timestamp.
//!
//! DenseNodes delta arrays are cumulatively summed with overflow checks. The
//! flat `k1,v1,...,0` tag stream is walked with a single cursor threaded
//! through the per-node decode. Groups of types excluded by the read mask
//! are skipped without touching the buffer.

use prost::Message;

use super::proto;
use crate::error::Error;
use crate::memory::{
    Buffer, ChangesetBuilder, GrowthPolicy, NodeBuilder, RelationBuilder, WayBuilder,
};
use crate::osm::types::{
    ItemKind, Location, ReadTypes, COORDINATE_PRECISION, RESOLUTION_DIVISOR,
};

const MAX_SCALED_LON: i64 = 180 * COORDINATE_PRECISION;
const MAX_SCALED_LAT: i64 = 90 * COORDINATE_PRECISION;

/// Decodes PrimitiveBlocks into buffers.
///
/// Cheap to copy; each decode task carries one by value.
#[derive(Clone, Copy, Debug)]
pub struct BlockDecoder {
    read_types: ReadTypes,
    buffer_capacity: usize,
}

/// Per-block decode state: string table plus fixed-point parameters.
struct BlockContext {
    strings: Vec<Vec<u8>>,
    granularity: i64,
    lat_offset: i64,
    lon_offset: i64,
    date_factor: i64,
}

impl BlockContext {
    fn string(&self, idx: i64) -> Result<&[u8], Error> {
        if idx < 0 || idx as usize >= self.strings.len() {
            return Err(Error::format(format!(
                "string table index out of range: {idx} (table has {})",
                self.strings.len()
            )));
        }
        Ok(&self.strings[idx as usize])
    }

    fn coord(&self, raw: i64, offset: i64, max_abs: i64) -> Result<i32, Error> {
        let nano = raw
            .checked_mul(self.granularity)
            .and_then(|v| v.checked_add(offset))
            .ok_or_else(|| Error::format("coordinate overflow"))?;
        let scaled = nano / RESOLUTION_DIVISOR;
        if scaled < -max_abs || scaled > max_abs {
            return Err(Error::format(format!(
                "coordinate out of range: {scaled}"
            )));
        }
        Ok(scaled as i32)
    }

    fn location(&self, raw_lon: i64, raw_lat: i64) -> Result<Location, Error> {
        Ok(Location::new(
            self.coord(raw_lon, self.lon_offset, MAX_SCALED_LON)?,
            self.coord(raw_lat, self.lat_offset, MAX_SCALED_LAT)?,
        ))
    }

    fn timestamp_ms(&self, t: i64) -> Result<i64, Error> {
        t.checked_mul(self.date_factor)
            .ok_or_else(|| Error::format("timestamp overflow"))
    }
}

/// Applies an optional Info to an object builder, returning visibility.
macro_rules! apply_info {
    ($builder:expr, $ctx:expr, $info:expr) => {{
        match $info {
            Some(info) => {
                let visible = info.visible.unwrap_or(true);
                $builder
                    .version(info.version.unwrap_or(0).max(0) as u32)
                    .changeset(info.changeset.unwrap_or(0))
                    .timestamp($ctx.timestamp_ms(info.timestamp.unwrap_or(0))?)
                    .uid(info.uid.unwrap_or(0).max(0) as u32)
                    .visible(visible);
                let user = $ctx.string(i64::from(info.user_sid.unwrap_or(0)))?;
                $builder.user(user)?;
                visible
            }
            None => {
                $builder.user(b"")?;
                true
            }
        }
    }};
}

impl BlockDecoder {
    /// Creates a decoder for the given read mask and buffer capacity.
    #[must_use]
    pub fn new(read_types: ReadTypes, buffer_capacity: usize) -> Self {
        Self {
            read_types,
            buffer_capacity,
        }
    }

    /// Decodes one uncompressed PrimitiveBlock payload into a buffer.
    pub fn decode_block(&self, data: &[u8]) -> Result<Buffer, Error> {
        let block = proto::PrimitiveBlock::decode(data)?;

        let date_granularity = block.date_granularity.unwrap_or(1000);
        if date_granularity < 1000 {
            return Err(Error::format(format!(
                "invalid date_granularity: {date_granularity}"
            )));
        }
        let ctx = BlockContext {
            strings: block.stringtable.map(|st| st.s).unwrap_or_default(),
            granularity: i64::from(block.granularity.unwrap_or(100)),
            lat_offset: block.lat_offset.unwrap_or(0),
            lon_offset: block.lon_offset.unwrap_or(0),
            date_factor: i64::from(date_granularity / 1000),
        };

        let mut buffer = Buffer::with_capacity(self.buffer_capacity, GrowthPolicy::AutoGrow);
        for group in &block.primitivegroup {
            self.decode_group(&ctx, group, &mut buffer)?;
        }
        Ok(buffer)
    }

    fn decode_group(
        &self,
        ctx: &BlockContext,
        group: &proto::PrimitiveGroup,
        buffer: &mut Buffer,
    ) -> Result<(), Error> {
        let want = |kind| self.read_types.contains(kind);

        if let Some(dense) = &group.dense {
            if want(ItemKind::Node) {
                decode_dense(ctx, dense, buffer)?;
            }
        } else if !group.ways.is_empty() {
            if want(ItemKind::Way) {
                decode_ways(ctx, &group.ways, buffer)?;
            }
        } else if !group.relations.is_empty() {
            if want(ItemKind::Relation) {
                decode_relations(ctx, &group.relations, buffer)?;
            }
        } else if !group.nodes.is_empty() {
            if want(ItemKind::Node) {
                decode_nodes(ctx, &group.nodes, buffer)?;
            }
        } else if !group.changesets.is_empty() {
            if want(ItemKind::Changeset) {
                decode_changesets(&group.changesets, buffer)?;
            }
        } else {
            return Err(Error::format("group of unknown type"));
        }
        Ok(())
    }
}

fn checked_sum(acc: &mut i64, delta: i64, what: &str) -> Result<i64, Error> {
    *acc = acc
        .checked_add(delta)
        .ok_or_else(|| Error::format(format!("{what} delta overflow")))?;
    Ok(*acc)
}

fn decode_dense(
    ctx: &BlockContext,
    dense: &proto::DenseNodes,
    buffer: &mut Buffer,
) -> Result<(), Error> {
    let count = dense.id.len();
    if dense.lat.len() != count || dense.lon.len() != count {
        return Err(Error::format("dense coordinate arrays out of step"));
    }
    if let Some(info) = &dense.denseinfo {
        if info.version.len() != count
            || info.timestamp.len() != count
            || info.changeset.len() != count
            || info.uid.len() != count
            || info.user_sid.len() != count
        {
            return Err(Error::format("denseinfo arrays out of step"));
        }
        if !info.visible.is_empty() && info.visible.len() != count {
            return Err(Error::format("denseinfo visible array out of step"));
        }
    }

    let mut id = 0i64;
    let mut lat = 0i64;
    let mut lon = 0i64;
    let mut timestamp = 0i64;
    let mut changeset = 0i64;
    let mut uid = 0i64;
    let mut user_sid = 0i64;
    // Cursor into the flat 0-terminated tag stream.
    let mut tag_pos = 0usize;

    for i in 0..count {
        checked_sum(&mut id, dense.id[i], "id")?;
        checked_sum(&mut lat, dense.lat[i], "lat")?;
        checked_sum(&mut lon, dense.lon[i], "lon")?;

        let mut builder = NodeBuilder::new(buffer)?;
        builder.id(id);

        let visible = match &dense.denseinfo {
            Some(info) => {
                checked_sum(&mut timestamp, info.timestamp[i], "timestamp")?;
                checked_sum(&mut changeset, info.changeset[i], "changeset")?;
                checked_sum(&mut uid, i64::from(info.uid[i]), "uid")?;
                checked_sum(&mut user_sid, i64::from(info.user_sid[i]), "user_sid")?;
                let visible = info.visible.get(i).copied().unwrap_or(true);
                builder
                    .version(info.version[i].max(0) as u32)
                    .changeset(changeset)
                    .timestamp(ctx.timestamp_ms(timestamp)?)
                    .uid(uid.max(0) as u32)
                    .visible(visible);
                builder.user(ctx.string(user_sid)?)?;
                visible
            }
            None => {
                builder.user(b"")?;
                true
            }
        };

        if visible {
            builder.location(ctx.location(lon, lat)?);
        }

        tag_pos = add_dense_tags(ctx, &dense.keys_vals, tag_pos, &mut builder)?;
        builder.finish()?;
        buffer.commit();
    }
    Ok(())
}

/// Consumes one node's tags from the flat stream, returning the new cursor.
fn add_dense_tags(
    ctx: &BlockContext,
    keys_vals: &[i32],
    mut n: usize,
    builder: &mut NodeBuilder<'_>,
) -> Result<usize, Error> {
    if n >= keys_vals.len() {
        return Ok(n);
    }
    if keys_vals[n] == 0 {
        return Ok(n + 1);
    }

    let mut tags = builder.tags()?;
    while n < keys_vals.len() {
        let key = keys_vals[n];
        n += 1;
        if key == 0 {
            break;
        }
        let val = *keys_vals
            .get(n)
            .ok_or_else(|| Error::format("dangling key in dense tag stream"))?;
        n += 1;
        tags.add_tag(ctx.string(i64::from(key))?, ctx.string(i64::from(val))?)?;
    }
    tags.finish()?;
    Ok(n)
}

fn tag_arrays<'a>(
    keys: &'a [u32],
    vals: &'a [u32],
) -> Result<impl Iterator<Item = (u32, u32)> + 'a, Error> {
    if keys.len() != vals.len() {
        return Err(Error::format("tag key/value arrays out of step"));
    }
    Ok(keys.iter().copied().zip(vals.iter().copied()))
}

fn decode_nodes(
    ctx: &BlockContext,
    nodes: &[proto::Node],
    buffer: &mut Buffer,
) -> Result<(), Error> {
    for pbf_node in nodes {
        let mut builder = NodeBuilder::new(buffer)?;
        builder.id(pbf_node.id.unwrap_or(0));
        let visible = apply_info!(builder, ctx, &pbf_node.info);

        if visible {
            let loc = ctx.location(pbf_node.lon.unwrap_or(0), pbf_node.lat.unwrap_or(0))?;
            builder.location(loc);
        }

        let mut pairs = tag_arrays(&pbf_node.keys, &pbf_node.vals)?.peekable();
        if pairs.peek().is_some() {
            let mut tags = builder.tags()?;
            for (k, v) in pairs {
                tags.add_tag(ctx.string(i64::from(k))?, ctx.string(i64::from(v))?)?;
            }
            tags.finish()?;
        }

        builder.finish()?;
        buffer.commit();
    }
    Ok(())
}

fn decode_ways(
    ctx: &BlockContext,
    ways: &[proto::Way],
    buffer: &mut Buffer,
) -> Result<(), Error> {
    for pbf_way in ways {
        let mut builder = WayBuilder::new(buffer)?;
        builder.id(pbf_way.id.unwrap_or(0));
        apply_info!(builder, ctx, &pbf_way.info);

        if !pbf_way.refs.is_empty() {
            let mut refs = builder.nodes()?;
            let mut node_id = 0i64;
            for delta in &pbf_way.refs {
                checked_sum(&mut node_id, *delta, "node ref")?;
                refs.add_node_ref(node_id, Location::undefined())?;
            }
            refs.finish()?;
        }

        let mut pairs = tag_arrays(&pbf_way.keys, &pbf_way.vals)?.peekable();
        if pairs.peek().is_some() {
            let mut tags = builder.tags()?;
            for (k, v) in pairs {
                tags.add_tag(ctx.string(i64::from(k))?, ctx.string(i64::from(v))?)?;
            }
            tags.finish()?;
        }

        builder.finish()?;
        buffer.commit();
    }
    Ok(())
}

fn decode_relations(
    ctx: &BlockContext,
    relations: &[proto::Relation],
    buffer: &mut Buffer,
) -> Result<(), Error> {
    for pbf_rel in relations {
        if pbf_rel.memids.len() != pbf_rel.types.len()
            || pbf_rel.memids.len() != pbf_rel.roles_sid.len()
        {
            return Err(Error::format("relation member arrays out of step"));
        }

        let mut builder = RelationBuilder::new(buffer)?;
        builder.id(pbf_rel.id.unwrap_or(0));
        apply_info!(builder, ctx, &pbf_rel.info);

        if !pbf_rel.memids.is_empty() {
            let mut members = builder.members()?;
            let mut member_id = 0i64;
            for i in 0..pbf_rel.memids.len() {
                checked_sum(&mut member_id, pbf_rel.memids[i], "member ref")?;
                let kind = match proto::MemberType::try_from(pbf_rel.types[i]) {
                    Ok(proto::MemberType::Node) => ItemKind::Node,
                    Ok(proto::MemberType::Way) => ItemKind::Way,
                    Ok(proto::MemberType::Relation) => ItemKind::Relation,
                    Err(_) => {
                        return Err(Error::format(format!(
                            "invalid member type: {}",
                            pbf_rel.types[i]
                        )))
                    }
                };
                let role = ctx.string(i64::from(pbf_rel.roles_sid[i]))?;
                members.add_member(kind, member_id, role)?;
            }
            members.finish()?;
        }

        let mut pairs = tag_arrays(&pbf_rel.keys, &pbf_rel.vals)?.peekable();
        if pairs.peek().is_some() {
            let mut tags = builder.tags()?;
            for (k, v) in pairs {
                tags.add_tag(ctx.string(i64::from(k))?, ctx.string(i64::from(v))?)?;
            }
            tags.finish()?;
        }

        builder.finish()?;
        buffer.commit();
    }
    Ok(())
}

fn decode_changesets(
    changesets: &[proto::ChangeSet],
    buffer: &mut Buffer,
) -> Result<(), Error> {
    for pbf_cs in changesets {
        let mut builder = ChangesetBuilder::new(buffer)?;
        builder.id(pbf_cs.id.unwrap_or(0));
        builder.user(b"")?;
        builder.finish()?;
        buffer.commit();
    }
    Ok(())
}
