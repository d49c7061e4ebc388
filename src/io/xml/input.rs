//! Serial OSM XML reader.
//!
//! XML has no framing to parallelize over, so this input parses on the
//! caller's thread, filling the same buffers the PBF pipeline produces.
//! Elements are accumulated into a plain record first and then written
//! through the builders, which keeps the event loop free of builder
//! borrow scopes.

use std::fs::File;
use std::io::BufReader;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use tracing::debug;

use crate::error::Error;
use crate::io::format::InputFormat;
use crate::io::header::{BoundingBox, Header};
use crate::io::reader::ReaderOptions;
use crate::memory::{
    Buffer, ChangesetBuilder, GrowthPolicy, NodeBuilder, RelationBuilder, WayBuilder,
};
use crate::osm::types::{timestamp_from_iso, ItemKind, Location, ReadTypes};

fn xml_err(err: impl std::fmt::Display) -> Error {
    Error::format(format!("XML parse error: {err}"))
}

/// One parsed OSM element before it is written into a buffer.
#[derive(Debug, Default)]
struct RawObject {
    kind: Option<ItemKind>,
    id: i64,
    version: u32,
    uid: u32,
    changeset: i64,
    timestamp_ms: i64,
    visible: bool,
    location: Location,
    user: Vec<u8>,
    tags: Vec<(Vec<u8>, Vec<u8>)>,
    refs: Vec<i64>,
    members: Vec<(ItemKind, i64, Vec<u8>)>,
}

impl RawObject {
    fn new(kind: ItemKind) -> Self {
        Self {
            kind: Some(kind),
            visible: true,
            location: Location::undefined(),
            ..Self::default()
        }
    }
}

fn object_kind(name: &[u8]) -> Option<ItemKind> {
    match name {
        b"node" => Some(ItemKind::Node),
        b"way" => Some(ItemKind::Way),
        b"relation" => Some(ItemKind::Relation),
        b"changeset" => Some(ItemKind::Changeset),
        _ => None,
    }
}

fn member_kind(name: &[u8]) -> Option<ItemKind> {
    match name {
        b"node" => Some(ItemKind::Node),
        b"way" => Some(ItemKind::Way),
        b"relation" => Some(ItemKind::Relation),
        _ => None,
    }
}

fn scale_coord(text: &str) -> Result<i32, Error> {
    let degrees: f64 = text
        .parse()
        .map_err(|_| Error::format(format!("bad coordinate: {text:?}")))?;
    let scaled = (degrees * 1e7).round();
    if !(-1.9e9..=1.9e9).contains(&scaled) {
        return Err(Error::format(format!("coordinate out of range: {text:?}")));
    }
    Ok(scaled as i32)
}

/// Serial XML input.
pub struct XmlInput {
    reader: XmlReader<BufReader<File>>,
    header: Header,
    read_types: ReadTypes,
    buffer_capacity: usize,
    scratch: Vec<u8>,
    pending: Option<RawObject>,
    finished: bool,
    failed: bool,
}

impl std::fmt::Debug for XmlInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlInput")
            .field("finished", &self.finished)
            .field("failed", &self.failed)
            .finish()
    }
}

impl XmlInput {
    /// Opens an XML stream and parses up to the first OSM object.
    pub fn open(file: File, options: &ReaderOptions) -> Result<Box<dyn InputFormat>, Error> {
        let mut reader = XmlReader::from_reader(BufReader::new(file));
        reader.trim_text(true);

        let mut input = Self {
            reader,
            header: Header::default(),
            read_types: options.read_types,
            buffer_capacity: options.buffer_capacity,
            scratch: Vec::new(),
            pending: None,
            finished: false,
            failed: false,
        };
        input.parse_prolog()?;
        debug!(generator = ?input.header.generator, "parsed XML prolog");
        Ok(Box::new(input))
    }

    /// Consumes everything up to (and including the attributes of) the
    /// first object element, filling in the header on the way.
    fn parse_prolog(&mut self) -> Result<(), Error> {
        loop {
            self.scratch.clear();
            let event = self
                .reader
                .read_event_into(&mut self.scratch)
                .map_err(xml_err)?;
            match event {
                Event::Decl(_) | Event::Comment(_) | Event::Text(_) | Event::DocType(_) => {}
                Event::Start(e) if e.name().as_ref() == b"osm" => {
                    // Detach from the scratch buffer before re-borrowing self.
                    let e = e.into_owned();
                    self.parse_osm_attrs(&e)?;
                    return self.advance_to_object();
                }
                Event::Empty(e) if e.name().as_ref() == b"osm" => {
                    let e = e.into_owned();
                    self.parse_osm_attrs(&e)?;
                    self.finished = true;
                    return Ok(());
                }
                Event::Eof => {
                    return Err(Error::format("XML input has no <osm> root element"))
                }
                other => {
                    return Err(Error::format(format!(
                        "unexpected XML content before <osm>: {other:?}"
                    )))
                }
            }
        }
    }

    fn parse_osm_attrs(&mut self, e: &BytesStart<'_>) -> Result<(), Error> {
        for attr in e.attributes() {
            let attr = attr.map_err(xml_err)?;
            let value = attr.unescape_value().map_err(xml_err)?;
            match attr.key.as_ref() {
                b"generator" => self.header.generator = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Advances past header-ish children until the next object element is
    /// parsed into `pending`, or the document ends.
    fn advance_to_object(&mut self) -> Result<(), Error> {
        loop {
            self.scratch.clear();
            let event = self
                .reader
                .read_event_into(&mut self.scratch)
                .map_err(xml_err)?;
            match event {
                Event::Start(e) | Event::Empty(e)
                    if e.name().as_ref() == b"bounds" || e.name().as_ref() == b"bound" =>
                {
                    let e = e.into_owned();
                    self.parse_bounds(&e)?;
                }
                Event::Start(e) => {
                    let e = e.into_owned();
                    match object_kind(e.name().as_ref()) {
                        Some(kind) => {
                            let raw = self.parse_object(kind, &e, false)?;
                            self.pending = Some(raw);
                            return Ok(());
                        }
                        None => {
                            return Err(Error::format(format!(
                                "unexpected element <{}>",
                                String::from_utf8_lossy(e.name().as_ref())
                            )))
                        }
                    }
                }
                Event::Empty(e) => {
                    let e = e.into_owned();
                    if let Some(kind) = object_kind(e.name().as_ref()) {
                        let raw = self.parse_object(kind, &e, true)?;
                        self.pending = Some(raw);
                        return Ok(());
                    }
                }
                Event::End(e) if e.name().as_ref() == b"osm" => {
                    self.finished = true;
                    return Ok(());
                }
                Event::Eof => {
                    self.finished = true;
                    return Ok(());
                }
                Event::Comment(_) | Event::Text(_) => {}
                other => {
                    return Err(Error::format(format!(
                        "unexpected XML event: {other:?}"
                    )))
                }
            }
        }
    }

    fn parse_bounds(&mut self, e: &BytesStart<'_>) -> Result<(), Error> {
        let mut bbox = BoundingBox::default();
        for attr in e.attributes() {
            let attr = attr.map_err(xml_err)?;
            let value = attr.unescape_value().map_err(xml_err)?;
            match attr.key.as_ref() {
                b"minlon" => bbox.left = scale_coord(&value)?,
                b"maxlon" => bbox.right = scale_coord(&value)?,
                b"minlat" => bbox.bottom = scale_coord(&value)?,
                b"maxlat" => bbox.top = scale_coord(&value)?,
                _ => {}
            }
        }
        self.header.bbox = Some(bbox);
        Ok(())
    }

    /// Parses one object element (and, unless empty, its children).
    fn parse_object(
        &mut self,
        kind: ItemKind,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<RawObject, Error> {
        let mut raw = RawObject::new(kind);
        let mut lat = None;
        let mut lon = None;

        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            let value = attr.unescape_value().map_err(xml_err)?;
            match attr.key.as_ref() {
                b"id" => {
                    raw.id = value
                        .parse()
                        .map_err(|_| Error::format(format!("bad id: {value:?}")))?;
                }
                b"version" => raw.version = value.parse().unwrap_or(0),
                b"uid" => raw.uid = value.parse().unwrap_or(0),
                b"changeset" => raw.changeset = value.parse().unwrap_or(0),
                b"timestamp" => {
                    raw.timestamp_ms = timestamp_from_iso(&value).ok_or_else(|| {
                        Error::format(format!("bad timestamp: {value:?}"))
                    })?;
                }
                b"visible" => raw.visible = value.as_ref() != "false",
                b"user" => raw.user = value.as_bytes().to_vec(),
                b"lat" => lat = Some(scale_coord(&value)?),
                b"lon" => lon = Some(scale_coord(&value)?),
                _ => {}
            }
        }
        if let (Some(lon), Some(lat)) = (lon, lat) {
            raw.location = Location::new(lon, lat);
        }

        if !empty {
            self.parse_children(&mut raw)?;
        }
        Ok(raw)
    }

    fn parse_children(&mut self, raw: &mut RawObject) -> Result<(), Error> {
        let parent = match raw.kind {
            Some(ItemKind::Node) => b"node".as_slice(),
            Some(ItemKind::Way) => b"way".as_slice(),
            Some(ItemKind::Relation) => b"relation".as_slice(),
            _ => b"changeset".as_slice(),
        };
        let mut scratch = Vec::new();
        loop {
            scratch.clear();
            let event = self
                .reader
                .read_event_into(&mut scratch)
                .map_err(xml_err)?;
            match event {
                Event::Empty(e) | Event::Start(e) => {
                    match e.name().as_ref() {
                        b"tag" => {
                            let mut key = Vec::new();
                            let mut value = Vec::new();
                            for attr in e.attributes() {
                                let attr = attr.map_err(xml_err)?;
                                let text = attr.unescape_value().map_err(xml_err)?;
                                match attr.key.as_ref() {
                                    b"k" => key = text.as_bytes().to_vec(),
                                    b"v" => value = text.as_bytes().to_vec(),
                                    _ => {}
                                }
                            }
                            raw.tags.push((key, value));
                        }
                        b"nd" => {
                            for attr in e.attributes() {
                                let attr = attr.map_err(xml_err)?;
                                if attr.key.as_ref() == b"ref" {
                                    let text = attr.unescape_value().map_err(xml_err)?;
                                    let node_ref = text.parse().map_err(|_| {
                                        Error::format(format!("bad nd ref: {text:?}"))
                                    })?;
                                    raw.refs.push(node_ref);
                                }
                            }
                        }
                        b"member" => {
                            let mut kind = ItemKind::Node;
                            let mut member_id = 0i64;
                            let mut role = Vec::new();
                            for attr in e.attributes() {
                                let attr = attr.map_err(xml_err)?;
                                let text = attr.unescape_value().map_err(xml_err)?;
                                match attr.key.as_ref() {
                                    b"type" => {
                                        kind = member_kind(text.as_bytes()).ok_or_else(
                                            || {
                                                Error::format(format!(
                                                    "bad member type: {text:?}"
                                                ))
                                            },
                                        )?;
                                    }
                                    b"ref" => {
                                        member_id = text.parse().map_err(|_| {
                                            Error::format(format!(
                                                "bad member ref: {text:?}"
                                            ))
                                        })?;
                                    }
                                    b"role" => role = text.as_bytes().to_vec(),
                                    _ => {}
                                }
                            }
                            raw.members.push((kind, member_id, role));
                        }
                        _ => {}
                    }
                }
                Event::End(e) if e.name().as_ref() == parent => return Ok(()),
                Event::End(_) | Event::Comment(_) | Event::Text(_) => {}
                Event::Eof => return Err(Error::format("truncated XML element")),
                other => {
                    return Err(Error::format(format!(
                        "unexpected XML event in object: {other:?}"
                    )))
                }
            }
        }
    }

    fn build_object(&self, buffer: &mut Buffer, raw: &RawObject) -> Result<(), Error> {
        match raw.kind {
            Some(ItemKind::Node) => {
                let mut b = NodeBuilder::new(buffer)?;
                b.id(raw.id)
                    .version(raw.version)
                    .uid(raw.uid)
                    .changeset(raw.changeset)
                    .timestamp(raw.timestamp_ms)
                    .visible(raw.visible)
                    .location(raw.location);
                b.user(&raw.user)?;
                if !raw.tags.is_empty() {
                    let mut tags = b.tags()?;
                    for (k, v) in &raw.tags {
                        tags.add_tag(k, v)?;
                    }
                    tags.finish()?;
                }
                b.finish()?;
            }
            Some(ItemKind::Way) => {
                let mut b = WayBuilder::new(buffer)?;
                b.id(raw.id)
                    .version(raw.version)
                    .uid(raw.uid)
                    .changeset(raw.changeset)
                    .timestamp(raw.timestamp_ms)
                    .visible(raw.visible);
                b.user(&raw.user)?;
                if !raw.refs.is_empty() {
                    let mut refs = b.nodes()?;
                    for node_ref in &raw.refs {
                        refs.add_node_ref(*node_ref, Location::undefined())?;
                    }
                    refs.finish()?;
                }
                if !raw.tags.is_empty() {
                    let mut tags = b.tags()?;
                    for (k, v) in &raw.tags {
                        tags.add_tag(k, v)?;
                    }
                    tags.finish()?;
                }
                b.finish()?;
            }
            Some(ItemKind::Relation) => {
                let mut b = RelationBuilder::new(buffer)?;
                b.id(raw.id)
                    .version(raw.version)
                    .uid(raw.uid)
                    .changeset(raw.changeset)
                    .timestamp(raw.timestamp_ms)
                    .visible(raw.visible);
                b.user(&raw.user)?;
                if !raw.members.is_empty() {
                    let mut members = b.members()?;
                    for (kind, member_id, role) in &raw.members {
                        members.add_member(*kind, *member_id, role)?;
                    }
                    members.finish()?;
                }
                if !raw.tags.is_empty() {
                    let mut tags = b.tags()?;
                    for (k, v) in &raw.tags {
                        tags.add_tag(k, v)?;
                    }
                    tags.finish()?;
                }
                b.finish()?;
            }
            _ => {
                let mut b = ChangesetBuilder::new(buffer)?;
                b.id(raw.id)
                    .uid(raw.uid)
                    .timestamp(raw.timestamp_ms)
                    .visible(raw.visible);
                b.user(&raw.user)?;
                if !raw.tags.is_empty() {
                    let mut tags = b.tags()?;
                    for (k, v) in &raw.tags {
                        tags.add_tag(k, v)?;
                    }
                    tags.finish()?;
                }
                b.finish()?;
            }
        }
        buffer.commit();
        Ok(())
    }
}

impl InputFormat for XmlInput {
    fn header(&self) -> &Header {
        &self.header
    }

    fn next_buffer(&mut self) -> Result<Option<Buffer>, Error> {
        if self.failed {
            return Err(Error::format("stream abandoned after a previous error"));
        }
        if self.finished && self.pending.is_none() {
            return Ok(None);
        }

        let mut buffer = Buffer::with_capacity(self.buffer_capacity, GrowthPolicy::AutoGrow);
        let fill_target = self.buffer_capacity - self.buffer_capacity / 4;

        let result = (|| -> Result<(), Error> {
            while let Some(raw) = self.pending.take() {
                let wanted = raw
                    .kind
                    .map(|k| self.read_types.contains(k))
                    .unwrap_or(false);
                if wanted {
                    self.build_object(&mut buffer, &raw)?;
                }
                if self.finished {
                    break;
                }
                self.advance_to_object()?;
                if buffer.committed() >= fill_target {
                    break;
                }
            }
            Ok(())
        })();

        if let Err(err) = result {
            self.failed = true;
            return Err(err);
        }
        if buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buffer))
        }
    }
}
