//! Serial OSM XML writer.

use std::fs::File;
use std::io::BufWriter;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer as XmlWriter;

use crate::error::Error;
use crate::io::format::OutputFormat;
use crate::io::header::Header;
use crate::io::writer::WriterOptions;
use crate::memory::{Buffer, Item, OsmObject};
use crate::osm::types::{timestamp_to_iso, ItemKind, Location};

fn xml_err(err: impl std::fmt::Display) -> Error {
    Error::format(format!("XML write error: {err}"))
}

fn coord_to_degrees(scaled: i32) -> String {
    format!("{:.7}", f64::from(scaled) / 1e7)
}

/// Serial XML output.
pub struct XmlOutput {
    writer: XmlWriter<BufWriter<File>>,
    closed: bool,
}

impl std::fmt::Debug for XmlOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlOutput")
            .field("closed", &self.closed)
            .finish()
    }
}

impl XmlOutput {
    /// Creates the output and writes the document prolog.
    pub fn create(
        file: File,
        header: &Header,
        _options: &WriterOptions,
    ) -> Result<Box<dyn OutputFormat>, Error> {
        let mut writer = XmlWriter::new_with_indent(BufWriter::new(file), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let mut osm = BytesStart::new("osm");
        osm.push_attribute(("version", "0.6"));
        if let Some(generator) = &header.generator {
            osm.push_attribute(("generator", generator.as_str()));
        }
        writer.write_event(Event::Start(osm)).map_err(xml_err)?;

        if let Some(bbox) = &header.bbox {
            let mut bounds = BytesStart::new("bounds");
            bounds.push_attribute(("minlon", coord_to_degrees(bbox.left).as_str()));
            bounds.push_attribute(("minlat", coord_to_degrees(bbox.bottom).as_str()));
            bounds.push_attribute(("maxlon", coord_to_degrees(bbox.right).as_str()));
            bounds.push_attribute(("maxlat", coord_to_degrees(bbox.top).as_str()));
            writer.write_event(Event::Empty(bounds)).map_err(xml_err)?;
        }

        Ok(Box::new(Self {
            writer,
            closed: false,
        }))
    }

    fn common_attrs<T: OsmObject>(elem: &mut BytesStart<'_>, object: &T) {
        elem.push_attribute(("id", object.id().to_string().as_str()));
        if object.version() != 0 {
            elem.push_attribute(("version", object.version().to_string().as_str()));
        }
        if object.timestamp_ms() != 0 {
            elem.push_attribute(("timestamp", timestamp_to_iso(object.timestamp_ms()).as_str()));
        }
        if object.uid() != 0 {
            elem.push_attribute(("uid", object.uid().to_string().as_str()));
        }
        if !object.user().is_empty() {
            let user = String::from_utf8_lossy(object.user());
            elem.push_attribute(("user", user.as_ref()));
        }
        if object.changeset_id() != 0 {
            elem.push_attribute(("changeset", object.changeset_id().to_string().as_str()));
        }
        if !object.visible() {
            elem.push_attribute(("visible", "false"));
        }
    }

    fn write_tags<T: OsmObject>(&mut self, object: &T) -> Result<(), Error> {
        for tag in object.tags() {
            let mut elem = BytesStart::new("tag");
            elem.push_attribute(("k", String::from_utf8_lossy(tag.key).as_ref()));
            elem.push_attribute(("v", String::from_utf8_lossy(tag.value).as_ref()));
            self.writer
                .write_event(Event::Empty(elem))
                .map_err(xml_err)?;
        }
        Ok(())
    }

    fn location_attrs(elem: &mut BytesStart<'_>, location: Location) {
        if location.is_defined() {
            elem.push_attribute(("lat", coord_to_degrees(location.lat()).as_str()));
            elem.push_attribute(("lon", coord_to_degrees(location.lon()).as_str()));
        }
    }

    fn write_object(&mut self, item: &Item<'_>) -> Result<(), Error> {
        match item {
            Item::Node(node) => {
                let mut elem = BytesStart::new("node");
                Self::common_attrs(&mut elem, node);
                Self::location_attrs(&mut elem, node.location());
                if node.tags().next().is_none() {
                    self.writer
                        .write_event(Event::Empty(elem))
                        .map_err(xml_err)?;
                } else {
                    self.writer
                        .write_event(Event::Start(elem))
                        .map_err(xml_err)?;
                    self.write_tags(node)?;
                    self.writer
                        .write_event(Event::End(BytesEnd::new("node")))
                        .map_err(xml_err)?;
                }
            }
            Item::Way(way) => {
                let mut elem = BytesStart::new("way");
                Self::common_attrs(&mut elem, way);
                self.writer
                    .write_event(Event::Start(elem))
                    .map_err(xml_err)?;
                for node_ref in way.nodes() {
                    let mut nd = BytesStart::new("nd");
                    nd.push_attribute(("ref", node_ref.node_id.to_string().as_str()));
                    self.writer.write_event(Event::Empty(nd)).map_err(xml_err)?;
                }
                self.write_tags(way)?;
                self.writer
                    .write_event(Event::End(BytesEnd::new("way")))
                    .map_err(xml_err)?;
            }
            Item::Relation(relation) => {
                let mut elem = BytesStart::new("relation");
                Self::common_attrs(&mut elem, relation);
                self.writer
                    .write_event(Event::Start(elem))
                    .map_err(xml_err)?;
                for member in relation.members() {
                    let mut m = BytesStart::new("member");
                    let member_type = match member.kind {
                        ItemKind::Way => "way",
                        ItemKind::Relation => "relation",
                        _ => "node",
                    };
                    m.push_attribute(("type", member_type));
                    m.push_attribute(("ref", member.member_id.to_string().as_str()));
                    m.push_attribute(("role", String::from_utf8_lossy(member.role).as_ref()));
                    self.writer.write_event(Event::Empty(m)).map_err(xml_err)?;
                }
                self.write_tags(relation)?;
                self.writer
                    .write_event(Event::End(BytesEnd::new("relation")))
                    .map_err(xml_err)?;
            }
            Item::Changeset(changeset) => {
                let mut elem = BytesStart::new("changeset");
                Self::common_attrs(&mut elem, changeset);
                if changeset.tags().next().is_none() {
                    self.writer
                        .write_event(Event::Empty(elem))
                        .map_err(xml_err)?;
                } else {
                    self.writer
                        .write_event(Event::Start(elem))
                        .map_err(xml_err)?;
                    self.write_tags(changeset)?;
                    self.writer
                        .write_event(Event::End(BytesEnd::new("changeset")))
                        .map_err(xml_err)?;
                }
            }
        }
        Ok(())
    }
}

impl OutputFormat for XmlOutput {
    fn write_buffer(&mut self, buffer: Buffer) -> Result<(), Error> {
        if self.closed {
            return Err(Error::WriterState {
                detail: "write on closed output",
            });
        }
        for item in buffer.items() {
            if let Some(object) = item.decode() {
                self.write_object(&object)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .write_event(Event::End(BytesEnd::new("osm")))
            .map_err(xml_err)?;
        use std::io::Write;
        self.writer.get_mut().flush()?;
        Ok(())
    }
}

impl Drop for XmlOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
