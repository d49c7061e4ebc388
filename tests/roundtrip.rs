//! End-to-end read/write scenarios over real files.

use std::fs::File;
use std::io::Write as _;

use prost::Message;

use osmflow::io::pbf::{proto, BlobWriter, OSM_DATA_TYPE, OSM_HEADER_TYPE};
use osmflow::{
    apply, Buffer, Error, GrowthPolicy, Handler, Header, Item, ItemKind, Location, Node,
    NodeBuilder, OsmObject, Overwrite, ReadTypes, Reader, ReaderOptions, RelationBuilder, Way,
    WayBuilder, Writer, WriterOptions,
};

fn node_buffer(start_id: i64, count: i64) -> Buffer {
    let mut buf = Buffer::with_capacity(4 * 1024 * 1024, GrowthPolicy::AutoGrow);
    for id in start_id..start_id + count {
        let mut b = NodeBuilder::new(&mut buf).unwrap();
        b.id(id)
            .version(1)
            .timestamp(1_000_000_000_000 + id)
            .location(Location::new((id % 1000) as i32, (id % 500) as i32));
        b.user(b"roundtrip").unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    buf
}

fn collect_ids(reader: &mut Reader) -> Result<Vec<i64>, Error> {
    let mut ids = Vec::new();
    while let Some(buffer) = reader.next_buffer()? {
        for item in buffer.items() {
            ids.push(item.decode().unwrap().id());
        }
    }
    Ok(ids)
}

#[test]
fn write_then_read_preserves_objects_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.osm.pbf");

    let header = Header {
        generator: Some("osmflow-test".to_owned()),
        ..Header::default()
    };
    let mut writer = Writer::create(&path, &header).unwrap();
    for chunk in 0..3 {
        writer.write(node_buffer(chunk * 5000, 5000)).unwrap();
    }
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(reader.header().generator.as_deref(), Some("osmflow-test"));
    let ids = collect_ids(&mut reader).unwrap();
    let expected: Vec<i64> = (0..15_000).collect();
    assert_eq!(ids, expected);
}

#[test]
fn thread_counts_yield_identical_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("many-blobs.osm.pbf");

    // Many small buffers make many data blobs, maximizing reorder
    // opportunity in the pool.
    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    for chunk in 0..200 {
        writer.write(node_buffer(chunk * 50, 50)).unwrap();
    }
    writer.close().unwrap();

    let mut baseline = None;
    for num_threads in [0usize, 1, 4, 16] {
        let mut reader = Reader::with_options(
            &path,
            &osmflow::FormatRegistry::with_defaults(),
            ReaderOptions::default().num_threads(num_threads),
        )
        .unwrap();
        let ids = collect_ids(&mut reader).unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not monotone");
        match &baseline {
            None => baseline = Some(ids),
            Some(expected) => assert_eq!(&ids, expected, "num_threads={num_threads}"),
        }
    }
    assert_eq!(baseline.unwrap().len(), 10_000);
}

#[test]
fn mixed_object_kinds_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.osm.pbf");

    let mut buf = Buffer::with_capacity(1024 * 1024, GrowthPolicy::AutoGrow);
    {
        let mut b = NodeBuilder::new(&mut buf).unwrap();
        b.id(1)
            .version(2)
            .uid(10)
            .changeset(500)
            .timestamp(1_300_000_000_000)
            .location(Location::new(123_456_7, -765_432_1));
        b.user(b"n\xc3\xb8de").unwrap();
        let mut tags = b.tags().unwrap();
        tags.add_tag(b"amenity", b"fountain").unwrap();
        tags.finish().unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    {
        let mut b = WayBuilder::new(&mut buf).unwrap();
        b.id(2).version(1);
        b.user(b"mapper").unwrap();
        let mut refs = b.nodes().unwrap();
        for r in [1i64, 5, 9] {
            refs.add_node_ref(r, Location::undefined()).unwrap();
        }
        refs.finish().unwrap();
        let mut tags = b.tags().unwrap();
        tags.add_tag(b"highway", b"path").unwrap();
        tags.finish().unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    {
        let mut b = RelationBuilder::new(&mut buf).unwrap();
        b.id(3);
        b.user(b"mapper").unwrap();
        let mut members = b.members().unwrap();
        members.add_member(ItemKind::Way, 2, b"outer").unwrap();
        members.add_member(ItemKind::Node, 1, b"label").unwrap();
        members.finish().unwrap();
        b.finish().unwrap();
        buf.commit();
    }

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buf).unwrap();
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let buffer = reader.next_buffer().unwrap().unwrap();
    let items: Vec<_> = buffer.items().collect();
    assert_eq!(items.len(), 3);

    match items[0].decode().unwrap() {
        Item::Node(n) => {
            assert_eq!(n.id(), 1);
            assert_eq!(n.version(), 2);
            assert_eq!(n.uid(), 10);
            assert_eq!(n.changeset_id(), 500);
            assert_eq!(n.timestamp_ms(), 1_300_000_000_000);
            assert_eq!(n.location(), Location::new(123_456_7, -765_432_1));
            assert_eq!(n.user(), "nøde".as_bytes());
            let tags: Vec<_> = n.tags().collect();
            assert_eq!(tags[0].key, b"amenity");
            assert_eq!(tags[0].value, b"fountain");
        }
        other => panic!("expected node, got {other:?}"),
    }
    match items[1].decode().unwrap() {
        Item::Way(w) => {
            assert_eq!(w.id(), 2);
            let refs: Vec<i64> = w.nodes().map(|n| n.node_id).collect();
            assert_eq!(refs, vec![1, 5, 9]);
        }
        other => panic!("expected way, got {other:?}"),
    }
    match items[2].decode().unwrap() {
        Item::Relation(r) => {
            let members: Vec<_> = r.members().collect();
            assert_eq!(members.len(), 2);
            assert_eq!(members[0].kind, ItemKind::Way);
            assert_eq!(members[0].member_id, 2);
            assert_eq!(members[0].role, b"outer");
        }
        other => panic!("expected relation, got {other:?}"),
    }
    assert!(reader.next_buffer().unwrap().is_none());
}

#[test]
fn unknown_required_feature_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unknown-feature.osm.pbf");

    let header_block = proto::HeaderBlock {
        bbox: None,
        required_features: vec!["OsmSchema-V0.6".to_owned(), "Unknown".to_owned()],
        optional_features: vec![],
        writingprogram: Some("test".to_owned()),
        source: None,
    };
    let file = File::create(&path).unwrap();
    let mut blob_writer = BlobWriter::new(file);
    blob_writer
        .write_blob(OSM_HEADER_TYPE, &header_block.encode_to_vec(), false)
        .unwrap();
    blob_writer.flush().unwrap();

    let err = Reader::open(&path).unwrap_err();
    match err {
        Error::UnsupportedFeature { feature } => assert_eq!(feature, "Unknown"),
        other => panic!("expected unsupported-feature, got {other:?}"),
    }
}

#[test]
fn lzma_blob_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lzma.osm.pbf");

    let mut file = File::create(&path).unwrap();
    {
        let mut blob_writer = BlobWriter::new(&mut file);
        let header_block = proto::HeaderBlock {
            bbox: None,
            required_features: vec![],
            optional_features: vec![],
            writingprogram: None,
            source: None,
        };
        blob_writer
            .write_blob(OSM_HEADER_TYPE, &header_block.encode_to_vec(), false)
            .unwrap();
    }
    // Hand-frame a data blob with only lzma_data set.
    let blob = proto::Blob {
        raw: None,
        raw_size: Some(10),
        zlib_data: None,
        lzma_data: Some(vec![0u8; 10]),
    }
    .encode_to_vec();
    let blob_header = proto::BlobHeader {
        r#type: Some(OSM_DATA_TYPE.to_owned()),
        indexdata: None,
        datasize: Some(blob.len() as i32),
    }
    .encode_to_vec();
    file.write_all(&(blob_header.len() as u32).to_be_bytes())
        .unwrap();
    file.write_all(&blob_header).unwrap();
    file.write_all(&blob).unwrap();
    drop(file);

    let mut reader = Reader::open(&path).unwrap();
    let err = reader.next_buffer().unwrap_err();
    assert!(matches!(err, Error::UnsupportedCompression));
    // The stream is abandoned afterwards.
    assert!(reader.next_buffer().is_err());
}

#[test]
fn truncation_fails_after_preceding_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.osm.pbf");

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    for chunk in 0..10 {
        writer.write(node_buffer(chunk * 100, 100)).unwrap();
    }
    writer.close().unwrap();

    // Cut the file in the middle of the last blob body.
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 20]).unwrap();

    let mut reader = Reader::with_options(
        &path,
        &osmflow::FormatRegistry::with_defaults(),
        ReaderOptions::default().num_threads(0),
    )
    .unwrap();

    let mut ids = Vec::new();
    let err = loop {
        match reader.next_buffer() {
            Ok(Some(buffer)) => {
                for item in buffer.items() {
                    ids.push(item.decode().unwrap().id());
                }
            }
            Ok(None) => panic!("expected an error before clean EOF"),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::Io(_)), "got {err:?}");
    // Everything before the truncated blob was delivered intact.
    assert_eq!(ids.len(), 900);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn write_item_staging_path() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.osm.pbf");
    let copy_path = dir.path().join("copy.osm.pbf");

    let mut writer = Writer::create(&source_path, &Header::default()).unwrap();
    writer.write(node_buffer(0, 1000)).unwrap();
    writer.close().unwrap();

    // Copy item-at-a-time through a tiny staging buffer to force flushes.
    let mut reader = Reader::open(&source_path).unwrap();
    let mut copier = Writer::with_options(
        &copy_path,
        &osmflow::FormatRegistry::with_defaults(),
        &Header::default(),
        WriterOptions {
            buffer_capacity: 4096,
            ..WriterOptions::default()
        },
    )
    .unwrap();
    while let Some(buffer) = reader.next_buffer().unwrap() {
        for item in buffer.items() {
            copier.write_item(item).unwrap();
        }
    }
    copier.close().unwrap();

    let mut reader = Reader::open(&copy_path).unwrap();
    let ids = collect_ids(&mut reader).unwrap();
    let expected: Vec<i64> = (0..1000).collect();
    assert_eq!(ids, expected);
}

#[test]
fn overwrite_policy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exists.osm.pbf");

    Writer::create(&path, &Header::default())
        .unwrap()
        .close()
        .unwrap();

    let err = Writer::create(&path, &Header::default()).unwrap_err();
    assert!(matches!(err, Error::FileExists { .. }));

    let mut writer = Writer::with_options(
        &path,
        &osmflow::FormatRegistry::with_defaults(),
        &Header::default(),
        WriterOptions::default().overwrite(Overwrite::Allow),
    )
    .unwrap();
    writer.close().unwrap();
}

#[test]
fn writer_state_machine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("states.osm.pbf");

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(node_buffer(0, 10)).unwrap();
    writer.close().unwrap();
    // close is idempotent; writing afterwards is refused.
    writer.close().unwrap();
    let err = writer.write(node_buffer(0, 1)).unwrap_err();
    assert!(matches!(err, Error::WriterState { .. }));
}

#[test]
fn header_only_file_yields_no_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.osm.pbf");

    Writer::create(&path, &Header::default())
        .unwrap()
        .close()
        .unwrap();

    let mut reader = Reader::open(&path).unwrap();
    assert!(reader.next_buffer().unwrap().is_none());
    assert!(reader.next_buffer().unwrap().is_none());
}

#[test]
fn read_type_filter_drops_excluded_objects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filtered.osm.pbf");

    let mut buf = Buffer::with_capacity(1024 * 1024, GrowthPolicy::AutoGrow);
    {
        let mut b = NodeBuilder::new(&mut buf).unwrap();
        b.id(1);
        b.user(b"").unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    {
        let mut b = WayBuilder::new(&mut buf).unwrap();
        b.id(2);
        b.user(b"").unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buf).unwrap();
    writer.close().unwrap();

    let mut reader = Reader::with_options(
        &path,
        &osmflow::FormatRegistry::with_defaults(),
        ReaderOptions::default().read_types(ReadTypes::WAYS),
    )
    .unwrap();
    let ids = collect_ids(&mut reader).unwrap();
    assert_eq!(ids, vec![2]);
}

#[derive(Default)]
struct Recorder {
    events: Vec<String>,
    nodes: u64,
    ways: u64,
}

impl Handler for Recorder {
    fn init(&mut self) {
        self.events.push("init".to_owned());
    }
    fn before_nodes(&mut self) {
        self.events.push("before_nodes".to_owned());
    }
    fn node(&mut self, _node: &Node<'_>) {
        self.nodes += 1;
    }
    fn after_nodes(&mut self) {
        self.events.push("after_nodes".to_owned());
    }
    fn before_ways(&mut self) {
        self.events.push("before_ways".to_owned());
    }
    fn way(&mut self, _way: &Way<'_>) {
        self.ways += 1;
    }
    fn after_ways(&mut self) {
        self.events.push("after_ways".to_owned());
    }
    fn done(&mut self) {
        self.events.push("done".to_owned());
    }
}

#[test]
fn handler_lifecycle_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("handler.osm.pbf");

    let mut buf = Buffer::with_capacity(1024 * 1024, GrowthPolicy::AutoGrow);
    for id in 0..5i64 {
        let mut b = NodeBuilder::new(&mut buf).unwrap();
        b.id(id);
        b.user(b"").unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    for id in 5..8i64 {
        let mut b = WayBuilder::new(&mut buf).unwrap();
        b.id(id);
        b.user(b"").unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buf).unwrap();
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let mut recorder = Recorder::default();
    apply(&mut reader, &mut recorder).unwrap();

    assert_eq!(recorder.nodes, 5);
    assert_eq!(recorder.ways, 3);
    assert_eq!(
        recorder.events,
        vec!["init", "before_nodes", "after_nodes", "before_ways", "after_ways", "done"]
    );
}

#[test]
fn xml_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.osm");

    let mut buf = Buffer::with_capacity(1024 * 1024, GrowthPolicy::AutoGrow);
    {
        let mut b = NodeBuilder::new(&mut buf).unwrap();
        b.id(10)
            .version(3)
            .uid(77)
            .changeset(1234)
            .timestamp(1_331_737_766_000)
            .location(Location::new(41_234_567, -7_654_321));
        b.user(b"xml <mapper>").unwrap();
        let mut tags = b.tags().unwrap();
        tags.add_tag(b"name", b"Caf\xc3\xa9 \"Quote\" & Co").unwrap();
        tags.finish().unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    {
        let mut b = WayBuilder::new(&mut buf).unwrap();
        b.id(11).version(1);
        b.user(b"xml <mapper>").unwrap();
        let mut refs = b.nodes().unwrap();
        refs.add_node_ref(10, Location::undefined()).unwrap();
        refs.add_node_ref(12, Location::undefined()).unwrap();
        refs.finish().unwrap();
        b.finish().unwrap();
        buf.commit();
    }
    {
        let mut b = RelationBuilder::new(&mut buf).unwrap();
        b.id(12).version(1);
        b.user(b"").unwrap();
        let mut members = b.members().unwrap();
        members.add_member(ItemKind::Way, 11, b"outer").unwrap();
        members.finish().unwrap();
        b.finish().unwrap();
        buf.commit();
    }

    let header = Header {
        generator: Some("osmflow-xml-test".to_owned()),
        ..Header::default()
    };
    let mut writer = Writer::create(&path, &header).unwrap();
    writer.write(buf).unwrap();
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(
        reader.header().generator.as_deref(),
        Some("osmflow-xml-test")
    );
    let buffer = reader.next_buffer().unwrap().unwrap();
    let items: Vec<_> = buffer.items().collect();
    assert_eq!(items.len(), 3);

    match items[0].decode().unwrap() {
        Item::Node(n) => {
            assert_eq!(n.id(), 10);
            assert_eq!(n.version(), 3);
            assert_eq!(n.uid(), 77);
            assert_eq!(n.changeset_id(), 1234);
            assert_eq!(n.timestamp_ms(), 1_331_737_766_000);
            assert_eq!(n.location(), Location::new(41_234_567, -7_654_321));
            assert_eq!(n.user(), b"xml <mapper>");
            let tags: Vec<_> = n.tags().collect();
            assert_eq!(tags[0].key, b"name");
            assert_eq!(tags[0].value, "Café \"Quote\" & Co".as_bytes());
        }
        other => panic!("expected node, got {other:?}"),
    }
    match items[1].decode().unwrap() {
        Item::Way(w) => {
            let refs: Vec<i64> = w.nodes().map(|n| n.node_id).collect();
            assert_eq!(refs, vec![10, 12]);
        }
        other => panic!("expected way, got {other:?}"),
    }
    match items[2].decode().unwrap() {
        Item::Relation(r) => {
            let members: Vec<_> = r.members().collect();
            assert_eq!(members[0].member_id, 11);
            assert_eq!(members[0].role, b"outer");
        }
        other => panic!("expected relation, got {other:?}"),
    }
}

#[test]
fn pbf_to_xml_to_pbf() {
    let dir = tempfile::tempdir().unwrap();
    let pbf_path = dir.path().join("a.osm.pbf");
    let xml_path = dir.path().join("b.osm");
    let back_path = dir.path().join("c.osm.pbf");

    let mut writer = Writer::create(&pbf_path, &Header::default()).unwrap();
    writer.write(node_buffer(0, 100)).unwrap();
    writer.close().unwrap();

    // PBF -> XML
    let mut reader = Reader::open(&pbf_path).unwrap();
    let mut writer = Writer::create(&xml_path, &Header::default()).unwrap();
    while let Some(buffer) = reader.next_buffer().unwrap() {
        writer.write(buffer).unwrap();
    }
    writer.close().unwrap();

    // XML -> PBF
    let mut reader = Reader::open(&xml_path).unwrap();
    let mut writer = Writer::create(&back_path, &Header::default()).unwrap();
    while let Some(buffer) = reader.next_buffer().unwrap() {
        writer.write(buffer).unwrap();
    }
    writer.close().unwrap();

    let mut reader = Reader::open(&back_path).unwrap();
    let ids = collect_ids(&mut reader).unwrap();
    let expected: Vec<i64> = (0..100).collect();
    assert_eq!(ids, expected);
}

#[test]
fn unsupported_extension_is_rejected() {
    let err = Reader::open("/tmp/definitely-missing.txt").unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat { .. }));
}
