//! Ring and builder files.
//!
//! A file is a gzip stream whose decompressed content starts with a 16-byte
//! ASCII header naming the entity and its format version, followed by the
//! postcard-encoded record:
//!
//! ```text
//! gzip( "RINGv00000000001"  ‖ postcard(Ring) )
//! gzip( "RINGBUILDERv0001"  ‖ postcard(Builder) )
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::debug;

use crate::builder::Builder;
use crate::error::RingError;
use crate::ring::Ring;

const HEADER_LEN: usize = 16;
const RING_MAGIC: &[u8] = b"RINGv";
const BUILDER_MAGIC: &[u8] = b"RINGBUILDERv";
const RING_HEADER: &[u8; HEADER_LEN] = b"RINGv00000000001";
const BUILDER_HEADER: &[u8; HEADER_LEN] = b"RINGBUILDERv0001";

/// Contents of a ring or builder file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingOrBuilder {
    Ring(Ring),
    Builder(Builder),
}

impl From<Ring> for RingOrBuilder {
    fn from(ring: Ring) -> Self {
        Self::Ring(ring)
    }
}

impl From<Builder> for RingOrBuilder {
    fn from(builder: Builder) -> Self {
        Self::Builder(builder)
    }
}

/// Something that can be written as a ring file.
pub trait Persist {
    /// Write the compressed, header-tagged stream to `writer`.
    fn persist<W: Write>(&self, writer: W) -> Result<(), RingError>;
}

impl Persist for Ring {
    fn persist<W: Write>(&self, writer: W) -> Result<(), RingError> {
        write_record(writer, RING_HEADER, self)
    }
}

impl Persist for Builder {
    fn persist<W: Write>(&self, writer: W) -> Result<(), RingError> {
        write_record(writer, BUILDER_HEADER, self)
    }
}

impl Persist for RingOrBuilder {
    fn persist<W: Write>(&self, writer: W) -> Result<(), RingError> {
        match self {
            Self::Ring(ring) => ring.persist(writer),
            Self::Builder(builder) => builder.persist(writer),
        }
    }
}

impl Ring {
    /// Read a ring stream. A builder stream is rejected.
    pub fn load<R: Read>(reader: R) -> Result<Ring, RingError> {
        match read_record(reader)? {
            RingOrBuilder::Ring(ring) => Ok(ring),
            RingOrBuilder::Builder(_) => Err(RingError::UnrecognizedFormat(
                "expected a ring, found a builder".to_string(),
            )),
        }
    }
}

impl Builder {
    /// Read a builder stream. A ring stream is rejected.
    pub fn load<R: Read>(reader: R) -> Result<Builder, RingError> {
        match read_record(reader)? {
            RingOrBuilder::Builder(builder) => Ok(builder),
            RingOrBuilder::Ring(_) => Err(RingError::UnrecognizedFormat(
                "expected a builder, found a ring".to_string(),
            )),
        }
    }
}

/// Read a stream and decide from its header whether it holds a ring or a
/// builder.
pub fn read_record<R: Read>(reader: R) -> Result<RingOrBuilder, RingError> {
    let mut data = Vec::new();
    GzDecoder::new(reader).read_to_end(&mut data)?;
    if data.len() < HEADER_LEN {
        return Err(RingError::UnrecognizedFormat(
            String::from_utf8_lossy(&data).into_owned(),
        ));
    }
    let (header, body) = data.split_at(HEADER_LEN);

    if let Some(version) = header.strip_prefix(BUILDER_MAGIC) {
        check_version("builder", version, &BUILDER_HEADER[BUILDER_MAGIC.len()..])?;
        let builder: Builder = decode(body)?;
        builder.validate()?;
        Ok(RingOrBuilder::Builder(builder))
    } else if let Some(version) = header.strip_prefix(RING_MAGIC) {
        check_version("ring", version, &RING_HEADER[RING_MAGIC.len()..])?;
        let ring: Ring = decode(body)?;
        ring.validate()?;
        Ok(RingOrBuilder::Ring(ring))
    } else {
        Err(RingError::UnrecognizedFormat(
            String::from_utf8_lossy(header).into_owned(),
        ))
    }
}

/// Load a ring or builder file.
pub fn load_ring_or_builder(path: impl AsRef<Path>) -> Result<RingOrBuilder, RingError> {
    let file = File::open(path.as_ref())?;
    read_record(BufReader::new(file))
}

/// Write `value` to `path` atomically.
///
/// The stream goes to a temporary sibling file which is flushed, synced and
/// then renamed over `path`. On any failure `path` is left untouched and the
/// temporary file is removed.
pub fn persist_to_path<P: Persist>(value: &P, path: impl AsRef<Path>) -> Result<(), RingError> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let prefix = match path.file_name() {
        Some(name) => format!("{}.", name.to_string_lossy()),
        None => ".ring.".to_string(),
    };

    let mut tmp = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        value.persist(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RingError::Io(e.error))?;

    debug!(path = %path.display(), "persisted ring file");
    Ok(())
}

fn write_record<W: Write, T: Serialize>(
    writer: W,
    header: &[u8; HEADER_LEN],
    record: &T,
) -> Result<(), RingError> {
    let body = postcard::to_allocvec(record).map_err(|e| RingError::Serialization(e.to_string()))?;
    let mut encoder = GzEncoder::new(writer, Compression::default());
    encoder.write_all(header)?;
    encoder.write_all(&body)?;
    encoder.finish()?;
    Ok(())
}

fn check_version(entity: &'static str, found: &[u8], expected: &[u8]) -> Result<(), RingError> {
    if found == expected {
        Ok(())
    } else {
        Err(RingError::UnsupportedVersion {
            entity,
            version: String::from_utf8_lossy(found).into_owned(),
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, RingError> {
    postcard::from_bytes(body).map_err(|e| RingError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_builder() -> Builder {
        let mut b = Builder::new();
        b.set_replica_count(2).unwrap();
        b.set_partition_bits(6).unwrap();
        b.add_node(true, 1, &["zone-a", "rack-1"], &["127.0.0.1:9999"], "alpha", b"Conf")
            .unwrap();
        b.add_node(true, 2, &["zone-b", "rack-1"], &["127.0.0.1:8888"], "beta", b"")
            .unwrap();
        b.add_node(false, 1, &[], &["127.0.0.1:7777"], "gamma", b"")
            .unwrap();
        b
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_ring_persist_and_load() {
        let mut b = sample_builder();
        let ring = b.ring().unwrap().with_local_node(2).unwrap();

        let mut buf = Vec::new();
        ring.persist(&mut buf).unwrap();
        let loaded = Ring::load(buf.as_slice()).unwrap();

        assert_eq!(loaded, ring);
        assert_eq!(loaded.version(), 1);
        assert_eq!(loaded.local_node().unwrap().meta(), "beta");
    }

    #[test]
    fn test_builder_persist_and_load_keeps_baseline() {
        let mut b = sample_builder();
        let first = b.ring().unwrap();

        let mut buf = Vec::new();
        b.persist(&mut buf).unwrap();
        let mut loaded = Builder::load(buf.as_slice()).unwrap();
        assert_eq!(loaded, b);

        // The reloaded builder continues the same lineage.
        let next = loaded.ring().unwrap();
        assert_eq!(next.version(), first.version() + 1);
        assert_eq!(first.moved_partitions(&next), 0);
    }

    #[test]
    fn test_stream_is_gzip_with_header() {
        let mut buf = Vec::new();
        sample_builder().persist(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x1f, 0x8b]);

        let mut plain = Vec::new();
        GzDecoder::new(buf.as_slice())
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(&plain[..HEADER_LEN], BUILDER_HEADER);
    }

    #[test]
    fn test_wrong_entity_is_rejected() {
        let mut buf = Vec::new();
        sample_builder().persist(&mut buf).unwrap();
        assert!(matches!(
            Ring::load(buf.as_slice()),
            Err(RingError::UnrecognizedFormat(_))
        ));
    }

    #[test]
    fn test_unknown_header_is_rejected() {
        let data = gzip(b"NOTARINGFILE0000 and some trailing bytes");
        assert!(matches!(
            read_record(data.as_slice()),
            Err(RingError::UnrecognizedFormat(_))
        ));

        let short = gzip(b"RING");
        assert!(matches!(
            read_record(short.as_slice()),
            Err(RingError::UnrecognizedFormat(_))
        ));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let data = gzip(b"RINGv00000000009");
        match read_record(data.as_slice()) {
            Err(RingError::UnsupportedVersion { entity, version }) => {
                assert_eq!(entity, "ring");
                assert_eq!(version, "00000000009");
            }
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_ring_is_rejected() {
        let cases: [(&str, fn(&mut Ring)); 8] = [
            ("zero bits", |r| r.partition_bits = 0),
            ("too many bits", |r| r.partition_bits = 40),
            ("short assignment", |r| r.assignment.truncate(10)),
            ("short owner row", |r| r.assignment[3].truncate(1)),
            ("unknown owner", |r| r.assignment[0][0] = 99),
            ("unsorted nodes", |r| r.nodes.reverse()),
            ("unknown local node", |r| r.local_node_id = Some(99)),
            ("zero replicas", |r| r.replica_count = 0),
        ];
        for (name, edit) in cases {
            let mut ring = sample_builder().ring().unwrap();
            edit(&mut ring);
            let mut buf = Vec::new();
            ring.persist(&mut buf).unwrap();

            let result = Ring::load(buf.as_slice());
            assert!(
                matches!(result, Err(RingError::Corrupt(_))),
                "{name}: got {result:?}"
            );
        }
    }

    #[test]
    fn test_not_gzip_is_an_io_error() {
        let err = read_record(&b"plain text, not gzip"[..]).unwrap_err();
        assert!(matches!(err, RingError::Io(_)));
    }

    #[test]
    fn test_persist_to_path_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = sample_builder();
        let ring = b.ring().unwrap();

        let ring_path = dir.path().join("test.ring");
        let builder_path = dir.path().join("test.builder");
        persist_to_path(&ring, &ring_path).unwrap();
        persist_to_path(&b, &builder_path).unwrap();

        match load_ring_or_builder(&ring_path).unwrap() {
            RingOrBuilder::Ring(loaded) => assert_eq!(loaded, ring),
            other => panic!("expected a ring, got {other:?}"),
        }
        match load_ring_or_builder(&builder_path).unwrap() {
            RingOrBuilder::Builder(loaded) => assert_eq!(loaded, b),
            other => panic!("expected a builder, got {other:?}"),
        }

        // Only the two destination files remain.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_persist_to_path_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ring");
        let mut b = sample_builder();
        let first = b.ring().unwrap();
        let second = b.ring().unwrap();

        persist_to_path(&first, &path).unwrap();
        persist_to_path(&RingOrBuilder::from(second.clone()), &path).unwrap();

        let loaded = Ring::load(File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded.version(), second.version());
    }

    #[test]
    fn test_persist_to_missing_directory_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("test.ring");
        let mut b = sample_builder();
        let ring = b.ring().unwrap();

        assert!(matches!(persist_to_path(&ring, &path), Err(RingError::Io(_))));
        assert!(!path.exists());
    }
}
