//! Versioned, chunked images for graphs and pathway memories.
//!
//! Layout:
//! - magic: `SYNCACHE`
//! - container version: u32 (LE)
//! - chunks: tag `[u8;4]`, len u32, uncompressed len u32, LZ4 block
//!
//! Each chunk payload is a JSON-encoded schema struct tagged with
//! [`SCHEMA_VERSION`]. The schema structs are decoupled from the in-memory
//! types so either side can change without breaking the other.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::accelerator::AcceleratorConfig;
use crate::error::{Error, Result};
use crate::graph::{Activation, GraphConfig, NetworkSnapshot, NodeId, Weight};
use crate::pathway::{EpisodicSnapshot, MemoryConfig, PathwayRecord, PathwayStrength};

pub const MAGIC: &[u8; 8] = b"SYNCACHE";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

/// Version of the JSON schema carried inside chunks.
pub const SCHEMA_VERSION: u32 = 1;

pub const GRAPH_TAG: [u8; 4] = *b"GRPH";
pub const MEMORY_TAG: [u8; 4] = *b"PMEM";
pub const ENGINE_TAG: [u8; 4] = *b"ACCL";

/// Per-node persisted state. Edge maps are keyed by the far endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeImage {
    pub id: NodeId,
    pub activation: Activation,
    pub trace: Vec<Activation>,
    pub dendrites: BTreeMap<NodeId, Weight>,
    pub axon_terminals: BTreeMap<NodeId, Weight>,
    pub skip_edges: BTreeMap<NodeId, Weight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphImage {
    pub schema: u32,
    pub config: GraphConfig,
    pub passes: u64,
    pub last_output: Vec<f32>,
    pub nodes: Vec<NodeImage>,
    pub snapshots: Vec<NetworkSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryImage {
    pub schema: u32,
    pub config: MemoryConfig,
    pub sequence: u64,
    pub rng_state: u64,
    pub history: Vec<PathwayRecord>,
    pub strengths: Vec<PathwayStrength>,
    pub episodes: Vec<EpisodicSnapshot>,
}

/// Accelerator settings and running counters. Optional in an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineImage {
    pub schema: u32,
    pub config: AcceleratorConfig,
    pub inferences: u64,
    pub nodes_activated: u64,
}

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn write_header<W: Write>(w: &mut W) -> Result<()> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)?;
    Ok(())
}

pub fn read_header<R: Read>(r: &mut R) -> Result<()> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(Error::persistence("bad image magic"));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_CURRENT {
        return Err(Error::persistence(format!(
            "unsupported image version {version}"
        )));
    }
    Ok(())
}

/// Write a chunk: payload is LZ4-compressed and preceded by the uncompressed length (u32).
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| Error::persistence("chunk too large"))?;
    let total_len = u32::try_from(compressed.len())
        .ok()
        .and_then(|n| n.checked_add(4))
        .ok_or_else(|| Error::persistence("chunk too large"))?;

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)?;
    Ok(())
}

pub fn write_json_chunk<W: Write, T: Serialize>(w: &mut W, tag: [u8; 4], value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_chunk_lz4(w, tag, &payload)
}

/// Largest ratio an LZ4 block can expand by.
pub const LZ4_MAX_RATIO: usize = 255;

/// Fill `buf` as far as the reader allows; returns the number of bytes read.
fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Next chunk header, or `None` at a clean end of input.
///
/// A header cut off after its first byte is a persistence error.
fn next_chunk_header<R: Read>(r: &mut R) -> Result<Option<([u8; 4], u32)>> {
    let mut header = [0u8; 8];
    match read_up_to(r, &mut header)? {
        0 => Ok(None),
        8 => {
            let tag = [header[0], header[1], header[2], header[3]];
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            Ok(Some((tag, len)))
        }
        _ => Err(Error::persistence("truncated chunk header")),
    }
}

/// Visit every chunk until EOF, handing `f` the decompressed payload.
///
/// Chunks `f` does not care about are simply ignored, which keeps older
/// readers working on newer images.
pub fn for_each_chunk<R, F>(r: &mut R, mut f: F) -> Result<()>
where
    R: Read,
    F: FnMut([u8; 4], &[u8]) -> Result<()>,
{
    while let Some((tag, len)) = next_chunk_header(r)? {
        if len < 4 {
            return Err(Error::persistence("truncated chunk"));
        }

        let mut take = r.take(len as u64);
        let mut prefix = [0u8; 4];
        if read_up_to(&mut take, &mut prefix)? != 4 {
            return Err(Error::persistence("truncated chunk"));
        }
        let uncompressed_len = u32::from_le_bytes(prefix) as usize;
        let mut compressed = Vec::with_capacity(len as usize - 4);
        take.read_to_end(&mut compressed)?;
        if compressed.len() != len as usize - 4 {
            return Err(Error::persistence("truncated chunk"));
        }
        if uncompressed_len > compressed.len().saturating_mul(LZ4_MAX_RATIO) {
            return Err(Error::persistence("chunk declares an impossible uncompressed length"));
        }

        let payload = decompress_lz4(&compressed, uncompressed_len)?;
        f(tag, &payload)?;
    }
    Ok(())
}

pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut bytes = Vec::new();
        write_header(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 12);
        read_header(&mut std::io::Cursor::new(bytes)).unwrap();
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut cursor = std::io::Cursor::new(b"NOTMAGIC\x01\x00\x00\x00".to_vec());
        assert!(matches!(read_header(&mut cursor), Err(Error::Persistence(_))));

        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(read_header(&mut cursor), Err(Error::Persistence(_))));
    }

    #[test]
    fn empty_input_is_an_io_error() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_header(&mut cursor), Err(Error::Io(_))));
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut bytes = Vec::new();
        write_chunk_lz4(&mut bytes, *b"ZZZZ", b"ignored payload").unwrap();
        write_json_chunk(&mut bytes, GRAPH_TAG, &vec![1u32, 2, 3]).unwrap();

        let mut seen = Vec::new();
        let mut decoded: Option<Vec<u32>> = None;
        for_each_chunk(&mut std::io::Cursor::new(bytes), |tag, payload| {
            seen.push(tag);
            if tag == GRAPH_TAG {
                decoded = Some(decode_json(payload)?);
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, vec![*b"ZZZZ", GRAPH_TAG]);
        assert_eq!(decoded, Some(vec![1, 2, 3]));
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let mut bytes = Vec::new();
        write_chunk_lz4(&mut bytes, GRAPH_TAG, b"some payload bytes").unwrap();
        bytes.truncate(bytes.len() - 3);
        let res = for_each_chunk(&mut std::io::Cursor::new(bytes), |_, _| Ok(()));
        assert!(res.is_err());
    }

    #[test]
    fn partial_chunk_header_is_rejected() {
        let mut bytes = Vec::new();
        write_json_chunk(&mut bytes, GRAPH_TAG, &vec![1u32]).unwrap();
        let whole = bytes.len();
        write_json_chunk(&mut bytes, ENGINE_TAG, &vec![2u32]).unwrap();

        // Every cut inside the second header must fail, not end the stream.
        for cut in 1..8 {
            let res = for_each_chunk(&mut std::io::Cursor::new(&bytes[..whole + cut]), |_, _| Ok(()));
            assert!(matches!(res, Err(Error::Persistence(_))), "cut {cut}");
        }

        // A cut exactly between chunks is a clean end.
        let mut seen = Vec::new();
        for_each_chunk(&mut std::io::Cursor::new(&bytes[..whole]), |tag, _| {
            seen.push(tag);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![GRAPH_TAG]);
    }

    #[test]
    fn oversized_uncompressed_length_is_rejected() {
        let mut bytes = Vec::new();
        write_chunk_lz4(&mut bytes, GRAPH_TAG, b"tiny").unwrap();
        // Uncompressed length sits right after tag and chunk length.
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        let res = for_each_chunk(&mut std::io::Cursor::new(bytes), |_, _| Ok(()));
        assert!(matches!(res, Err(Error::Persistence(_))));
    }

    #[test]
    fn malformed_json_surfaces_as_error() {
        let res: Result<Vec<u32>> = decode_json(b"{not json");
        assert!(matches!(res, Err(Error::Json(_))));
    }

    #[test]
    fn counting_writer_counts() {
        let mut cw = CountingWriter::new();
        write_header(&mut cw).unwrap();
        assert_eq!(cw.written(), 12);
    }
}
