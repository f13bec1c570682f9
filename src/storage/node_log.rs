//! Append-only node log, one per shard.
//!
//! File layout:
//! ```text
//! [magic "MBNL": 4] [version: u16 LE] [shard_id: u16 LE] [reserved: 8]   // 16-byte header
//! [len: u32 LE] [checksum: u32 LE] [bincode(Node): len]                  // record, repeated
//! ```
//!
//! `checksum` is the first four bytes of BLAKE3 over the record body.
//! A crash mid-append leaves a short or corrupt tail; replay stops at the
//! first bad record and the writer truncates the file back to the last
//! good one.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{AncestryError, Result};
use crate::types::{Node, ShardId};

pub const LOG_MAGIC: [u8; 4] = *b"MBNL";
pub const LOG_VERSION: u16 = 1;
pub const LOG_HEADER_SIZE: usize = 16;

/// len(4) + checksum(4)
const RECORD_PREFIX_SIZE: usize = 8;

/// Records above this size are treated as corruption.
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

pub const LOG_FILE_NAME: &str = "nodes.log";

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[offset..offset + 2]);
    u16::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn checksum(body: &[u8]) -> u32 {
    let hash = blake3::hash(body);
    read_u32(hash.as_bytes(), 0)
}

// ── Header ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub shard_id: ShardId,
}

impl LogHeader {
    pub fn new(shard_id: ShardId) -> Self {
        Self { magic: LOG_MAGIC, version: LOG_VERSION, shard_id }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != LOG_MAGIC {
            return Err(AncestryError::InvalidFormat(format!(
                "Not a node log: expected MBNL, got {:?}",
                self.magic
            )));
        }
        if self.version != LOG_VERSION {
            return Err(AncestryError::InvalidFormat(format!(
                "Unsupported node log version: {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LOG_HEADER_SIZE {
            return Err(AncestryError::InvalidFormat("File too small for node log".into()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let header = Self {
            magic,
            version: read_u16(bytes, 4),
            shard_id: read_u16(bytes, 6),
        };
        header.validate()?;
        Ok(header)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.shard_id.to_le_bytes())?;
        writer.write_all(&[0u8; 8])?; // reserved
        Ok(())
    }
}

// ── Replay ─────────────────────────────────────────────────────────

/// Result of scanning a node log.
#[derive(Debug)]
pub struct LogReplay {
    pub nodes: Vec<Node>,
    /// Offset just past the last intact record.
    pub valid_len: u64,
    /// Bytes past `valid_len` that will be discarded.
    pub torn_bytes: u64,
}

/// Decode records from the body of a log (bytes after the header).
///
/// Returns the decoded nodes and the number of body bytes they cover.
pub fn decode_records(body: &[u8]) -> (Vec<Node>, usize) {
    let mut nodes = Vec::new();
    let mut pos = 0;
    while body.len() - pos >= RECORD_PREFIX_SIZE {
        let len = read_u32(body, pos) as usize;
        let expected = read_u32(body, pos + 4);
        let start = pos + RECORD_PREFIX_SIZE;
        if len == 0 || len > MAX_RECORD_SIZE || body.len() - start < len {
            break;
        }
        let record = &body[start..start + len];
        if checksum(record) != expected {
            break;
        }
        match bincode::deserialize::<Node>(record) {
            Ok(node) => nodes.push(node),
            Err(_) => break,
        }
        pos = start + len;
    }
    (nodes, pos)
}

/// Scan the log at `path`, checking that it belongs to `shard_id`.
pub fn replay(path: &Path, shard_id: ShardId) -> Result<LogReplay> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len < LOG_HEADER_SIZE as u64 {
        // Crash before the header was complete; nothing to recover.
        return Ok(LogReplay { nodes: Vec::new(), valid_len: 0, torn_bytes: file_len });
    }

    let mmap = unsafe { Mmap::map(&file) }?;
    let header = LogHeader::from_bytes(&mmap)?;
    if header.shard_id != shard_id {
        return Err(AncestryError::InvalidFormat(format!(
            "Node log {} belongs to shard {}, expected {}",
            path.display(),
            header.shard_id,
            shard_id
        )));
    }

    let (nodes, body_len) = decode_records(&mmap[LOG_HEADER_SIZE..]);
    let valid_len = (LOG_HEADER_SIZE + body_len) as u64;
    Ok(LogReplay { nodes, valid_len, torn_bytes: file_len - valid_len })
}

// ── Writer ─────────────────────────────────────────────────────────

pub struct NodeLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
    sync_on_append: bool,
}

impl NodeLogWriter {
    /// Create a fresh log (truncating any existing file).
    pub fn create(path: &Path, shard_id: ShardId, sync_on_append: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        LogHeader::new(shard_id).write_to(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            len: LOG_HEADER_SIZE as u64,
            sync_on_append,
        })
    }

    /// Reopen for appending after replay. A torn tail past `valid_len` is
    /// cut off; a log with no intact header is recreated.
    pub fn open_append(
        path: &Path,
        shard_id: ShardId,
        valid_len: u64,
        sync_on_append: bool,
    ) -> Result<Self> {
        if valid_len < LOG_HEADER_SIZE as u64 {
            return Self::create(path, shard_id, sync_on_append);
        }
        let mut file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len: valid_len,
            sync_on_append,
        })
    }

    /// Append one node record and flush it to the OS.
    pub fn append(&mut self, node: &Node) -> Result<()> {
        let body = bincode::serialize(node)?;
        self.writer.write_all(&(body.len() as u32).to_le_bytes())?;
        self.writer.write_all(&checksum(&body).to_le_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;
        if self.sync_on_append {
            self.writer.get_ref().sync_data()?;
        }
        self.len += (RECORD_PREFIX_SIZE + body.len()) as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= LOG_HEADER_SIZE as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use tempfile::TempDir;

    fn node(id: u128, parents: &[u128], created_at: u64) -> Node {
        Node {
            id: NodeId(id),
            parents: parents.iter().copied().map(NodeId).collect(),
            created_at,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        LogHeader::new(3).write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), LOG_HEADER_SIZE);
        let header = LogHeader::from_bytes(&buf).unwrap();
        assert_eq!(header.shard_id, 3);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = Vec::new();
        LogHeader::new(0).write_to(&mut buf).unwrap();
        buf[0] = b'X';
        assert!(LogHeader::from_bytes(&buf).is_err());
        assert!(LogHeader::from_bytes(&buf[..4]).is_err());
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);

        let mut writer = NodeLogWriter::create(&path, 1, false).unwrap();
        assert!(writer.is_empty());
        writer.append(&node(1, &[], 0)).unwrap();
        writer.append(&node(2, &[1], 1)).unwrap();
        writer.append(&node(3, &[1, 2], 2)).unwrap();
        let written = writer.len();
        drop(writer);

        let replay = replay(&path, 1).unwrap();
        assert_eq!(replay.nodes.len(), 3);
        assert_eq!(replay.nodes[2], node(3, &[1, 2], 2));
        assert_eq!(replay.valid_len, written);
        assert_eq!(replay.torn_bytes, 0);
    }

    #[test]
    fn test_replay_rejects_foreign_shard() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        NodeLogWriter::create(&path, 2, false).unwrap();
        assert!(replay(&path, 5).is_err());
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);

        let mut writer = NodeLogWriter::create(&path, 0, true).unwrap();
        writer.append(&node(1, &[], 0)).unwrap();
        writer.append(&node(2, &[1], 1)).unwrap();
        let good_len = writer.len();
        drop(writer);

        // Half of a third record.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(&[0xAB; 10]).unwrap();
        }

        let scanned = replay(&path, 0).unwrap();
        assert_eq!(scanned.nodes.len(), 2);
        assert_eq!(scanned.valid_len, good_len);
        assert_eq!(scanned.torn_bytes, 14);

        let mut writer = NodeLogWriter::open_append(&path, 0, scanned.valid_len, false).unwrap();
        writer.append(&node(3, &[2], 2)).unwrap();
        drop(writer);

        let rescanned = replay(&path, 0).unwrap();
        assert_eq!(rescanned.nodes.len(), 3);
        assert_eq!(rescanned.torn_bytes, 0);
    }

    #[test]
    fn test_corrupt_checksum_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);

        let mut writer = NodeLogWriter::create(&path, 0, false).unwrap();
        writer.append(&node(1, &[], 0)).unwrap();
        let first_end = writer.len();
        writer.append(&node(2, &[1], 1)).unwrap();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let scanned = replay(&path, 0).unwrap();
        assert_eq!(scanned.nodes.len(), 1);
        assert_eq!(scanned.valid_len, first_end);
    }

    #[test]
    fn test_short_file_recovers_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&path, b"MBN").unwrap();

        let scanned = replay(&path, 0).unwrap();
        assert!(scanned.nodes.is_empty());
        assert_eq!(scanned.valid_len, 0);

        let writer = NodeLogWriter::open_append(&path, 0, scanned.valid_len, false).unwrap();
        assert_eq!(writer.len(), LOG_HEADER_SIZE as u64);
    }
}
