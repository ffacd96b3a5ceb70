//! WAL frame layout and the replication entry payload.
//!
//! The write-ahead log is a 32-byte header followed by frames of a 24-byte
//! header plus one page of content. Header and frame-header integers are
//! big-endian; the frame checksum chain is computed over 32-bit words whose
//! byte order is selected by the low bit of the header magic.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// WAL file header size in bytes.
pub const WAL_HDR_SIZE: usize = 32;
/// Per-frame header size in bytes.
pub const FRAME_HDR_SIZE: usize = 24;
/// WAL magic with little-endian checksums.
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;
/// WAL magic with big-endian checksums.
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;
/// WAL format version.
pub const WAL_VERSION: u32 = 3_007_000;

/// One captured WAL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The page this frame carries.
    pub page_number: u32,
    /// Database size in pages after this frame, non-zero on a commit frame.
    pub commit: u32,
    /// Page content.
    pub data: Vec<u8>,
}

impl Frame {
    pub fn is_commit(&self) -> bool {
        self.commit != 0
    }
}

/// Total on-disk size of one frame for the given page size.
pub fn frame_size(page_size: usize) -> usize {
    FRAME_HDR_SIZE + page_size
}

/// The SQLite WAL checksum: a running (s1, s2) pair folded over pairs of
/// 32-bit words. `little` selects the word byte order, per the header magic.
pub fn checksum(little: bool, init: (u32, u32), data: &[u8]) -> (u32, u32) {
    debug_assert_eq!(data.len() % 8, 0);
    let (mut s1, mut s2) = init;
    let mut off = 0;
    while off < data.len() {
        let (x0, x1) = if little {
            (
                LittleEndian::read_u32(&data[off..off + 4]),
                LittleEndian::read_u32(&data[off + 4..off + 8]),
            )
        } else {
            (
                BigEndian::read_u32(&data[off..off + 4]),
                BigEndian::read_u32(&data[off + 4..off + 8]),
            )
        };
        s1 = s1.wrapping_add(x0).wrapping_add(s2);
        s2 = s2.wrapping_add(x1).wrapping_add(s1);
        off += 8;
    }
    (s1, s2)
}

/// Fields of a WAL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum: (u32, u32),
}

impl WalHeader {
    pub fn little_endian_checksums(&self) -> bool {
        self.magic == WAL_MAGIC_LE
    }

    pub fn parse(bytes: &[u8]) -> Option<WalHeader> {
        if bytes.len() < WAL_HDR_SIZE {
            return None;
        }
        let magic = BigEndian::read_u32(&bytes[0..4]);
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return None;
        }
        Some(WalHeader {
            magic,
            page_size: BigEndian::read_u32(&bytes[8..12]),
            checkpoint_seq: BigEndian::read_u32(&bytes[12..16]),
            salt1: BigEndian::read_u32(&bytes[16..20]),
            salt2: BigEndian::read_u32(&bytes[20..24]),
            checksum: (
                BigEndian::read_u32(&bytes[24..28]),
                BigEndian::read_u32(&bytes[28..32]),
            ),
        })
    }

    /// Serialise a header, computing its checksum over the first 24 bytes.
    pub fn encode(page_size: u32, checkpoint_seq: u32, salt1: u32, salt2: u32) -> [u8; WAL_HDR_SIZE] {
        let mut buf = [0u8; WAL_HDR_SIZE];
        BigEndian::write_u32(&mut buf[0..4], WAL_MAGIC_LE);
        BigEndian::write_u32(&mut buf[4..8], WAL_VERSION);
        BigEndian::write_u32(&mut buf[8..12], page_size);
        BigEndian::write_u32(&mut buf[12..16], checkpoint_seq);
        BigEndian::write_u32(&mut buf[16..20], salt1);
        BigEndian::write_u32(&mut buf[20..24], salt2);
        let (c1, c2) = checksum(true, (0, 0), &buf[0..24]);
        BigEndian::write_u32(&mut buf[24..28], c1);
        BigEndian::write_u32(&mut buf[28..32], c2);
        buf
    }
}

/// Parse the frames stored in `wal[start..end]`. The range must cover whole
/// frames of the given page size.
pub fn parse_frames(wal: &[u8], start: usize, end: usize, page_size: usize) -> Vec<Frame> {
    let fsz = frame_size(page_size);
    debug_assert!(start >= WAL_HDR_SIZE);
    debug_assert_eq!((end - start) % fsz, 0);
    let mut frames = Vec::with_capacity((end - start) / fsz);
    let mut off = start;
    while off + fsz <= end {
        let hdr = &wal[off..off + FRAME_HDR_SIZE];
        frames.push(Frame {
            page_number: BigEndian::read_u32(&hdr[0..4]),
            commit: BigEndian::read_u32(&hdr[4..8]),
            data: wal[off + FRAME_HDR_SIZE..off + fsz].to_vec(),
        });
        off += fsz;
    }
    frames
}

/// Serialise one frame with its checksum chained from `running`, returning
/// the frame bytes and the new running pair.
pub fn encode_frame(
    frame: &Frame,
    salt1: u32,
    salt2: u32,
    little: bool,
    running: (u32, u32),
) -> (Vec<u8>, (u32, u32)) {
    let mut buf = vec![0u8; FRAME_HDR_SIZE + frame.data.len()];
    BigEndian::write_u32(&mut buf[0..4], frame.page_number);
    BigEndian::write_u32(&mut buf[4..8], frame.commit);
    BigEndian::write_u32(&mut buf[8..12], salt1);
    BigEndian::write_u32(&mut buf[12..16], salt2);
    let sum = checksum(little, running, &buf[0..8]);
    let sum = checksum(little, sum, &frame.data);
    BigEndian::write_u32(&mut buf[16..20], sum.0);
    BigEndian::write_u32(&mut buf[20..24], sum.1);
    buf[FRAME_HDR_SIZE..].copy_from_slice(&frame.data);
    (buf, sum)
}

/// Codec error for replication entry payloads.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload truncated at byte {0}")]
    Truncated(usize),
    #[error("invalid utf-8 database name")]
    Utf8,
    #[error("frame length {got} does not match page size {page_size}")]
    BadFrame { got: usize, page_size: usize },
}

/// A replication log entry: the frames of one commit against one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPayload {
    pub db: String,
    pub page_size: u32,
    pub frames: Vec<Frame>,
}

impl EntryPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            12 + self.db.len() + self.frames.len() * frame_size(self.page_size as usize),
        );
        let mut scratch = [0u8; 4];
        LittleEndian::write_u32(&mut scratch, self.db.len() as u32);
        out.extend_from_slice(&scratch);
        out.extend_from_slice(self.db.as_bytes());
        LittleEndian::write_u32(&mut scratch, self.page_size);
        out.extend_from_slice(&scratch);
        LittleEndian::write_u32(&mut scratch, self.frames.len() as u32);
        out.extend_from_slice(&scratch);
        for frame in &self.frames {
            LittleEndian::write_u32(&mut scratch, frame.page_number);
            out.extend_from_slice(&scratch);
            LittleEndian::write_u32(&mut scratch, frame.commit);
            out.extend_from_slice(&scratch);
            out.extend_from_slice(&frame.data);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut off = 0;
        let read_u32 = |off: &mut usize| -> Result<u32, PayloadError> {
            if *off + 4 > bytes.len() {
                return Err(PayloadError::Truncated(*off));
            }
            let v = LittleEndian::read_u32(&bytes[*off..*off + 4]);
            *off += 4;
            Ok(v)
        };
        let name_len = read_u32(&mut off)? as usize;
        if off + name_len > bytes.len() {
            return Err(PayloadError::Truncated(off));
        }
        let db = std::str::from_utf8(&bytes[off..off + name_len])
            .map_err(|_| PayloadError::Utf8)?
            .to_owned();
        off += name_len;
        let page_size = read_u32(&mut off)?;
        let count = read_u32(&mut off)? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let page_number = read_u32(&mut off)?;
            let commit = read_u32(&mut off)?;
            let end = off + page_size as usize;
            if end > bytes.len() {
                return Err(PayloadError::Truncated(off));
            }
            frames.push(Frame {
                page_number,
                commit,
                data: bytes[off..end].to_vec(),
            });
            off = end;
        }
        if off != bytes.len() {
            return Err(PayloadError::BadFrame {
                got: bytes.len() - off,
                page_size: page_size as usize,
            });
        }
        Ok(EntryPayload {
            db,
            page_size,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_chains_compose() {
        let a = [1u8; 16];
        let b = [2u8; 24];
        let whole: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        let direct = checksum(true, (0, 0), &whole);
        let chained = checksum(true, checksum(true, (0, 0), &a), &b);
        assert_eq!(direct, chained);
        // byte order matters
        assert_ne!(checksum(true, (0, 0), &whole), checksum(false, (0, 0), &whole));
    }

    #[test]
    fn header_roundtrip() {
        let bytes = WalHeader::encode(4096, 1, 0xdead_beef, 0x0bad_cafe);
        let hdr = WalHeader::parse(&bytes).unwrap();
        assert_eq!(hdr.magic, WAL_MAGIC_LE);
        assert!(hdr.little_endian_checksums());
        assert_eq!(hdr.page_size, 4096);
        assert_eq!(hdr.salt1, 0xdead_beef);
        assert_eq!(hdr.salt2, 0x0bad_cafe);
        assert_eq!(hdr.checksum, checksum(true, (0, 0), &bytes[0..24]));
    }

    #[test]
    fn frame_encode_parse_roundtrip() {
        let frame = Frame {
            page_number: 2,
            commit: 3,
            data: vec![7u8; 512],
        };
        let (bytes, sum) = encode_frame(&frame, 1, 2, true, (0, 0));
        assert_eq!(bytes.len(), frame_size(512));
        // chained checksum covers the first 8 header bytes and the page
        let expect = checksum(true, checksum(true, (0, 0), &bytes[0..8]), &frame.data);
        assert_eq!(sum, expect);

        let mut wal = vec![0u8; WAL_HDR_SIZE];
        wal.extend_from_slice(&bytes);
        let parsed = parse_frames(&wal, WAL_HDR_SIZE, wal.len(), 512);
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn payload_roundtrip() {
        let payload = EntryPayload {
            db: "test.db".into(),
            page_size: 512,
            frames: vec![
                Frame {
                    page_number: 1,
                    commit: 0,
                    data: vec![0xaa; 512],
                },
                Frame {
                    page_number: 2,
                    commit: 2,
                    data: vec![0xbb; 512],
                },
            ],
        };
        let bytes = payload.encode();
        assert_eq!(EntryPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn payload_empty_frames() {
        let payload = EntryPayload {
            db: "x".into(),
            page_size: 4096,
            frames: vec![],
        };
        let bytes = payload.encode();
        assert_eq!(EntryPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn payload_truncation_detected() {
        let payload = EntryPayload {
            db: "x".into(),
            page_size: 512,
            frames: vec![Frame {
                page_number: 1,
                commit: 1,
                data: vec![0; 512],
            }],
        };
        let mut bytes = payload.encode();
        bytes.truncate(bytes.len() - 1);
        assert!(EntryPayload::decode(&bytes).is_err());
    }
}
