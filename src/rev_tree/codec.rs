//! Binary codec for a document's revision tree (§4.2).
//!
//! Wire format, concatenation of fixed-size records followed by a 4-byte
//! zero terminator:
//!
//! ```text
//! record   := size:u32be            total bytes of this record, size field included
//!             flags:u8
//!             revIDLen:u8
//!             parentIndex:u16be      0xFFFF = NONE
//!             sequence:uvarint
//!             revID: revIDLen bytes
//!             body: remaining bytes (present iff flags & HAS_DATA)
//! terminator := 0x00000000
//! ```
//!
//! `HAS_DATA` is never stored as an input flag — it's derived at encode time
//! from whether the revision carries a body.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Index of a revision's parent within the same tree vector; `NONE` for roots.
pub const NONE: u16 = 0xFFFF;

const MAX_REV_COUNT: usize = 0xFFFF;

bitflags::bitflags! {
    /// Persistent revision flags. Only these four bits are ever written to
    /// disk; `New` and `Foreign` are transient, in-memory-only flags that
    /// never appear in an encoded tree.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct RevFlags: u8 {
        const DELETED         = 0x01;
        const LEAF            = 0x02;
        const HAS_ATTACHMENTS = 0x04;
        const KEEP_BODY       = 0x08;
        const HAS_DATA        = 0x80;
    }
}

/// Flags that are persisted verbatim; `HAS_DATA` is excluded since it is
/// derived, never stored as an input.
const PUBLIC_PERSISTENT_FLAGS: RevFlags = RevFlags::from_bits_truncate(
    RevFlags::DELETED.bits() | RevFlags::LEAF.bits() | RevFlags::HAS_ATTACHMENTS.bits() | RevFlags::KEEP_BODY.bits(),
);

/// One node of a document's revision tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rev {
    pub rev_id: Vec<u8>,
    pub parent_index: u16,
    pub sequence: u64,
    pub flags: RevFlags,
    pub body: Vec<u8>,
}

impl Rev {
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevFlags::LEAF)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }

    pub fn has_parent(&self) -> bool {
        self.parent_index != NONE
    }
}

/// Decode a tree blob into its revision vector.
///
/// Each rev whose stored `sequence` is `0` is assigned `cur_seq` (the
/// current commit's sequence number) — this is how a freshly-saved current
/// revision picks up its real sequence without the encoder needing to know
/// it in advance.
pub fn decode_tree(blob: &[u8], cur_seq: u64) -> Result<Vec<Rev>> {
    let mut revs = Vec::new();
    let mut cursor = 0usize;

    loop {
        if cursor + 4 > blob.len() {
            return Err(Error::CorruptRevisionData("truncated record size"));
        }
        let size = (&blob[cursor..cursor + 4]).read_u32::<BigEndian>()? as usize;
        if size == 0 {
            cursor += 4;
            break;
        }
        if cursor + size > blob.len() {
            return Err(Error::CorruptRevisionData("record overruns buffer"));
        }

        let record = &blob[cursor..cursor + size];
        let mut rev = decode_record(record)?;
        if rev.sequence == 0 {
            rev.sequence = cur_seq;
        }
        revs.push(rev);

        cursor += size;
        if revs.len() > MAX_REV_COUNT {
            return Err(Error::CorruptRevisionData("revision count exceeds 65535"));
        }
    }

    if cursor != blob.len() {
        return Err(Error::CorruptRevisionData(
            "trailing bytes after terminator",
        ));
    }

    Ok(revs)
}

fn decode_record(record: &[u8]) -> Result<Rev> {
    // record[0..4] is the size field itself, already consumed by the caller.
    let mut r = Cursor::new(record);
    r.read_u32::<BigEndian>()?; // size, re-read for cursor advance
    let flags_byte = r.read_u8()?;
    let rev_id_len = r.read_u8()? as usize;
    let parent_index = r.read_u16::<BigEndian>()?;

    let after_fixed = r.position() as usize;
    let (sequence, varint_len) = read_uvarint(&record[after_fixed..])?;
    let after_varint = after_fixed + varint_len;

    if after_varint + rev_id_len > record.len() {
        return Err(Error::CorruptRevisionData("revID overruns record"));
    }
    let rev_id = record[after_varint..after_varint + rev_id_len].to_vec();
    let body_start = after_varint + rev_id_len;

    let flags = RevFlags::from_bits_truncate(flags_byte) & PUBLIC_PERSISTENT_FLAGS;
    let body = if flags_byte & RevFlags::HAS_DATA.bits() != 0 {
        record[body_start..].to_vec()
    } else {
        Vec::new()
    };

    Ok(Rev {
        rev_id,
        parent_index,
        sequence,
        flags,
        body,
    })
}

/// Returns the current revision's body directly, without decoding the full
/// tree. The first record in the blob is always the current revision.
pub fn current_rev_body(blob: &[u8]) -> Result<&[u8]> {
    if blob.len() < 4 {
        return Err(Error::CorruptRevisionData("truncated record size"));
    }
    let size = (&blob[0..4]).read_u32::<BigEndian>()? as usize;
    if size == 0 || size > blob.len() {
        return Err(Error::CorruptRevisionData("invalid leading record size"));
    }

    let flags_byte = blob[4];
    if flags_byte & RevFlags::HAS_DATA.bits() == 0 {
        return Ok(&[]);
    }
    let rev_id_len = blob[5] as usize;
    let (_, varint_len) = read_uvarint(&blob[8..size])?;
    let body_start = 8 + varint_len + rev_id_len;
    Ok(&blob[body_start..size])
}

/// Encode a revision vector into its tree-blob representation, terminated
/// by the 4-byte zero marker.
pub fn encode_tree(revs: &[Rev]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(revs.iter().map(size_to_write).sum::<usize>() + 4);
    for rev in revs {
        encode_record(rev, &mut out)?;
    }
    out.write_u32::<BigEndian>(0)?;
    Ok(out)
}

fn size_to_write(rev: &Rev) -> usize {
    // size(4) + flags(1) + revIDLen(1) + parentIndex(2) + varint(seq) + revID + body
    4 + 1 + 1 + 2 + uvarint_len(rev.sequence) + rev.rev_id.len() + rev.body.len()
}

fn encode_record(rev: &Rev, out: &mut Vec<u8>) -> Result<()> {
    if rev.rev_id.len() > u8::MAX as usize {
        return Err(Error::InvalidParameter("revID longer than 255 bytes".into()));
    }
    let size = size_to_write(rev);
    out.write_u32::<BigEndian>(size as u32)?;

    let mut flags = rev.flags & PUBLIC_PERSISTENT_FLAGS;
    if !rev.body.is_empty() {
        flags |= RevFlags::HAS_DATA;
    }
    out.write_u8(flags.bits())?;
    out.write_u8(rev.rev_id.len() as u8)?;
    out.write_u16::<BigEndian>(rev.parent_index)?;
    write_uvarint(rev.sequence, out);
    out.write_all(&rev.rev_id)?;
    out.write_all(&rev.body)?;
    Ok(())
}

// --- LEB128-style unsigned varint, matching the original's `PutUVarInt`/`GetUVarInt`. ---

fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn write_uvarint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn read_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::CorruptRevisionData("varint too long"));
        }
    }
    Err(Error::CorruptRevisionData("truncated varint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(rev_id: &str, parent: u16, seq: u64, flags: RevFlags, body: &str) -> Rev {
        Rev {
            rev_id: rev_id.as_bytes().to_vec(),
            parent_index: parent,
            sequence: seq,
            flags,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn round_trip_three_revs() {
        let revs = vec![
            rev("1-a", NONE, 1, RevFlags::empty(), "x"),
            rev("2-b", 0, 2, RevFlags::LEAF, "y"),
            rev("2-c", 0, 3, RevFlags::LEAF | RevFlags::DELETED, ""),
        ];
        let encoded = encode_tree(&revs).unwrap();
        assert_eq!(&encoded[encoded.len() - 4..], &[0, 0, 0, 0]);

        let decoded = decode_tree(&encoded, 99).unwrap();
        assert_eq!(decoded, revs);
    }

    #[test]
    fn zero_sequence_gets_current_sequence() {
        let revs = vec![rev("1-a", NONE, 0, RevFlags::LEAF, "x")];
        let encoded = encode_tree(&revs).unwrap();
        let decoded = decode_tree(&encoded, 42).unwrap();
        assert_eq!(decoded[0].sequence, 42);
    }

    #[test]
    fn current_rev_body_matches_first_record() {
        let revs = vec![
            rev("2-b", NONE, 5, RevFlags::LEAF, "current"),
            rev("1-a", NONE, 4, RevFlags::empty(), "older"),
        ];
        let encoded = encode_tree(&revs).unwrap();
        assert_eq!(current_rev_body(&encoded).unwrap(), b"current");
    }

    #[test]
    fn has_data_is_derived_not_stored() {
        let revs = vec![rev("1-a", NONE, 1, RevFlags::empty(), "")];
        let encoded = encode_tree(&revs).unwrap();
        // flags byte must not carry HAS_DATA since body is empty.
        assert_eq!(encoded[4] & RevFlags::HAS_DATA.bits(), 0);
    }

    #[test]
    fn corrupt_trailing_bytes_rejected() {
        let revs = vec![rev("1-a", NONE, 1, RevFlags::empty(), "x")];
        let mut encoded = encode_tree(&revs).unwrap();
        encoded.push(0xFF);
        assert!(matches!(
            decode_tree(&encoded, 1),
            Err(Error::CorruptRevisionData(_))
        ));
    }

    #[test]
    fn truncated_buffer_rejected() {
        let revs = vec![rev("1-a", NONE, 1, RevFlags::empty(), "x")];
        let encoded = encode_tree(&revs).unwrap();
        let truncated = &encoded[..encoded.len() - 6];
        assert!(decode_tree(truncated, 1).is_err());
    }
}
