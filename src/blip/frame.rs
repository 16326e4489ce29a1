//! Wire-level BLIP frame: varint message number, flags, and a
//! length-prefixed properties chunk followed by the body.

use super::Message;
use crate::error::{Error, Result};
use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const RESPONSE     = 0x01;
        const ERROR        = 0x02;
        const URGENT       = 0x04;
        const NO_REPLY     = 0x08;
        const MORE_COMING  = 0x10;
        const COMPRESSED   = 0x20;
    }
}

/// One frame as read off (or written to) a single WebSocket binary message.
/// Real BLIP allows many frames per message, interleaved with other
/// messages' frames; this crate always emits exactly one frame per
/// `Message` (no internal re-fragmentation across WS frames) while still
/// reassembling correctly if a peer sends a message pre-split into several
/// `MORE_COMING` frames.
pub struct Frame {
    pub number: u64,
    pub flags: FrameFlags,
    pub properties_chunk: Vec<u8>,
    pub body_chunk: Vec<u8>,
}

pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let mut cursor = bytes;
    let number = read_uvarint(&mut cursor)?;
    let flags_byte = cursor
        .read_u8()
        .map_err(|_| Error::CorruptIndexData("truncated BLIP frame flags".into()))?;
    let flags = FrameFlags::from_bits_truncate(flags_byte);
    let props_len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::CorruptIndexData("truncated BLIP frame properties length".into()))?
        as usize;
    if cursor.len() < props_len {
        return Err(Error::CorruptIndexData("BLIP frame properties length overruns frame".into()));
    }
    let (props, body) = cursor.split_at(props_len);
    Ok(Frame {
        number,
        flags,
        properties_chunk: props.to_vec(),
        body_chunk: body.to_vec(),
    })
}

/// Encodes a complete message as a single frame (`MORE_COMING` never set).
pub fn encode_single_frame(msg: &Message) -> Result<Vec<u8>> {
    let raw_props = encode_properties(&msg.properties);
    let (props, body, flags) = if msg.flags.contains(FrameFlags::COMPRESSED) {
        (deflate(&raw_props)?, deflate(&msg.body)?, msg.flags)
    } else {
        (raw_props, msg.body.clone(), msg.flags)
    };

    let mut out = Vec::new();
    write_uvarint(&mut out, msg.number);
    out.write_u8(flags.bits()).expect("Vec write is infallible");
    out.write_u32::<BigEndian>(props.len() as u32)
        .expect("Vec write is infallible");
    out.extend_from_slice(&props);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn encode_properties(properties: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in properties {
        out.extend_from_slice(k.as_bytes());
        out.push(0);
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

pub fn decode_properties(bytes: &[u8]) -> Result<Vec<(String, String)>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    // NUL-terminated fields: splitting a trailing-NUL buffer on NUL yields
    // one spurious empty field at the end, which we drop.
    let mut values: Vec<String> = bytes
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    if bytes.last() == Some(&0) {
        values.pop();
    }
    if values.len() % 2 != 0 {
        return Err(Error::CorruptIndexData("odd number of BLIP property fields".into()));
    }
    Ok(values.chunks(2).map(|c| (c[0].clone(), c[1].clone())).collect())
}

pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn read_uvarint(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = buf
            .read_u8()
            .map_err(|_| Error::CorruptIndexData("truncated BLIP varint".into()))?;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::CorruptIndexData("BLIP varint too long".into()));
        }
    }
}

fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_round_trip() {
        let props = vec![
            ("Profile".to_string(), "subChanges".to_string()),
            ("since".to_string(), "42".to_string()),
        ];
        let encoded = encode_properties(&props);
        let decoded = decode_properties(&encoded).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn frame_round_trips_through_encode_decode() {
        let msg = Message {
            number: 7,
            flags: FrameFlags::default(),
            properties: vec![("Profile".to_string(), "rev".to_string())],
            body: b"hello".to_vec(),
        };
        let bytes = encode_single_frame(&msg).unwrap();
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.number, 7);
        assert!(!frame.flags.contains(FrameFlags::MORE_COMING));
        assert_eq!(decode_properties(&frame.properties_chunk).unwrap(), msg.properties);
        assert_eq!(frame.body_chunk, msg.body);
    }

    #[test]
    fn compressed_round_trip() {
        let raw = b"lots of repeated repeated repeated text".to_vec();
        let compressed = deflate(&raw).unwrap();
        let restored = inflate(&compressed).unwrap();
        assert_eq!(restored, raw);
    }
}
