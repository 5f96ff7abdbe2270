//! Self-describing tensor-map encoding
//!
//! Used as the network message body and as the persisted record value.
//! Layout (all integers little-endian):
//!
//! ```text
//! "HWY1" | u32 entries | entries... | u32 crc32c
//! entry: u16 key_len | key utf-8 | u8 dtype | u8 rank | rank x u64 dims | u64 byte_len | bytes
//! ```
//!
//! The trailer covers everything before it, so truncated or corrupted
//! payloads are caught before any tensor is rebuilt.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{HighwayError, Result};
use crate::tensor::{Batch, DType, Sample, Tensor, TensorMap};

/// Payload magic; the trailing digit is the format revision
pub const MAGIC: &[u8; 4] = b"HWY1";

const HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 4;

/// Encode an ordered set of named tensors
pub fn encode_entries<'a, I>(entries: I) -> Result<Bytes>
where
    I: ExactSizeIterator<Item = (&'a str, &'a Tensor)>,
{
    let count = u32::try_from(entries.len())
        .map_err(|_| HighwayError::message("too many entries for one payload"))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + TRAILER_LEN);
    buf.put_slice(MAGIC);
    buf.put_u32_le(count);

    for (key, tensor) in entries {
        let key_len = u16::try_from(key.len())
            .map_err(|_| HighwayError::message(format!("key of {} bytes is too long", key.len())))?;
        let rank = u8::try_from(tensor.rank())
            .map_err(|_| HighwayError::message(format!("rank {} is too large", tensor.rank())))?;

        buf.reserve(2 + key.len() + 2 + 8 * tensor.rank() + 8 + tensor.data().len());
        buf.put_u16_le(key_len);
        buf.put_slice(key.as_bytes());
        buf.put_u8(tensor.dtype().tag());
        buf.put_u8(rank);
        for dim in tensor.shape() {
            buf.put_u64_le(*dim as u64);
        }
        buf.put_u64_le(tensor.data().len() as u64);
        buf.put_slice(tensor.data());
    }

    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);
    Ok(buf.freeze())
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(HighwayError::message(format!(
            "truncated payload reading {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Decode a payload produced by [`encode_entries`]
///
/// Tensor data is sliced out of `payload` without copying.
pub fn decode_entries(payload: Bytes) -> Result<TensorMap> {
    if payload.len() < HEADER_LEN + TRAILER_LEN {
        return Err(HighwayError::message(format!(
            "payload of {} bytes is shorter than header and trailer",
            payload.len()
        )));
    }

    let body_len = payload.len() - TRAILER_LEN;
    let expected = (&payload[body_len..]).get_u32_le();
    let actual = crc32c::crc32c(&payload[..body_len]);
    if expected != actual {
        return Err(HighwayError::ChecksumMismatch { expected, actual });
    }

    let mut buf = payload.slice(..body_len);
    if &buf[..4] != MAGIC {
        return Err(HighwayError::message(format!(
            "bad magic {:?}",
            &buf[..4]
        )));
    }
    buf.advance(4);
    let count = buf.get_u32_le() as usize;

    let mut entries = TensorMap::with_capacity(count.min(64));
    for _ in 0..count {
        need(&buf, 2, "key length")?;
        let key_len = buf.get_u16_le() as usize;
        need(&buf, key_len, "key")?;
        let key = String::from_utf8(buf.split_to(key_len).to_vec())
            .map_err(|e| HighwayError::message(format!("key is not utf-8: {}", e)))?;

        need(&buf, 2, "dtype and rank")?;
        let tag = buf.get_u8();
        let dtype = DType::from_tag(tag)
            .ok_or_else(|| HighwayError::message(format!("unknown dtype tag {}", tag)))?;
        let rank = buf.get_u8() as usize;

        need(&buf, 8 * rank + 8, "shape")?;
        let shape = (0..rank)
            .map(|_| usize::try_from(buf.get_u64_le()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| HighwayError::message("dimension does not fit in usize"))?;
        let byte_len = usize::try_from(buf.get_u64_le())
            .map_err(|_| HighwayError::message("byte length does not fit in usize"))?;

        need(&buf, byte_len, "tensor data")?;
        let data = buf.split_to(byte_len);
        let tensor = Tensor::from_bytes(shape, dtype, data)
            .map_err(|e| HighwayError::message(format!("entry {:?}: {}", key, e)))?;

        if entries.insert(key.clone(), tensor).is_some() {
            return Err(HighwayError::message(format!("duplicate key {:?}", key)));
        }
    }

    if buf.has_remaining() {
        return Err(HighwayError::message(format!(
            "{} trailing bytes after last entry",
            buf.remaining()
        )));
    }
    Ok(entries)
}

pub fn encode_batch(batch: &Batch) -> Result<Bytes> {
    encode_entries(batch.entries().iter().map(|(k, v)| (k.as_str(), v)))
}

pub fn decode_batch(payload: Bytes) -> Result<Batch> {
    decode_entries(payload).map(Batch::from)
}

pub fn encode_sample(sample: &Sample) -> Result<Bytes> {
    encode_entries(sample.entries().iter().map(|(k, v)| (k.as_str(), v)))
}

pub fn decode_sample(payload: Bytes) -> Result<Sample> {
    decode_entries(payload).map(Sample::from)
}
