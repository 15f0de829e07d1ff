use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_opt_string(buf: &mut impl BufMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    match buf.try_get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(try_get_string(buf)?)),
        b => Err(anyhow!("invalid option marker {}", b)),
    }
}

pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

/// NB: this returns a zero-copy slice when `buf` is itself backed by [Bytes]
pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = try_get_usize_varint(buf)?;
    if buf.remaining() < len {
        return Err(anyhow!("buffer underflow: {} bytes announced, {} remaining", len, buf.remaining()));
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn try_get_usize_varint(buf: &mut impl Buf) -> anyhow::Result<usize> {
    buf.try_get_usize_varint()
        .map_err(|e| anyhow!("varint error: {:?}", e))
}

pub fn try_get_u64_varint(buf: &mut impl Buf) -> anyhow::Result<u64> {
    buf.try_get_u64_varint()
        .map_err(|e| anyhow!("varint error: {:?}", e))
}

pub fn try_get_i64_varint(buf: &mut impl Buf) -> anyhow::Result<i64> {
    buf.try_get_i64_varint()
        .map_err(|e| anyhow!("varint error: {:?}", e))
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(anyhow!("invalid value for a boolean: {}", b)),
    }
}
