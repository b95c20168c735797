//! Field-level encoding for message payloads (`§4.4`).
//!
//! Every payload is a flat sequence of these primitives; there is no
//! self-describing type tag per field, so the reader must decode fields in
//! exactly the order the writer wrote them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use frostbox_common::CoreError;

pub(crate) fn malformed(reason: impl Into<String>) -> CoreError {
    CoreError::MalformedFrame {
        reason: reason.into(),
    }
}

pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool, CoreError> {
    if !buf.has_remaining() {
        return Err(malformed("truncated bool"));
    }
    Ok(buf.get_u8() != 0)
}

pub fn put_i32(buf: &mut BytesMut, v: i32) {
    buf.put_i32_le(v);
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32, CoreError> {
    if buf.remaining() < 4 {
        return Err(malformed("truncated i32"));
    }
    Ok(buf.get_i32_le())
}

pub fn put_i64(buf: &mut BytesMut, v: i64) {
    buf.put_i64_le(v);
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64, CoreError> {
    if buf.remaining() < 8 {
        return Err(malformed("truncated i64"));
    }
    Ok(buf.get_i64_le())
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32_le(data.len() as i32);
    buf.extend_from_slice(data);
}

pub fn get_bytes(buf: &mut Bytes) -> Result<Vec<u8>, CoreError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(malformed("negative byte-sequence length"));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(malformed("truncated byte sequence"));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn get_string(buf: &mut Bytes) -> Result<String, CoreError> {
    String::from_utf8(get_bytes(buf)?).map_err(|_| malformed("string is not valid utf-8"))
}

pub fn put_option_string(buf: &mut BytesMut, s: &Option<String>) {
    match s {
        Some(s) => {
            put_bool(buf, true);
            put_string(buf, s);
        }
        None => put_bool(buf, false),
    }
}

pub fn get_option_string(buf: &mut Bytes) -> Result<Option<String>, CoreError> {
    if get_bool(buf)? {
        Ok(Some(get_string(buf)?))
    } else {
        Ok(None)
    }
}

pub fn put_string_vec(buf: &mut BytesMut, items: &[String]) {
    buf.put_i32_le(items.len() as i32);
    for item in items {
        put_string(buf, item);
    }
}

pub fn get_string_vec(buf: &mut Bytes) -> Result<Vec<String>, CoreError> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Err(malformed("negative string-vec count"));
    }
    (0..count).map(|_| get_string(buf)).collect()
}

pub fn put_i64_vec(buf: &mut BytesMut, items: &[i64]) {
    buf.put_i32_le(items.len() as i32);
    for v in items {
        buf.put_i64_le(*v);
    }
}

pub fn get_i64_vec(buf: &mut Bytes) -> Result<Vec<i64>, CoreError> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Err(malformed("negative key-vec count"));
    }
    let count = count as usize;
    if buf.remaining() < count * 8 {
        return Err(malformed("truncated key vec"));
    }
    Ok((0..count).map(|_| buf.get_i64_le()).collect())
}

pub fn put_bytes_vec(buf: &mut BytesMut, items: &[Vec<u8>]) {
    buf.put_i32_le(items.len() as i32);
    for item in items {
        put_bytes(buf, item);
    }
}

pub fn get_bytes_vec(buf: &mut Bytes) -> Result<Vec<Vec<u8>>, CoreError> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Err(malformed("negative bytes-vec count"));
    }
    (0..count).map(|_| get_bytes(buf)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_primitive() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, true);
        put_i32(&mut buf, -7);
        put_i64(&mut buf, i64::MIN);
        put_string(&mut buf, "hello");
        put_option_string(&mut buf, &None);
        put_option_string(&mut buf, &Some("x".into()));
        put_string_vec(&mut buf, &["a".into(), "bb".into()]);
        put_i64_vec(&mut buf, &[1, 2, 3]);
        put_bytes_vec(&mut buf, &[vec![1, 2], vec![]]);

        let mut read = buf.freeze();
        assert!(get_bool(&mut read).unwrap());
        assert_eq!(get_i32(&mut read).unwrap(), -7);
        assert_eq!(get_i64(&mut read).unwrap(), i64::MIN);
        assert_eq!(get_string(&mut read).unwrap(), "hello");
        assert_eq!(get_option_string(&mut read).unwrap(), None);
        assert_eq!(get_option_string(&mut read).unwrap(), Some("x".into()));
        assert_eq!(
            get_string_vec(&mut read).unwrap(),
            vec!["a".to_string(), "bb".to_string()]
        );
        assert_eq!(get_i64_vec(&mut read).unwrap(), vec![1, 2, 3]);
        assert_eq!(get_bytes_vec(&mut read).unwrap(), vec![vec![1, 2], vec![]]);
        assert!(!read.has_remaining());
    }

    #[test]
    fn truncated_field_is_malformed() {
        let mut buf = BytesMut::new();
        put_i32(&mut buf, 100);
        let mut read = buf.freeze().slice(0..2);
        assert!(matches!(
            get_i32(&mut read),
            Err(CoreError::MalformedFrame { .. })
        ));
    }
}
