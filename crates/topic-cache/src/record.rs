use bytes::Bytes;

use crate::{Error, Result};

/// Ancestor / delta-position value meaning "none".
pub const NO_ANCESTOR: i64 = -1;
pub const NO_DELTA: i32 = -1;

/// On-disk entry layout, little-endian, length-prefixed:
///
/// ```text
/// u32 length | i64 offset | i64 timestamp | i64 ancestor | i32 delta_position
///            | i32 key_length (-1 = null) | key
///            | u32 headers_length | { i32 name_length, name, i32 value_length, value }*
///            | i32 value_length (-1 = tombstone) | value
/// ```
const PREFIX_LEN: usize = 4;
const FIXED_LEN: usize = 8 + 8 + 8 + 4;

/// A cache entry borrowed from a segment's log file.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    pub position: u32,
    pub offset: i64,
    pub timestamp: i64,
    pub ancestor: i64,
    pub delta_position: i32,
    key: Option<&'a [u8]>,
    headers: &'a [u8],
    value: Option<&'a [u8]>,
}

impl<'a> EntryRef<'a> {
    /// Parse the entry starting at `position`, where `buf` is the published
    /// log suffix beginning there. Entries are fully published before the
    /// index row that reveals them, so a short read is corruption.
    pub fn parse(buf: &'a [u8], position: u32) -> Result<Self> {
        let corrupt = || Error::Corrupt { position };

        let length = read_u32(buf, 0).ok_or_else(corrupt)? as usize;
        let entry = buf
            .get(PREFIX_LEN..PREFIX_LEN + length)
            .ok_or_else(corrupt)?;

        let offset = read_i64(entry, 0).ok_or_else(corrupt)?;
        let timestamp = read_i64(entry, 8).ok_or_else(corrupt)?;
        let ancestor = read_i64(entry, 16).ok_or_else(corrupt)?;
        let delta_position = read_i32(entry, 24).ok_or_else(corrupt)?;

        let mut at = FIXED_LEN;
        let (key, next) = read_octets(entry, at).ok_or_else(corrupt)?;
        at = next;

        let headers_length = read_u32(entry, at).ok_or_else(corrupt)? as usize;
        at += 4;
        let headers = entry.get(at..at + headers_length).ok_or_else(corrupt)?;
        at += headers_length;

        // Validate the headers block up front so iteration is infallible.
        let mut walk = HeaderIter { rest: headers };
        while walk.rest.len() > 0 {
            walk.next().ok_or_else(corrupt)?;
        }

        let (value, next) = read_octets(entry, at).ok_or_else(corrupt)?;
        if next != entry.len() {
            return Err(corrupt());
        }

        Ok(Self {
            position,
            offset,
            timestamp,
            ancestor,
            delta_position,
            key,
            headers,
            value,
        })
    }

    pub fn key(&self) -> Option<&'a [u8]> {
        self.key
    }

    pub fn value(&self) -> Option<&'a [u8]> {
        self.value
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn headers(&self) -> HeaderIter<'a> {
        HeaderIter { rest: self.headers }
    }

    pub fn to_record(&self) -> Record {
        Record {
            offset: self.offset,
            timestamp: self.timestamp,
            ancestor: self.ancestor,
            key: self.key.map(Bytes::copy_from_slice),
            headers: self
                .headers()
                .map(|(n, v)| (Bytes::copy_from_slice(n), Bytes::copy_from_slice(v)))
                .collect(),
            value: self.value.map(Bytes::copy_from_slice),
            value_is_delta: false,
        }
    }
}

/// Iterates (name, value) pairs of a validated headers block.
pub struct HeaderIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let name_length = read_i32(self.rest, 0)? as usize;
        let name = self.rest.get(4..4 + name_length)?;
        let at = 4 + name_length;
        let value_length = read_i32(self.rest, at)? as usize;
        let value = self.rest.get(at + 4..at + 4 + value_length)?;
        self.rest = &self.rest[at + 4 + value_length..];
        Some((name, value))
    }
}

/// A materialized record as delivered by a cursor. `value_is_delta` marks a
/// value that holds the encoded diff against `ancestor` rather than the
/// full payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub ancestor: i64,
    pub key: Option<Bytes>,
    pub headers: Vec<(Bytes, Bytes)>,
    pub value: Option<Bytes>,
    pub value_is_delta: bool,
}

/// Encode one entry into `buf` and return its encoded length.
pub fn encode(
    buf: &mut Vec<u8>,
    offset: i64,
    timestamp: i64,
    ancestor: i64,
    delta_position: i32,
    key: Option<&[u8]>,
    headers: &[(&[u8], &[u8])],
    value: Option<&[u8]>,
) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes()); // length, patched below

    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&ancestor.to_le_bytes());
    buf.extend_from_slice(&delta_position.to_le_bytes());

    put_octets(buf, key);

    let headers_at = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    for (name, value) in headers {
        put_octets(buf, Some(name));
        put_octets(buf, Some(value));
    }
    let headers_length = (buf.len() - headers_at - 4) as u32;
    buf[headers_at..headers_at + 4].copy_from_slice(&headers_length.to_le_bytes());

    put_octets(buf, value);

    let length = (buf.len() - start - PREFIX_LEN) as u32;
    buf[start..start + 4].copy_from_slice(&length.to_le_bytes());
    buf.len() - start
}

/// CRC32C of a key's length-prefixed encoding. A null key hashes its −1
/// length alone, giving the canonical null-key singleton.
pub fn hash_key(key: Option<&[u8]>) -> u32 {
    match key {
        Some(key) => {
            let crc = crc32c::crc32c(&(key.len() as i32).to_le_bytes());
            crc32c::crc32c_append(crc, key)
        }
        None => crc32c::crc32c(&(-1i32).to_le_bytes()),
    }
}

/// CRC32C of a header's length-prefixed (name, value) encoding.
pub fn hash_header(name: &[u8], value: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&(name.len() as i32).to_le_bytes());
    let crc = crc32c::crc32c_append(crc, name);
    let crc = crc32c::crc32c_append(crc, &(value.len() as i32).to_le_bytes());
    crc32c::crc32c_append(crc, value)
}

fn put_octets(buf: &mut Vec<u8>, octets: Option<&[u8]>) {
    match octets {
        Some(octets) => {
            buf.extend_from_slice(&(octets.len() as i32).to_le_bytes());
            buf.extend_from_slice(octets);
        }
        None => buf.extend_from_slice(&(-1i32).to_le_bytes()),
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_i32(buf: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_i64(buf: &[u8], at: usize) -> Option<i64> {
    Some(i64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

/// Reads a length-prefixed field; a −1 length is a null field.
fn read_octets(buf: &[u8], at: usize) -> Option<(Option<&[u8]>, usize)> {
    let length = read_i32(buf, at)?;
    if length < 0 {
        return Some((None, at + 4));
    }
    let octets = buf.get(at + 4..at + 4 + length as usize)?;
    Some((Some(octets), at + 4 + length as usize))
}
