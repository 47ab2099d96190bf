// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use super::constants::{
    CRC_OFFSET, LOG_OVERHEAD, MAGIC_OFFSET, MAGIC_V1, MAX_RECORD_SIZE, MIN_RECORD_SIZE, NO_KEY,
    RECORD_FIXED_SIZE,
};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Bytes,
}

/// A message as submitted by a publisher, before the leader assigns it an
/// offset and epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<RecordHeader>,
    /// Publisher supplied timestamp in milliseconds; the leader's clock is
    /// used when absent.
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Size of the record this message turns into once stored.
    pub fn encoded_size(&self) -> usize {
        encoded_size(self.key.as_deref(), &self.value, &self.headers)
    }

    /// Rejects a message whose record would exceed [`MAX_RECORD_SIZE`].
    pub fn ensure_fits(&self) -> AppResult<()> {
        let size = self.encoded_size();
        if size > MAX_RECORD_SIZE {
            return Err(AppError::InvalidValue(format!(
                "record of {size} bytes exceeds the {MAX_RECORD_SIZE} byte limit"
            )));
        }
        Ok(())
    }
}

fn encoded_size(key: Option<&[u8]>, value: &[u8], headers: &[RecordHeader]) -> usize {
    let mut size = RECORD_FIXED_SIZE;
    size += bytes_field_size(key);
    size += bytes_field_size(Some(value));
    size += (headers.len() as i32).required_space();
    for header in headers {
        size += bytes_field_size(Some(header.key.as_bytes()));
        size += bytes_field_size(Some(&header.value[..]));
    }
    size
}

/// A stored record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub leader_epoch: u64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    pub fn from_message(message: Message, offset: i64, leader_epoch: u64, now_ms: i64) -> Self {
        Self {
            offset,
            timestamp: message.timestamp.unwrap_or(now_ms),
            leader_epoch,
            key: message.key,
            value: message.value,
            headers: message.headers,
        }
    }

    pub fn encoded_size(&self) -> usize {
        encoded_size(self.key.as_deref(), &self.value, &self.headers)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let total = self.encoded_size();
        buf.reserve(total);
        let start = buf.len();
        buf.put_i64(self.offset);
        buf.put_i32((total - LOG_OVERHEAD) as i32);
        buf.put_u32(0);
        buf.put_i8(MAGIC_V1);
        buf.put_u64(self.leader_epoch);
        buf.put_i64(self.timestamp);
        put_bytes_field(buf, self.key.as_deref());
        put_bytes_field(buf, Some(&self.value[..]));
        put_varint(buf, self.headers.len() as i32);
        for header in &self.headers {
            put_bytes_field(buf, Some(header.key.as_bytes()));
            put_bytes_field(buf, Some(&header.value[..]));
        }
        let crc = crc32c::crc32c(&buf[start + MAGIC_OFFSET..]);
        buf[start + CRC_OFFSET..start + MAGIC_OFFSET].copy_from_slice(&crc.to_be_bytes());
    }

    /// Decodes the record at the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` ends before the record does and
    /// `Corrupt` when the frame is complete but invalid.
    pub fn decode(buf: &[u8]) -> AppResult<Option<(Record, usize)>> {
        let Some((offset, total)) = peek_frame(buf)? else {
            return Ok(None);
        };
        if buf.len() < total {
            return Ok(None);
        }
        let stored_crc = (&buf[CRC_OFFSET..MAGIC_OFFSET]).get_u32();
        let computed_crc = crc32c::crc32c(&buf[MAGIC_OFFSET..total]);
        if stored_crc != computed_crc {
            return Err(AppError::Corrupt(format!(
                "crc mismatch at offset {offset}: stored {stored_crc:#x}, computed {computed_crc:#x}"
            )));
        }

        let mut body = &buf[MAGIC_OFFSET..total];
        let magic = body.get_i8();
        if magic != MAGIC_V1 {
            return Err(AppError::Corrupt(format!(
                "unknown magic {magic} at offset {offset}"
            )));
        }
        let leader_epoch = body.get_u64();
        let timestamp = body.get_i64();
        let key = read_bytes_field(&mut body)?;
        let value = read_bytes_field(&mut body)?
            .ok_or_else(|| AppError::Corrupt(format!("null value at offset {offset}")))?;
        let header_count = read_varint(&mut body)?;
        if header_count < 0 {
            return Err(AppError::Corrupt(format!(
                "negative header count at offset {offset}"
            )));
        }
        let mut headers = Vec::with_capacity(header_count as usize);
        for _ in 0..header_count {
            let key = read_bytes_field(&mut body)?
                .ok_or_else(|| AppError::Corrupt("null header key".into()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| AppError::Corrupt("header key is not utf-8".into()))?;
            let value = read_bytes_field(&mut body)?.unwrap_or_default();
            headers.push(RecordHeader { key, value });
        }
        if body.has_remaining() {
            return Err(AppError::Corrupt(format!(
                "{} trailing bytes in record at offset {offset}",
                body.remaining()
            )));
        }

        Ok(Some((
            Record {
                offset,
                timestamp,
                leader_epoch,
                key,
                value,
                headers,
            },
            total,
        )))
    }
}

/// Reads the offset and full frame length of the record at the front of
/// `buf` without validating its body.
pub fn peek_frame(buf: &[u8]) -> AppResult<Option<(i64, usize)>> {
    if buf.len() < LOG_OVERHEAD {
        return Ok(None);
    }
    let mut cursor = buf;
    let offset = cursor.get_i64();
    let size = cursor.get_i32();
    if size < (MIN_RECORD_SIZE - LOG_OVERHEAD) as i32 || size as usize > MAX_RECORD_SIZE {
        return Err(AppError::Corrupt(format!(
            "invalid record size {size} at offset {offset}"
        )));
    }
    Ok(Some((offset, LOG_OVERHEAD + size as usize)))
}

fn put_varint(buf: &mut BytesMut, value: i32) {
    buf.put_slice(&value.encode_var_vec());
}

fn put_bytes_field(buf: &mut BytesMut, field: Option<&[u8]>) {
    match field {
        None => put_varint(buf, NO_KEY),
        Some(bytes) => {
            put_varint(buf, bytes.len() as i32);
            buf.put_slice(bytes);
        }
    }
}

fn bytes_field_size(field: Option<&[u8]>) -> usize {
    match field {
        None => NO_KEY.required_space(),
        Some(bytes) => (bytes.len() as i32).required_space() + bytes.len(),
    }
}

fn read_varint(body: &mut &[u8]) -> AppResult<i32> {
    let (value, read) =
        i32::decode_var(*body).ok_or_else(|| AppError::Corrupt("truncated varint".into()))?;
    body.advance(read);
    Ok(value)
}

fn read_bytes_field(body: &mut &[u8]) -> AppResult<Option<Bytes>> {
    let len = read_varint(body)?;
    if len == NO_KEY {
        return Ok(None);
    }
    if len < 0 || len as usize > body.len() {
        return Err(AppError::Corrupt(format!("invalid field length {len}")));
    }
    let field = Bytes::copy_from_slice(&body[..len as usize]);
    body.advance(len as usize);
    Ok(Some(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::from_message(
            Message::new("hello")
                .with_key("k1")
                .with_header("trace", "abc"),
            42,
            3,
            1_700_000_000_000,
        )
    }

    #[test]
    fn encode_matches_declared_size() -> AppResult<()> {
        let record = sample();
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        assert_eq!(buf.len(), record.encoded_size());

        let (decoded, read) = Record::decode(&buf)?.unwrap();
        assert_eq!(read, buf.len());
        assert_eq!(decoded, record);
        Ok(())
    }

    #[test]
    fn keyless_record_keeps_no_key() -> AppResult<()> {
        let record = Record::from_message(Message::new("v"), 0, 0, 1);
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        let (decoded, _) = Record::decode(&buf)?.unwrap();
        assert_eq!(decoded.key, None);
        Ok(())
    }

    #[test]
    fn truncated_frame_is_incomplete() -> AppResult<()> {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        assert!(Record::decode(&buf[..buf.len() - 1])?.is_none());
        assert!(Record::decode(&buf[..5])?.is_none());
        Ok(())
    }

    #[test]
    fn flipped_bit_is_corrupt() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        let last = buf.len() - 2;
        buf[last] ^= 0x01;
        assert!(matches!(Record::decode(&buf), Err(AppError::Corrupt(_))));
    }

    #[test]
    fn garbage_size_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_i64(0);
        buf.put_i32(-7);
        assert!(matches!(peek_frame(&buf), Err(AppError::Corrupt(_))));
    }
}
