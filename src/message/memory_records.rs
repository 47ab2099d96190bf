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

use bytes::{Bytes, BytesMut};

use super::record::{peek_frame, Record};
use crate::{AppError, AppResult};

/// A contiguous run of encoded records, as read from a segment or shipped to
/// a follower.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MemoryRecords {
    buffer: Bytes,
}

impl std::fmt::Debug for MemoryRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecords")
            .field("buffer length", &self.buffer.len())
            .finish()
    }
}

impl MemoryRecords {
    pub fn new(buffer: Bytes) -> MemoryRecords {
        MemoryRecords { buffer }
    }

    pub fn empty() -> Self {
        MemoryRecords {
            buffer: Bytes::new(),
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut buf = BytesMut::new();
        for record in records {
            record.encode(&mut buf);
        }
        MemoryRecords {
            buffer: buf.freeze(),
        }
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter {
            buf: &self.buffer[..],
        }
    }

    /// Decodes and validates every record.
    pub fn records(&self) -> AppResult<Vec<Record>> {
        self.iter().collect()
    }

    pub fn first_offset(&self) -> Option<i64> {
        match peek_frame(&self.buffer) {
            Ok(Some((offset, _))) => Some(offset),
            _ => None,
        }
    }

    /// Walks frame headers only.
    pub fn last_offset(&self) -> Option<i64> {
        let mut buf = &self.buffer[..];
        let mut last = None;
        while let Ok(Some((offset, len))) = peek_frame(buf) {
            if len > buf.len() {
                break;
            }
            last = Some(offset);
            buf = &buf[len..];
        }
        last
    }
}

pub struct RecordIter<'a> {
    buf: &'a [u8],
}

impl Iterator for RecordIter<'_> {
    type Item = AppResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        match Record::decode(self.buf) {
            Ok(Some((record, len))) => {
                self.buf = &self.buf[len..];
                Some(Ok(record))
            }
            Ok(None) => {
                let remaining = self.buf.len();
                self.buf = &[];
                Some(Err(AppError::Corrupt(format!(
                    "{remaining} bytes of incomplete record"
                ))))
            }
            Err(e) => {
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn records(range: std::ops::Range<i64>) -> Vec<Record> {
        range
            .map(|offset| {
                Record::from_message(Message::new(format!("v{offset}")), offset, 1, 1000)
            })
            .collect()
    }

    #[test]
    fn offsets_and_decode() -> AppResult<()> {
        let original = records(5..9);
        let memory = MemoryRecords::from_records(&original);
        assert_eq!(memory.first_offset(), Some(5));
        assert_eq!(memory.last_offset(), Some(8));
        assert_eq!(memory.records()?, original);
        Ok(())
    }

    #[test]
    fn empty_records() -> AppResult<()> {
        let memory = MemoryRecords::empty();
        assert!(memory.is_empty());
        assert_eq!(memory.first_offset(), None);
        assert_eq!(memory.last_offset(), None);
        assert!(memory.records()?.is_empty());
        Ok(())
    }

    #[test]
    fn truncated_tail_is_reported() {
        let memory = MemoryRecords::from_records(&records(0..2));
        let cut = MemoryRecords::new(memory.buffer().slice(..memory.size() - 3));
        assert_eq!(cut.last_offset(), Some(0));
        assert!(matches!(cut.records(), Err(AppError::Corrupt(_))));
    }
}
