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

//! Record Format Constants
//!
//! Every record is stored as a self-delimiting frame:
//!
//! - Offset (8 bytes)
//! - Size of everything that follows (4 bytes)
//! - CRC-32C of everything after the CRC field (4 bytes)
//! - Magic (1 byte)
//! - Leader epoch (8 bytes)
//! - Timestamp in milliseconds (8 bytes)
//! - Key length (varint, -1 for no key) and key bytes
//! - Value length (varint) and value bytes
//! - Header count (varint), then per header: key length, key, value length, value
//!
//! All fixed-width integers are big endian.

pub const OFFSET_OFFSET: usize = 0;
pub const OFFSET_LENGTH: usize = 8;
pub const SIZE_OFFSET: usize = OFFSET_OFFSET + OFFSET_LENGTH;
pub const SIZE_LENGTH: usize = 4;
pub const LOG_OVERHEAD: usize = SIZE_OFFSET + SIZE_LENGTH;

pub const CRC_OFFSET: usize = LOG_OVERHEAD;
pub const CRC_LENGTH: usize = 4;
pub const MAGIC_OFFSET: usize = CRC_OFFSET + CRC_LENGTH;
pub const MAGIC_LENGTH: usize = 1;
pub const LEADER_EPOCH_OFFSET: usize = MAGIC_OFFSET + MAGIC_LENGTH;
pub const LEADER_EPOCH_LENGTH: usize = 8;
pub const TIMESTAMP_OFFSET: usize = LEADER_EPOCH_OFFSET + LEADER_EPOCH_LENGTH;
pub const TIMESTAMP_LENGTH: usize = 8;
pub const RECORD_FIXED_SIZE: usize = TIMESTAMP_OFFSET + TIMESTAMP_LENGTH;

/// Fixed part plus one byte for each of the three mandatory varints.
pub const MIN_RECORD_SIZE: usize = RECORD_FIXED_SIZE + 3;
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

pub const MAGIC_V1: i8 = 1;
pub const NO_KEY: i32 = -1;
