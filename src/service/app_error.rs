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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("raft storage error: {0}")]
    StorageError(#[from] rocksdb::Error),

    #[error("background task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// replication and consensus errors
    #[error("not leader: {0}")]
    NotLeader(String),

    #[error("stale term: {0}")]
    StaleTerm(String),

    #[error("stale epoch: {0}")]
    StaleEpoch(String),

    #[error("under replicated: {0}")]
    UnderReplicated(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("quorum lost: {0}")]
    QuorumLost(String),

    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// storage errors
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("offset out of range, valid range is [{0}, {1})")]
    OffsetOutOfRange(i64, i64),

    /// stream errors
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("stream already exists: {0}")]
    StreamExists(String),

    #[error("shutting down: {0}")]
    ShuttingDown(String),
}

impl AppError {
    /// Errors a caller can recover from by refreshing metadata or retrying later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::NotLeader(_)
                | AppError::StaleTerm(_)
                | AppError::StaleEpoch(_)
                | AppError::Timeout(_)
                | AppError::QuorumLost(_)
                | AppError::Unreachable(_)
        )
    }

    /// Builds an equivalent error for fanning one failure out to many waiters.
    ///
    /// Variants wrapping foreign error types are flattened into their message.
    pub fn duplicate(&self) -> AppError {
        match self {
            AppError::IllegalStateError(s) => AppError::IllegalStateError(s.clone()),
            AppError::InvalidValue(s) => AppError::InvalidValue(s.clone()),
            AppError::InvalidOperation(s) => AppError::InvalidOperation(s.clone()),
            AppError::DetailedIoError(s) => AppError::DetailedIoError(s.clone()),
            AppError::ChannelSendError(s) => AppError::ChannelSendError(s.clone()),
            AppError::ChannelRecvError(s) => AppError::ChannelRecvError(s.clone()),
            AppError::NotLeader(s) => AppError::NotLeader(s.clone()),
            AppError::StaleTerm(s) => AppError::StaleTerm(s.clone()),
            AppError::StaleEpoch(s) => AppError::StaleEpoch(s.clone()),
            AppError::UnderReplicated(s) => AppError::UnderReplicated(s.clone()),
            AppError::Timeout(s) => AppError::Timeout(s.clone()),
            AppError::QuorumLost(s) => AppError::QuorumLost(s.clone()),
            AppError::Unreachable(s) => AppError::Unreachable(s.clone()),
            AppError::Corrupt(s) => AppError::Corrupt(s.clone()),
            AppError::OffsetOutOfRange(start, end) => AppError::OffsetOutOfRange(*start, *end),
            AppError::StreamNotFound(s) => AppError::StreamNotFound(s.clone()),
            AppError::StreamExists(s) => AppError::StreamExists(s.clone()),
            AppError::ShuttingDown(s) => AppError::ShuttingDown(s.clone()),
            AppError::IoError(_)
            | AppError::ConfigFileError(_)
            | AppError::SerdeError(_)
            | AppError::StorageError(_)
            | AppError::JoinError(_) => AppError::DetailedIoError(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keeps_variant_and_message() {
        let err = AppError::UnderReplicated("isr 1 < min isr 2".into());
        let copy = err.duplicate();
        assert!(matches!(copy, AppError::UnderReplicated(ref s) if s == "isr 1 < min isr 2"));

        let io = AppError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(matches!(io.duplicate(), AppError::DetailedIoError(_)));
    }

    #[test]
    fn retriable_errors() {
        assert!(AppError::NotLeader("b".into()).is_retriable());
        assert!(AppError::QuorumLost("no majority".into()).is_retriable());
        assert!(!AppError::Corrupt("crc".into()).is_retriable());
        assert!(!AppError::UnderReplicated("isr".into()).is_retriable());
    }
}
