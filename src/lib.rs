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

//! driftmq: durable, replicated streams layered over a pub/sub transport.
//!
//! A [`Broker`] hosts partition replicas, replicates cluster metadata
//! through Raft and batches publishes into segment backed logs.

mod activity;
mod batcher;
mod log;
mod message;
mod metadata;
mod replica;
mod service;
mod transport;
mod utils;

pub use activity::{ActivityEvent, ACTIVITY_STREAM};
pub use log::{CheckPointFile, LogManager, LogSegment, PartitionLog, ReadOnlyIndexFile};
pub use message::{MemoryRecords, Message, Record, RecordHeader, StreamPartition};
pub use metadata::{MetadataState, NodeId, PartitionMeta, RaftStatus, StreamMeta};
pub use replica::{AckPolicy, PartitionReplicator, PublishAck};
pub use service::{
    setup_local_tracing, setup_tracing, ActivityStreamConfig, AppError, AppResult, BatchConfig,
    Broker, BrokerConfig, ClusteringConfig, CompactSetting, CustomStreamConfig, GeneralConfig,
    OtelGuard, Shutdown, StreamsConfig, DEFAULT_NAMESPACE,
};
pub use transport::{LocalHub, LocalTransport, RequestHandler, Transport};
