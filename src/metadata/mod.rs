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

//! Cluster metadata replicated through Raft.
//!
//! [`MetadataState`] is a deterministic state machine over
//! [`MetadataCommand`]s. [`MetadataStore`] runs the consensus driver and
//! publishes every applied change.

mod command;
pub(crate) mod raft;
mod state;
mod store;

pub use command::{
    MetadataChange, MetadataCommand, MetadataEvent, NodeId, PartitionAssignment, PartitionMeta,
};
pub use raft::{Envelope, RaftMessage};
pub use state::{MetadataState, StreamMeta};
pub use store::{MetadataStore, RaftStatus};
