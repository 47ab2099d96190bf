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

//! How brokers reach each other.
//!
//! Consensus traffic is fire-and-forget: Raft tolerates loss, so
//! [`Transport::send_raft`] never waits. Replica fetches, forwarded
//! publishes and metadata proposals redirected to the consensus leader are
//! request/response.

mod local;

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

use crate::metadata::{Envelope, MetadataChange, MetadataCommand, NodeId};
use crate::replica::{FetchRequest, FetchResponse, PublishAck, PublishRequest};
use crate::{AppError, AppResult};

pub use local::{LocalHub, LocalTransport};

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'a>>;

/// Outbound side, one instance per broker.
pub trait Transport: Send + Sync + Debug + 'static {
    fn local_id(&self) -> &NodeId;
    fn send_raft(&self, envelope: Envelope);
    fn fetch(&self, to: &NodeId, request: FetchRequest) -> TransportFuture<'_, FetchResponse>;
    fn publish(&self, to: &NodeId, request: PublishRequest) -> TransportFuture<'_, PublishAck>;
    fn propose(&self, to: &NodeId, command: MetadataCommand) -> TransportFuture<'_, MetadataChange>;
}

/// Inbound side, implemented by the broker.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle_raft(&self, envelope: Envelope);
    fn handle_fetch(&self, request: FetchRequest) -> TransportFuture<'_, FetchResponse>;
    fn handle_publish(&self, request: PublishRequest) -> TransportFuture<'_, PublishAck>;

    /// Proposes a command redirected by a peer that does not lead consensus.
    fn handle_propose(&self, command: MetadataCommand) -> TransportFuture<'_, MetadataChange> {
        let name = command.name();
        Box::pin(async move {
            Err(AppError::InvalidOperation(format!(
                "{name} not accepted here"
            )))
        })
    }
}
