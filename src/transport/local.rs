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

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use tracing::trace;

use super::{RequestHandler, Transport, TransportFuture};
use crate::metadata::{Envelope, MetadataChange, MetadataCommand, NodeId};
use crate::replica::{FetchRequest, FetchResponse, PublishAck, PublishRequest};
use crate::{AppError, AppResult};

/// In-process network connecting brokers that share one runtime.
///
/// Handlers are held weakly so a stopped broker simply becomes unreachable.
/// Isolating a node drops every message to or from it until it is healed.
#[derive(Default)]
pub struct LocalHub {
    handlers: DashMap<NodeId, Weak<dyn RequestHandler>>,
    isolated: DashSet<NodeId>,
}

impl Debug for LocalHub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("nodes", &self.handlers.len())
            .field("isolated", &self.isolated)
            .finish()
    }
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<H: RequestHandler>(&self, id: impl Into<NodeId>, handler: &Arc<H>) {
        let handler: Arc<dyn RequestHandler> = handler.clone();
        self.handlers.insert(id.into(), Arc::downgrade(&handler));
    }

    pub fn unregister(&self, id: &str) {
        self.handlers.remove(id);
    }

    pub fn isolate(&self, id: impl Into<NodeId>) {
        self.isolated.insert(id.into());
    }

    pub fn heal(&self, id: &str) {
        self.isolated.remove(id);
    }

    pub fn is_isolated(&self, id: &str) -> bool {
        self.isolated.contains(id)
    }

    /// The transport `id` uses to reach its peers.
    pub fn transport(self: &Arc<Self>, id: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            id: id.into(),
            hub: self.clone(),
        })
    }

    fn route(&self, from: &str, to: &str) -> AppResult<Arc<dyn RequestHandler>> {
        if self.is_isolated(from) || self.is_isolated(to) {
            return Err(AppError::Unreachable(format!("{from} -> {to} is cut off")));
        }
        self.handlers
            .get(to)
            .and_then(|handler| handler.upgrade())
            .ok_or_else(|| AppError::Unreachable(format!("{to} is not running")))
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    id: NodeId,
    hub: Arc<LocalHub>,
}

impl Transport for LocalTransport {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    fn send_raft(&self, envelope: Envelope) {
        match self.hub.route(&envelope.from, &envelope.to) {
            Ok(handler) => handler.handle_raft(envelope),
            Err(e) => trace!("dropping raft message: {}", e),
        }
    }

    fn fetch(&self, to: &NodeId, request: FetchRequest) -> TransportFuture<'_, FetchResponse> {
        let to = to.clone();
        Box::pin(async move {
            let handler = self.hub.route(&self.id, &to)?;
            handler.handle_fetch(request).await
        })
    }

    fn publish(&self, to: &NodeId, request: PublishRequest) -> TransportFuture<'_, PublishAck> {
        let to = to.clone();
        Box::pin(async move {
            let handler = self.hub.route(&self.id, &to)?;
            handler.handle_publish(request).await
        })
    }

    fn propose(&self, to: &NodeId, command: MetadataCommand) -> TransportFuture<'_, MetadataChange> {
        let to = to.clone();
        Box::pin(async move {
            let handler = self.hub.route(&self.id, &to)?;
            handler.handle_propose(command).await
        })
    }
}
