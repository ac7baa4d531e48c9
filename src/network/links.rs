//! TCP implementations of the remote seams
//!
//! Targets are resolved to their node through the buddy group directory
//! and nodes to an address through the configured peer list.

use std::collections::HashMap;
use std::sync::Arc;

use super::NetworkClient;
use crate::config::BuddyMirrorConfig;
use crate::error::{Error, OpsResult, Result};
use crate::mirror::protocol::{Message, MirrorReply, MirrorRequest, NodeType, OpResponse};
use crate::mirror::{MirrorTransport, SecondaryLink};
use crate::resync::CoordinatorLink;
use crate::state::{BuddyGroupDirectory, ConsistencyState, NodeId, TargetId};

/// Node addresses known to this node
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    addresses: HashMap<NodeId, String>,
}

impl PeerBook {
    pub fn from_config(config: &BuddyMirrorConfig) -> Self {
        let mut book = Self::default();
        for peer in &config.peers {
            book.insert(peer.id, peer.address.clone());
        }
        book.insert(config.node.id, config.node.bind_address.clone());
        book
    }

    pub fn insert(&mut self, node_id: NodeId, address: String) {
        self.addresses.insert(node_id, address);
    }

    pub fn address(&self, node_id: NodeId) -> Option<&str> {
        self.addresses.get(&node_id).map(String::as_str)
    }
}

/// Resolves the address of the node serving a target
struct TargetResolver {
    directory: Arc<BuddyGroupDirectory>,
    peers: Arc<PeerBook>,
}

impl TargetResolver {
    async fn address_of(&self, target_id: TargetId) -> Result<String> {
        let node_id = self
            .directory
            .node_of(target_id)
            .await
            .ok_or(Error::UnknownTarget(target_id))?;
        self.peers
            .address(node_id)
            .map(str::to_string)
            .ok_or_else(|| Error::Communication(format!("no address known for node {}", node_id)))
    }
}

/// Reaches the coordinator over TCP
pub struct NetworkCoordinatorLink {
    client: Arc<NetworkClient>,
    address: String,
}

impl NetworkCoordinatorLink {
    pub fn new(client: Arc<NetworkClient>, address: String) -> Self {
        Self { client, address }
    }
}

#[async_trait::async_trait]
impl CoordinatorLink for NetworkCoordinatorLink {
    async fn set_consistency_states(
        &self,
        node_type: NodeType,
        targets: Vec<TargetId>,
        states: Vec<ConsistencyState>,
    ) -> Result<OpsResult> {
        let request = Message::SetTargetConsistencyStates {
            node_type,
            targets,
            states,
        };

        match self.client.send(&self.address, request).await? {
            Message::SetTargetConsistencyStatesResponse { result } => Ok(result),
            Message::Error { result, message } => {
                tracing::debug!("Coordinator refused consistency update: {}", message);
                Ok(result)
            }
            other => {
                tracing::warn!("Coordinator answered with {}", other.type_name());
                Err(Error::UnexpectedResponse("SetTargetConsistencyStatesResponse"))
            }
        }
    }
}

/// Forwards operations from a primary to its secondary over TCP
pub struct NetworkSecondaryLink {
    client: Arc<NetworkClient>,
    resolver: TargetResolver,
}

impl NetworkSecondaryLink {
    pub fn new(
        client: Arc<NetworkClient>,
        directory: Arc<BuddyGroupDirectory>,
        peers: Arc<PeerBook>,
    ) -> Self {
        Self {
            client,
            resolver: TargetResolver { directory, peers },
        }
    }
}

#[async_trait::async_trait]
impl SecondaryLink for NetworkSecondaryLink {
    async fn forward(&self, secondary: TargetId, request: MirrorRequest) -> Result<MirrorReply> {
        let address = self.resolver.address_of(secondary).await?;

        match self.client.send(&address, Message::ForwardedOperation(request)).await? {
            Message::MirrorReply(reply) => Ok(reply),
            // The secondary was reached but could not apply the operation
            Message::Error { result, message } => {
                tracing::debug!("Secondary target {} failed: {}", secondary, message);
                Ok(MirrorReply::Response(OpResponse::new(result)))
            }
            other => {
                tracing::warn!("Secondary target {} answered with {}", secondary, other.type_name());
                Err(Error::UnexpectedResponse("MirrorReply"))
            }
        }
    }
}

/// Sends requests to the primary of a buddy group over TCP
pub struct NetworkMirrorTransport {
    client: Arc<NetworkClient>,
    resolver: TargetResolver,
}

impl NetworkMirrorTransport {
    pub fn new(
        client: Arc<NetworkClient>,
        directory: Arc<BuddyGroupDirectory>,
        peers: Arc<PeerBook>,
    ) -> Self {
        Self {
            client,
            resolver: TargetResolver { directory, peers },
        }
    }
}

#[async_trait::async_trait]
impl MirrorTransport for NetworkMirrorTransport {
    async fn send(&self, primary: TargetId, request: MirrorRequest) -> Result<MirrorReply> {
        let address = self.resolver.address_of(primary).await?;

        match self.client.send(&address, Message::MirrorRequest(request)).await? {
            Message::MirrorReply(reply) => Ok(reply),
            Message::Error { result, message } => {
                tracing::debug!("Primary target {} rejected request: {}", primary, message);
                Err(Error::Rejected(result))
            }
            other => {
                tracing::warn!("Primary target {} answered with {}", primary, other.type_name());
                Err(Error::UnexpectedResponse("MirrorReply"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MessageHandler, NetworkServer};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct FakeSecondary;

    #[async_trait::async_trait]
    impl MessageHandler for FakeSecondary {
        async fn handle(&self, _peer: &str, message: Message) -> Option<Message> {
            match message {
                Message::ForwardedOperation(request) if request.op_type == 10 => Some(
                    Message::MirrorReply(MirrorReply::Response(OpResponse::new(OpsResult::Success))),
                ),
                Message::ForwardedOperation(_) => Some(Message::Error {
                    result: OpsResult::Inval,
                    message: "unknown operation".into(),
                }),
                _ => None,
            }
        }
    }

    fn request(op_type: u16) -> MirrorRequest {
        MirrorRequest {
            group_id: 1,
            requestor: 7,
            seq: None,
            op_type,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_secondary_link_resolves_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(address.clone(), Arc::new(FakeSecondary)));
        {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await });
        }

        let directory = Arc::new(BuddyGroupDirectory::new(4));
        directory.map_target(2, 20, 1).await.unwrap();
        let mut peers = PeerBook::default();
        peers.insert(20, address);

        let client = Arc::new(NetworkClient::new(Duration::from_secs(1), Duration::from_secs(1)));
        let link = NetworkSecondaryLink::new(client, directory, Arc::new(peers));

        let reply = link.forward(2, request(10)).await.unwrap();
        assert_eq!(reply, MirrorReply::Response(OpResponse::new(OpsResult::Success)));

        let reply = link.forward(2, request(99)).await.unwrap();
        assert_eq!(reply, MirrorReply::Response(OpResponse::new(OpsResult::Inval)));

        assert!(matches!(link.forward(3, request(10)).await, Err(Error::UnknownTarget(3))));
        server.stop();
    }
}
