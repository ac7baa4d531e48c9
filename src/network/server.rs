//! Network Server
//!
//! TCP server for accepting connections from other nodes.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::mirror::protocol::Message;

/// Handles one incoming request and produces its answer
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, peer: &str, message: Message) -> Option<Message>;
}

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Message handler
    handler: Arc<dyn MessageHandler>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: Arc<dyn MessageHandler>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler, shutdown_rx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown_rx.changed() => break,
        };

        match message {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                if let Some(response) = handler.handle(peer_addr, message).await {
                    write_message(&mut writer, &response).await?;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsResult;
    use crate::network::client::send_once;
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _peer: &str, message: Message) -> Option<Message> {
            match message {
                Message::StatusRequest => Some(Message::TopologyResponse {
                    result: OpsResult::Success,
                }),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn test_server_answers_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(address.clone(), Arc::new(Echo)));

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let reply = send_once(&address, Message::StatusRequest, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(reply, Message::TopologyResponse { result: OpsResult::Success }));

        server.stop();
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
