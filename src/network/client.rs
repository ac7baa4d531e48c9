//! Network Client
//!
//! Request/response exchanges with other nodes over pooled TCP streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::mirror::protocol::Message;

/// Pooled stream to one peer; one exchange at a time
struct PooledStream {
    stream: TcpStream,
    last_used: Instant,
}

type StreamPool = HashMap<String, Arc<Mutex<PooledStream>>>;

/// Request/response client keeping one stream per peer address
pub struct NetworkClient {
    pool: RwLock<StreamPool>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl NetworkClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for its answer
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.send_pooled(address, message)).await {
            Ok(answer) => answer,
            Err(_) => {
                // a late answer would desynchronise the pooled stream
                self.pool.write().await.remove(address);
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    async fn send_pooled(&self, address: &str, message: Message) -> Result<Message> {
        let pooled = self.pool.read().await.get(address).cloned();

        if let Some(pooled) = pooled {
            let mut pooled = pooled.lock().await;
            match exchange(&mut pooled.stream, &message).await {
                Ok(answer) => {
                    pooled.last_used = Instant::now();
                    return Ok(answer);
                }
                Err(e) => {
                    tracing::debug!("Dropping broken stream to {}: {}", address, e);
                    drop(pooled);
                    self.pool.write().await.remove(address);
                }
            }
        }

        let mut stream = connect(address, self.connect_timeout).await?;
        let answer = exchange(&mut stream, &message).await?;

        self.pool
            .write()
            .await
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PooledStream {
                    stream,
                    last_used: Instant::now(),
                }))
            });
        Ok(answer)
    }

    /// Close streams idle for longer than `max_idle`
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        self.pool.write().await.retain(|address, pooled| match pooled.try_lock() {
            Ok(p) if now.duration_since(p.last_used) > max_idle => {
                tracing::debug!("Closing idle stream to {}", address);
                false
            }
            _ => true,
        });
    }

    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

async fn connect(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::ConnectionTimeout(address.to_string()))?
        .map_err(|e| Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}

/// One request over a fresh connection
pub async fn send_once(address: &str, message: Message, deadline: Duration) -> Result<Message> {
    timeout(deadline, async {
        let mut stream = connect(address, deadline).await?;
        exchange(&mut stream, &message).await
    })
    .await
    .map_err(|_| Error::ConnectionTimeout(address.to_string()))?
}
