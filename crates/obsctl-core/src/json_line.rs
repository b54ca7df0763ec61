//! Newline-delimited JSON over TCP, one connection per subordinate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::transport::{SignalUpdate, TransportAdapter, TransportError};

const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Outbound<'a> {
    Call {
        id: u64,
        command: &'a str,
        payload: Value,
    },
    Ping {
        id: u64,
    },
    Subscribe {
        id: u64,
        signal: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Inbound {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        message: Option<String>,
    },
    Event {
        signal: String,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug)]
struct Reply {
    ok: bool,
    message: Option<String>,
}

#[derive(Default)]
struct LinkShared {
    alive: AtomicBool,
    waiters: parking_lot::Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    subscribers: parking_lot::Mutex<HashMap<String, Vec<mpsc::Sender<SignalUpdate>>>>,
}

impl LinkShared {
    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.waiters.lock().clear();
        for (_, senders) in self.subscribers.lock().drain() {
            for tx in senders {
                let _ = tx.try_send(Err(TransportError::Disconnected));
            }
        }
    }

    fn dispatch(&self, frame: Inbound) {
        match frame {
            Inbound::Reply { id, ok, message } => {
                let waiter = self.waiters.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Reply { ok, message });
                    }
                    None => debug!(id, "reply without a waiter"),
                }
            }
            Inbound::Event { signal, value, error } => {
                let update = match (error, value) {
                    (Some(err), _) => Err(TransportError::Remote {
                        command: signal.clone(),
                        reason: err,
                    }),
                    (None, Some(value)) => Ok(value),
                    (None, None) => Err(TransportError::Protocol(format!(
                        "event for {signal} without value"
                    ))),
                };
                let mut subscribers = self.subscribers.lock();
                if let Some(senders) = subscribers.get_mut(&signal) {
                    senders.retain(|tx| match tx.try_send(update.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(signal = %signal, "subscriber lagging, update dropped");
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }
            }
        }
    }
}

/// Removes the waiter when the request finishes or its future is dropped.
struct WaiterGuard<'a> {
    shared: &'a LinkShared,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.shared.waiters.lock().remove(&self.id);
    }
}

struct Link {
    shared: Arc<LinkShared>,
    writer: AsyncMutex<OwnedWriteHalf>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Link {
    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: &Outbound<'_>) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            self.shared.close();
            return Err(TransportError::Io(err.to_string()));
        }
        Ok(())
    }

    async fn request(&self, id: u64, frame: Outbound<'_>) -> Result<Reply, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().insert(id, tx);
        let _waiter = WaiterGuard {
            shared: &self.shared,
            id,
        };
        self.send(&frame).await?;
        rx.await.map_err(|_| TransportError::Disconnected)
    }
}

async fn read_loop(device: String, reader: OwnedReadHalf, shared: Arc<LinkShared>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Inbound>(&line) {
                    Ok(frame) => shared.dispatch(frame),
                    Err(err) => warn!(device = %device, error = %err, "malformed frame ignored"),
                }
            }
            Ok(None) => {
                info!(device = %device, "subordinate closed the connection");
                break;
            }
            Err(err) => {
                warn!(device = %device, error = %err, "read failed");
                break;
            }
        }
    }
    shared.close();
}

/// [`TransportAdapter`] speaking newline-delimited JSON frames over TCP.
pub struct JsonLineTransport {
    endpoints: HashMap<String, String>,
    slots: HashMap<String, AsyncMutex<Option<Arc<Link>>>>,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl JsonLineTransport {
    /// `endpoints` maps subordinate id to `host:port`.
    pub fn new(endpoints: HashMap<String, String>, connect_timeout: Duration) -> Self {
        let slots = endpoints
            .keys()
            .map(|id| (id.clone(), AsyncMutex::new(None)))
            .collect();
        Self {
            endpoints,
            slots,
            connect_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Requests on `device_id` still waiting for a reply.
    #[cfg(test)]
    pub(crate) async fn waiting(&self, device_id: &str) -> Option<usize> {
        let slot = self.slots.get(device_id)?.lock().await;
        slot.as_ref().map(|link| link.shared.waiters.lock().len())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn link(&self, device_id: &str) -> Result<Arc<Link>, TransportError> {
        let (Some(address), Some(slot)) = (self.endpoints.get(device_id), self.slots.get(device_id)) else {
            return Err(TransportError::UnknownDevice(device_id.to_string()));
        };

        let mut slot = slot.lock().await;
        if let Some(link) = slot.as_ref() {
            if link.is_alive() {
                return Ok(Arc::clone(link));
            }
        }

        let stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                *slot = None;
                return Err(TransportError::Io(format!("connect {address}: {err}")));
            }
            Err(_) => {
                *slot = None;
                return Err(TransportError::Timeout);
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(LinkShared::default());
        shared.alive.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(device_id.to_string(), read_half, Arc::clone(&shared)));

        let link = Arc::new(Link {
            shared,
            writer: AsyncMutex::new(write_half),
            reader,
        });
        info!(device = %device_id, %address, "connected to subordinate");
        *slot = Some(Arc::clone(&link));
        Ok(link)
    }
}

#[async_trait]
impl TransportAdapter for JsonLineTransport {
    async fn call(
        &self,
        device_id: &str,
        command: &str,
        payload: Value,
    ) -> Result<Option<String>, TransportError> {
        let link = self.link(device_id).await?;
        let id = self.next_id();
        let reply = link
            .request(id, Outbound::Call { id, command, payload })
            .await?;
        if reply.ok {
            Ok(reply.message)
        } else {
            Err(TransportError::Remote {
                command: command.to_string(),
                reason: reply.message.unwrap_or_else(|| "no reason given".to_string()),
            })
        }
    }

    async fn subscribe(
        &self,
        device_id: &str,
        signal: &str,
    ) -> Result<mpsc::Receiver<SignalUpdate>, TransportError> {
        let link = self.link(device_id).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        link.shared
            .subscribers
            .lock()
            .entry(signal.to_string())
            .or_default()
            .push(tx);

        let id = self.next_id();
        let reply = link.request(id, Outbound::Subscribe { id, signal }).await?;
        if !reply.ok {
            return Err(TransportError::Remote {
                command: format!("subscribe {signal}"),
                reason: reply.message.unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        Ok(rx)
    }

    async fn ping(&self, device_id: &str) -> Result<(), TransportError> {
        let link = self.link(device_id).await?;
        let id = self.next_id();
        let reply = link.request(id, Outbound::Ping { id }).await?;
        if reply.ok {
            Ok(())
        } else {
            Err(TransportError::Remote {
                command: "ping".to_string(),
                reason: reply.message.unwrap_or_else(|| "no reason given".to_string()),
            })
        }
    }
}
