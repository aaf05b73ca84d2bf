use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HUB_QUEUE_CAPACITY: usize = 1_024;

/// What the directory stores for a routable connection.
#[derive(Debug, Clone)]
pub struct HubMember {
    pub handle: String,
    pub connection_id: String,
    pub outbound: mpsc::Sender<Value>,
}

enum HubCommand {
    Register(HubMember),
    Unregister {
        handle: String,
        connection_id: String,
    },
    Route {
        handle: String,
        payload: Value,
    },
    Count(oneshot::Sender<usize>),
    #[cfg(test)]
    Snapshot(oneshot::Sender<Vec<(String, String)>>),
}

/// Cloneable front door to the registry actor. The directory lives inside the
/// spawned task and is only reachable through these requests.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(member) => write!(f, "Register({})", member.handle),
            Self::Unregister { handle, .. } => write!(f, "Unregister({handle})"),
            Self::Route { handle, .. } => write!(f, "Route({handle})"),
            Self::Count(_) => f.write_str("Count"),
            #[cfg(test)]
            Self::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

struct Hub {
    directory: HashMap<String, HubMember>,
    route_timeout: Duration,
}

impl HubHandle {
    pub fn spawn(route_timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let hub = Hub {
            directory: HashMap::new(),
            route_timeout,
        };
        let task = tokio::spawn(hub.run(rx));
        (Self { tx }, task)
    }

    pub async fn register(&self, member: HubMember) {
        self.submit(HubCommand::Register(member)).await;
    }

    pub async fn unregister(&self, handle: &str, connection_id: &str) {
        self.submit(HubCommand::Unregister {
            handle: handle.to_owned(),
            connection_id: connection_id.to_owned(),
        })
        .await;
    }

    pub async fn route(&self, handle: &str, payload: Value) {
        self.submit(HubCommand::Route {
            handle: handle.to_owned(),
            payload,
        })
        .await;
    }

    pub async fn connected_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(HubCommand::Count(reply_tx)).await;
        reply_rx.await.unwrap_or(0)
    }

    #[cfg(test)]
    pub async fn directory_snapshot(&self) -> Vec<(String, String)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(HubCommand::Snapshot(reply_tx)).await;
        let mut entries = reply_rx.await.unwrap_or_default();
        entries.sort();
        entries
    }

    async fn submit(&self, command: HubCommand) {
        if let Err(err) = self.tx.send(command).await {
            warn!("hub is not running, dropped {:?}", err.0);
        }
    }
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        debug!("hub started");
        while let Some(command) = rx.recv().await {
            self.apply(command).await;
        }
        debug!(
            "hub stopped with {} registered connections",
            self.directory.len()
        );
    }

    async fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(member) => {
                info!(
                    "hub register handle={} conn_id={}",
                    member.handle, member.connection_id
                );
                if let Some(previous) = self.directory.insert(member.handle.clone(), member) {
                    debug!(
                        "hub handle={} replaced conn_id={}",
                        previous.handle, previous.connection_id
                    );
                }
            }
            HubCommand::Unregister {
                handle,
                connection_id,
            } => {
                let owned = self
                    .directory
                    .get(&handle)
                    .is_some_and(|member| member.connection_id == connection_id);
                if owned {
                    // Dropping the member drops the hub's outbound sender.
                    self.directory.remove(&handle);
                    info!("hub unregister handle={handle} conn_id={connection_id}");
                }
            }
            HubCommand::Route { handle, payload } => {
                let Some(member) = self.directory.get(&handle) else {
                    debug!("hub route to unknown handle={handle} dropped");
                    return;
                };
                match member.outbound.send_timeout(payload, self.route_timeout).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(
                            "hub route to handle={handle} conn_id={} timed out, payload dropped",
                            member.connection_id
                        );
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        debug!("hub route to handle={handle} hit a closed connection");
                    }
                }
            }
            HubCommand::Count(reply) => {
                let _ = reply.send(self.directory.len());
            }
            #[cfg(test)]
            HubCommand::Snapshot(reply) => {
                let entries = self
                    .directory
                    .values()
                    .map(|member| (member.handle.clone(), member.connection_id.clone()))
                    .collect();
                let _ = reply.send(entries);
            }
        }
    }
}
