//! Per-emulator TCP proxies whose traffic drives on-demand starts.

use std::sync::Arc;

use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};

use super::{
    Broker, ProxyView,
    error::{BrokerError, BrokerResult},
};

/// A live proxy: the listening port plus the accept loop's controls.
#[derive(Debug)]
pub(crate) struct ProxyRecord {
    pub emulator_id: String,
    pub port: u16,
    /// Whether the port was leased from the picker (vs caller-requested).
    leased: bool,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ProxyRecord {
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl Broker {
    /// Create the one proxy an emulator may have. `requested_port == 0`
    /// leases a port from the picker; any other value must bind.
    pub async fn create_proxy(
        self: &Arc<Self>,
        emulator_id: &str,
        requested_port: u16,
    ) -> BrokerResult<ProxyView> {
        {
            let inner = self.inner.lock();
            let record = inner.emulators.get(emulator_id).ok_or_else(|| {
                BrokerError::FailedPrecondition(format!(
                    "cannot proxy for the unknown emulator {emulator_id:?}"
                ))
            })?;
            if !inner.rules.contains_key(&record.rule_id) {
                return Err(BrokerError::FailedPrecondition(format!(
                    "emulator {emulator_id:?} has no resolve rule to proxy through"
                )));
            }
            if inner.proxies.contains_key(emulator_id) {
                return Err(BrokerError::AlreadyExists(format!(
                    "a proxy for emulator {emulator_id:?} already exists"
                )));
            }
        }

        let (port, leased) = if requested_port == 0 {
            (self.ports.next()?, true)
        } else {
            (requested_port, false)
        };
        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(error) => {
                if leased {
                    self.ports.release(port);
                }
                return Err(BrokerError::AlreadyExists(format!(
                    "proxy port {port} could not be bound: {error}"
                )));
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_accept_loop(
            Arc::clone(self),
            emulator_id.to_string(),
            listener,
            shutdown_rx,
        );
        let record = ProxyRecord {
            emulator_id: emulator_id.to_string(),
            port,
            leased,
            shutdown: shutdown_tx,
            handle,
        };

        let stale = {
            let mut inner = self.inner.lock();
            if !inner.emulators.contains_key(emulator_id)
                || inner.proxies.contains_key(emulator_id)
            {
                Some(record)
            } else {
                inner.proxies.insert(emulator_id.to_string(), record);
                None
            }
        };
        if let Some(record) = stale {
            // Lost a race with a concurrent create or delete.
            let leased = record.leased;
            let lost_port = record.port;
            record.stop().await;
            if leased {
                self.ports.release(lost_port);
            }
            return Err(BrokerError::AlreadyExists(format!(
                "a proxy for emulator {emulator_id:?} already exists"
            )));
        }

        tracing::info!(emulator = emulator_id, port, "proxy listening");
        Ok(ProxyView {
            emulator_id: emulator_id.to_string(),
            port,
        })
    }

    pub fn get_proxy(&self, emulator_id: &str) -> BrokerResult<ProxyView> {
        let inner = self.inner.lock();
        inner
            .proxies
            .get(emulator_id)
            .map(|record| ProxyView {
                emulator_id: record.emulator_id.clone(),
                port: record.port,
            })
            .ok_or_else(|| {
                BrokerError::NotFound(format!("no proxy exists for emulator {emulator_id:?}"))
            })
    }

    pub fn list_proxies(&self) -> Vec<ProxyView> {
        let inner = self.inner.lock();
        let mut views: Vec<ProxyView> = inner
            .proxies
            .values()
            .map(|record| ProxyView {
                emulator_id: record.emulator_id.clone(),
                port: record.port,
            })
            .collect();
        views.sort_by(|a, b| a.emulator_id.cmp(&b.emulator_id));
        views
    }

    pub(crate) fn drain_proxies(&self) -> Vec<ProxyRecord> {
        let mut inner = self.inner.lock();
        let ids: Vec<String> = inner.proxies.keys().cloned().collect();
        ids.into_iter()
            .filter_map(|id| inner.proxies.remove(&id))
            .collect()
    }
}

fn spawn_accept_loop(
    broker: Arc<Broker>,
    emulator_id: String,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let broker = broker.clone();
                            let emulator_id = emulator_id.clone();
                            tokio::spawn(async move {
                                forward_connection(broker, emulator_id, stream).await;
                            });
                        }
                        Err(error) => {
                            tracing::warn!(%error, emulator = %emulator_id, "proxy accept failed");
                        }
                    }
                }
            }
        }
    })
}

/// Resolve the emulator's first target pattern (starting it on demand when
/// configured) and shuttle bytes until either side closes.
async fn forward_connection(broker: Arc<Broker>, emulator_id: String, mut client: TcpStream) {
    let pattern = {
        let inner = broker.inner.lock();
        inner
            .emulators
            .get(&emulator_id)
            .and_then(|record| inner.rules.get(&record.rule_id))
            .and_then(|rule| rule.target_patterns.first().cloned())
    };
    let Some(pattern) = pattern else {
        tracing::warn!(emulator = %emulator_id, "proxied connection dropped: no target pattern");
        return;
    };

    let destination = match broker.resolve(&pattern, None).await {
        Ok(outcome) => outcome.target,
        Err(error) => {
            tracing::warn!(%error, emulator = %emulator_id, "proxied connection dropped");
            return;
        }
    };

    match TcpStream::connect(&destination).await {
        Ok(mut upstream) => {
            let _ = copy_bidirectional(&mut client, &mut upstream).await;
        }
        Err(error) => {
            tracing::warn!(%error, emulator = %emulator_id, destination = %destination, "proxy dial failed");
        }
    }
}
