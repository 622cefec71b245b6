//! Connection acceptor for one mapping
//!
//! An [`Acceptor`] first resolves the mapping's source address and binds a
//! listener. Failure there is final for the mapping: it is logged and the
//! mapping never serves, while other mappings carry on. Once listening, the
//! acceptor loops forever: wait for the admission gate, accept one
//! connection, spawn its session, hand the gate back after the admission
//! delay.

use crate::config::Mapping;
use crate::error::ListenerError;
use crate::pacing::Pacing;
use crate::relay::handle_connection;
use crate::telemetry::CommandSink;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener};

pub struct Acceptor {
    mapping: Arc<Mapping>,
    pacing: Arc<Pacing>,
    sink: Arc<dyn CommandSink>,
}

impl Acceptor {
    pub fn new(mapping: Mapping, pacing: Arc<Pacing>, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            mapping: Arc::new(mapping),
            pacing,
            sink,
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Resolves the source address and opens the listening socket.
    pub async fn bind(&self) -> Result<TcpListener, ListenerError> {
        let source = &self.mapping.source_address;

        let addr = lookup_host(source.as_str())
            .await
            .map_err(|e| ListenerError::Resolve {
                addr: source.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| ListenerError::Unresolved(source.clone()))?;

        TcpListener::bind(addr)
            .await
            .map_err(|e| ListenerError::Bind { addr, source: e })
    }

    /// Accepts connections on `listener` until the process exits.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let token = self.pacing.acquire_admission().await;

            let (stream, peer) = match listener.accept().await {
                Ok(connection) => connection,
                Err(e) => {
                    error!("Cannot accept connection for {}: {}", self.mapping.server_name, e);
                    self.pacing.release_admission(token);
                    continue;
                }
            };

            debug!("Accepted {} for {}", peer, self.mapping.server_name);
            tokio::spawn(handle_connection(
                stream,
                Arc::clone(&self.mapping),
                Arc::clone(&self.pacing),
                Arc::clone(&self.sink),
            ));

            self.pacing.release_admission(token);
        }
    }

    /// Binds and serves. Only returns if the listener cannot be opened.
    pub async fn run(self) -> Result<(), ListenerError> {
        let listener = self.bind().await?;

        match listener.local_addr() {
            Ok(addr) => info!("Listening on {} for {}", addr, self.mapping.server_name),
            Err(_) => info!(
                "Listening on {} for {}",
                self.mapping.source_address, self.mapping.server_name
            ),
        }

        self.serve(listener).await;
        Ok(())
    }
}
