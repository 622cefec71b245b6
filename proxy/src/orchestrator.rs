//! Starts one acceptor per mapping and owns telemetry shutdown.

use crate::config::{Mapping, PacingConfig};
use crate::error::TelemetryError;
use crate::listener::Acceptor;
use crate::pacing::Pacing;
use crate::telemetry::{CommandSink, Emitter};
use log::{error, info};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Orchestrator {
    mappings: Vec<Mapping>,
    pacing: PacingConfig,
    emitter: Arc<Emitter>,
}

impl Orchestrator {
    pub fn new(mappings: Vec<Mapping>, pacing: PacingConfig, emitter: Arc<Emitter>) -> Self {
        Self {
            mappings,
            pacing,
            emitter,
        }
    }

    /// Runs every mapping until they have all stopped or `shutdown` resolves,
    /// then closes the telemetry emitter.
    pub async fn run<F>(self, shutdown: F) -> Result<(), TelemetryError>
    where
        F: Future<Output = ()>,
    {
        let mut handles = self.spawn_acceptors();

        let interrupted = tokio::select! {
            _ = wait_all(&mut handles) => false,
            _ = shutdown => true,
        };

        if interrupted {
            info!("Shutting down");
            for handle in &handles {
                handle.abort();
            }
        } else {
            info!("All listeners stopped");
        }

        self.shutdown().await
    }

    /// Flushes and closes telemetry. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        self.emitter.close().await
    }

    fn spawn_acceptors(&self) -> Vec<JoinHandle<()>> {
        let sink: Arc<dyn CommandSink> = self.emitter.clone();

        self.mappings
            .iter()
            .cloned()
            .map(|mapping| {
                let pacing = Arc::new(Pacing::from_config(&self.pacing));
                let acceptor = Acceptor::new(mapping, pacing, Arc::clone(&sink));

                tokio::spawn(async move {
                    let server_name = acceptor.mapping().server_name.clone();
                    if let Err(e) = acceptor.run().await {
                        error!("Proxy {} not started: {}", server_name, e);
                    }
                })
            })
            .collect()
    }
}

async fn wait_all(handles: &mut [JoinHandle<()>]) {
    for handle in handles.iter_mut() {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!("Listener task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{BatchOptions, LogWriter};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    fn mapping(name: &str, source: &str) -> Mapping {
        Mapping {
            server_name: name.to_string(),
            source_address: source.to_string(),
            target_address: "127.0.0.1:1".to_string(),
        }
    }

    fn emitter() -> Arc<Emitter> {
        Arc::new(Emitter::spawn(Box::new(LogWriter), BatchOptions::default()))
    }

    #[tokio::test]
    async fn test_returns_when_no_mapping_can_listen() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let emitter = emitter();

        let orchestrator = Orchestrator::new(
            vec![mapping("a", &addr), mapping("b", "no-such-host.invalid:1")],
            PacingConfig::default(),
            Arc::clone(&emitter),
        );

        tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.run(std::future::pending()),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(emitter.is_closed());
    }

    #[tokio::test]
    async fn test_failed_mapping_does_not_stop_others() {
        // Reserve a free port for the working mapping
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let free = probe.local_addr().unwrap().to_string();
        drop(probe);

        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = taken.local_addr().unwrap().to_string();

        let emitter = emitter();
        let orchestrator = Orchestrator::new(
            vec![mapping("busy", &busy), mapping("free", &free)],
            PacingConfig::default(),
            Arc::clone(&emitter),
        );

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(orchestrator.run(async move {
            let _ = stop_rx.await;
        }));

        let mut connected = false;
        for _ in 0..100 {
            if TcpStream::connect(&free).await.is_ok() {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connected);
        assert!(!emitter.is_closed());

        stop_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
        assert!(emitter.is_closed());
    }
}
