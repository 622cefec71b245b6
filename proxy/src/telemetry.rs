//! Command telemetry
//!
//! Every command a client sends through the proxy becomes a
//! [`CommandObservation`]. Observations go to a [`CommandSink`]; the production
//! sink is the [`Emitter`], which batches them on a background task and hands
//! each batch to a [`PointWriter`] as InfluxDB line protocol.
//!
//! Emission is fire-and-forget. Write failures are logged by the batching task
//! and the affected batch is dropped.

use crate::config::InfluxConfig;
use crate::error::TelemetryError;
use crate::utils::timestamp_nanos;
use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};

/// Measurement name for command points
pub const MEASUREMENT: &str = "command";

/// One client command seen by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandObservation {
    pub server_name: String,
    pub command: String,
    pub arguments: String,
    pub byte_length: usize,
    pub timestamp: SystemTime,
}

impl CommandObservation {
    pub fn new(server_name: &str, command: &str, arguments: &str, byte_length: usize) -> Self {
        Self {
            server_name: server_name.to_string(),
            command: command.to_string(),
            arguments: arguments.to_string(),
            byte_length,
            timestamp: SystemTime::now(),
        }
    }

    /// Renders the observation as one line-protocol point.
    ///
    /// Empty tag values are left out since line protocol does not allow them.
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::from(MEASUREMENT);

        for (key, value) in [
            ("server", &self.server_name),
            ("cmd", &self.command),
            ("args", &self.arguments),
        ] {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(key);
            line.push('=');
            line.push_str(&escape_tag(value));
        }

        line.push_str(&format!(
            " bytes={}i {}",
            self.byte_length,
            timestamp_nanos(self.timestamp)
        ));
        line
    }
}

fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ',' | '=' | ' ' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Receiver of command observations. Must never block.
pub trait CommandSink: Send + Sync {
    fn emit(&self, observation: CommandObservation);
}

/// Destination of line-protocol batches
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, lines: &str) -> Result<(), TelemetryError>;
}

/// Writes batches to the InfluxDB v2 HTTP write API
pub struct InfluxWriter {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    token: String,
}

impl InfluxWriter {
    pub fn new(config: &InfluxConfig) -> Result<Self, TelemetryError> {
        let base = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
        let mut endpoint = reqwest::Url::parse(&base).map_err(|e| TelemetryError::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;
        endpoint
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
        })
    }

}

#[async_trait]
impl PointWriter for InfluxWriter {
    async fn write(&self, lines: &str) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Logs batches instead of storing them. Used when no store is configured.
pub struct LogWriter;

#[async_trait]
impl PointWriter for LogWriter {
    async fn write(&self, lines: &str) -> Result<(), TelemetryError> {
        for line in lines.lines() {
            debug!("telemetry: {}", line);
        }
        Ok(())
    }
}

/// Batching limits of the [`Emitter`]
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Points buffered before a write is forced
    pub batch_size: usize,
    /// Period of background writes
    pub flush_interval: Duration,
    /// Upper bound for [`Emitter::flush`] and [`Emitter::close`]
    pub flush_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            flush_interval: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

enum Message {
    Point(String),
    Flush(oneshot::Sender<Result<(), TelemetryError>>),
    Close(oneshot::Sender<Result<(), TelemetryError>>),
}

/// Batched asynchronous telemetry writer
pub struct Emitter {
    tx: mpsc::UnboundedSender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    flush_timeout: Duration,
}

impl Emitter {
    /// Starts the batching task. Must be called inside a tokio runtime.
    pub fn spawn(writer: Box<dyn PointWriter>, options: BatchOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let flush_timeout = options.flush_timeout;
        let worker = tokio::spawn(run_batcher(writer, rx, options));

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            flush_timeout,
        }
    }

    /// Emitter for the configured store, or a log-only one without a store.
    pub fn from_config(
        config: Option<&InfluxConfig>,
        options: BatchOptions,
    ) -> Result<Self, TelemetryError> {
        let writer: Box<dyn PointWriter> = match config {
            Some(config) => Box::new(InfluxWriter::new(config)?),
            None => Box::new(LogWriter),
        };
        Ok(Self::spawn(writer, options))
    }

    /// Writes everything buffered so far and waits for the result.
    pub async fn flush(&self) -> Result<(), TelemetryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TelemetryError::Closed);
        }
        let deadline = Instant::now() + self.flush_timeout;
        self.request(Message::Flush, deadline).await
    }

    /// Flushes and stops the batching task. Only the first call has any effect.
    ///
    /// The whole call is bounded by the flush timeout; a writer still busy at
    /// the deadline is aborted.
    pub async fn close(&self) -> Result<(), TelemetryError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let deadline = Instant::now() + self.flush_timeout;
        let result = self.request(Message::Close, deadline).await;

        let worker = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut worker) = worker {
            match timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Telemetry task failed: {}", e),
                Err(_) => {
                    warn!(
                        "Telemetry task still busy after {:?}, aborting",
                        self.flush_timeout
                    );
                    worker.abort();
                }
            }
        }

        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<(), TelemetryError>>) -> Message,
        deadline: Instant,
    ) -> Result<(), TelemetryError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(message(ack_tx))
            .map_err(|_| TelemetryError::Closed)?;

        match timeout_at(deadline, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TelemetryError::Closed),
            Err(_) => Err(TelemetryError::FlushTimeout),
        }
    }
}

impl CommandSink for Emitter {
    fn emit(&self, observation: CommandObservation) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Telemetry closed, dropping {} point", observation.command);
            return;
        }

        if self
            .tx
            .send(Message::Point(observation.to_line_protocol()))
            .is_err()
        {
            debug!("Telemetry task gone, dropping {} point", observation.command);
        }
    }
}

async fn run_batcher(
    writer: Box<dyn PointWriter>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    options: BatchOptions,
) {
    let mut batch: Vec<String> = Vec::new();
    let mut ticker = interval(options.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick since it fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(Message::Point(line)) => {
                        batch.push(line);
                        if batch.len() >= options.batch_size {
                            if let Err(e) = write_batch(writer.as_ref(), &mut batch).await {
                                error!("Could not write telemetry batch: {}", e);
                            }
                        }
                    }
                    Some(Message::Flush(ack)) => {
                        let _ = ack.send(write_batch(writer.as_ref(), &mut batch).await);
                    }
                    Some(Message::Close(ack)) => {
                        let _ = ack.send(write_batch(writer.as_ref(), &mut batch).await);
                        break;
                    }
                    None => {
                        if let Err(e) = write_batch(writer.as_ref(), &mut batch).await {
                            error!("Could not write final telemetry batch: {}", e);
                        }
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = write_batch(writer.as_ref(), &mut batch).await {
                    error!("Could not write telemetry batch: {}", e);
                }
            }
        }
    }

    debug!("Telemetry task stopped");
}

// The batch is cleared whether or not the write succeeds
async fn write_batch(writer: &dyn PointWriter, batch: &mut Vec<String>) -> Result<(), TelemetryError> {
    if batch.is_empty() {
        return Ok(());
    }

    let body = batch.join("\n");
    let points = batch.len();
    batch.clear();

    writer.write(&body).await?;
    debug!("Wrote {} telemetry points", points);
    Ok(())
}
