use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{self, LokiSourceConfig, Mode, ResolvedConfig},
    error::LokiError,
    event::Event,
    loki::{client::LokiClient, types::LogStream},
    metrics,
};

/// Contract between the acquisition framework and a log source. The
/// framework configures the source once, then drives exactly one of the
/// acquisition calls; the shutdown token is the framework's lifecycle.
#[async_trait]
pub trait DataSource {
    fn get_name(&self) -> &'static str;
    fn get_mode(&self) -> Mode;
    fn supported_modes(&self) -> &'static [Mode];
    fn can_run(&self) -> Result<()>;
    fn dump(&self) -> String;
    fn configure(&mut self, document: &[u8]) -> Result<()>;
    fn configure_by_dsn(&mut self, dsn: &str, labels: HashMap<String, String>) -> Result<()>;
    async fn one_shot_acquisition(
        &self,
        out: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Result<()>;
    async fn streaming_acquisition(
        &self,
        out: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// The Loki acquisition source. Unconfigured until `configure` or
/// `configure_by_dsn` succeeds; immutable afterwards.
#[derive(Default)]
pub struct LokiSource {
    client: Option<LokiClient>,
}

impl LokiSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log level requested through the DSN, for the framework to apply to
    /// its subscriber. `None` means inherit.
    pub fn log_level(&self) -> Option<tracing::Level> {
        self.client.as_ref().and_then(|client| client.config().log_level)
    }

    fn client(&self) -> Result<&LokiClient> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("loki source is not configured"))
    }

    fn install(&mut self, resolved: ResolvedConfig) -> Result<()> {
        info!(
            url = %resolved.base_url,
            mode = %resolved.mode,
            query = %resolved.query,
            "configured loki source"
        );
        self.client = Some(LokiClient::new(resolved)?);
        Ok(())
    }

    async fn wait_for_ready(
        &self,
        client: &LokiClient,
        shutdown: &CancellationToken,
    ) -> Result<ReadyOutcome> {
        match client.ready(shutdown).await {
            Ok(()) => Ok(ReadyOutcome::Ready),
            Err(LokiError::Cancelled) => {
                debug!("shutdown requested while waiting for loki readiness");
                Ok(ReadyOutcome::Interrupted)
            }
            Err(error) => Err(anyhow!("loki is not ready: {error}")),
        }
    }
}

enum ReadyOutcome {
    Ready,
    Interrupted,
}

#[async_trait]
impl DataSource for LokiSource {
    fn get_name(&self) -> &'static str {
        "loki"
    }

    fn get_mode(&self) -> Mode {
        self.client
            .as_ref()
            .map(|client| client.config().mode)
            .unwrap_or(Mode::Tail)
    }

    fn supported_modes(&self) -> &'static [Mode] {
        &[Mode::Tail, Mode::Cat]
    }

    fn can_run(&self) -> Result<()> {
        Ok(())
    }

    fn dump(&self) -> String {
        match &self.client {
            Some(client) => format!("{:#?}", client.config()),
            None => "unconfigured loki source".to_string(),
        }
    }

    fn configure(&mut self, document: &[u8]) -> Result<()> {
        let resolved = LokiSourceConfig::from_yaml(document)?.resolve()?;
        self.install(resolved)
    }

    fn configure_by_dsn(&mut self, dsn: &str, labels: HashMap<String, String>) -> Result<()> {
        let resolved = config::resolve_dsn(dsn, labels)?;
        self.install(resolved)
    }

    /// Replays the configured window, then returns. A shutdown mid-replay
    /// cancels pagination and is reported as success.
    async fn one_shot_acquisition(
        &self,
        out: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let client = self.client()?;
        let config = client.config();
        info!(query = %config.query, "starting one-shot loki acquisition");

        if let ReadyOutcome::Interrupted = self.wait_for_ready(client, &shutdown).await? {
            return Ok(());
        }

        let cancel = shutdown.child_token();
        let (mut batches, paginator) = client.query_range(cancel.clone());
        let source = config.base_url.to_string();
        let mut interrupted = false;

        while !interrupted {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
                batch = batches.recv() => match batch {
                    None => break,
                    Some(batch) => batch,
                },
            };

            for stream in &batch.data.result {
                if !publish_entries(&out, &shutdown, config, &source, stream).await {
                    interrupted = true;
                    break;
                }
            }
        }

        cancel.cancel();
        drop(batches);
        let outcome = paginator.await.context("loki paginator task failed")?;
        if interrupted {
            debug!("one-shot loki acquisition interrupted by shutdown");
            return Ok(());
        }
        outcome.context("loki range query failed")?;
        info!("one-shot loki acquisition drained the requested window");
        Ok(())
    }

    /// Follows the tail websocket until shutdown or a stream failure.
    async fn streaming_acquisition(
        &self,
        out: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let client = self.client()?;
        let config = client.config();
        info!(query = %config.query, "starting streaming loki acquisition");

        if let ReadyOutcome::Interrupted = self.wait_for_ready(client, &shutdown).await? {
            return Ok(());
        }

        let cancel = shutdown.child_token();
        let (mut responses, reader) = match client.tail(cancel.clone()).await {
            Ok(tail) => tail,
            Err(LokiError::Cancelled) => return Ok(()),
            Err(error) => {
                return Err(error).context("failed to connect to the loki tail endpoint");
            }
        };
        let source = config.base_url.to_string();
        let mut interrupted = false;

        while !interrupted {
            let response = tokio::select! {
                _ = shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
                response = responses.recv() => match response {
                    None => break,
                    Some(response) => response,
                },
            };

            if !response.dropped_entries.is_empty() {
                warn!(
                    count = response.dropped_entries.len(),
                    "loki dropped entries on the tail stream"
                );
            }
            if response.streams.is_empty() {
                debug!("empty tail response");
                continue;
            }

            for stream in &response.streams {
                if !publish_entries(&out, &shutdown, config, &source, stream).await {
                    interrupted = true;
                    break;
                }
            }
        }

        cancel.cancel();
        drop(responses);
        let outcome = reader.await.context("loki tail reader task failed")?;
        if interrupted {
            debug!("streaming loki acquisition interrupted by shutdown");
            return Ok(());
        }
        outcome.context("loki tail stream failed")?;
        Ok(())
    }
}

/// Publishes every entry of one stream. Returns false when the shutdown
/// token fired or the consumer dropped the channel.
async fn publish_entries(
    out: &mpsc::Sender<Event>,
    shutdown: &CancellationToken,
    config: &ResolvedConfig,
    source: &str,
    stream: &LogStream,
) -> bool {
    for entry in &stream.entries {
        let event = Event::log(
            entry.line.clone(),
            entry.datetime(),
            source.to_string(),
            config.labels.clone(),
        );
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            sent = out.send(event) => {
                if sent.is_err() {
                    warn!("event consumer dropped the output channel");
                    return false;
                }
                metrics::record_hit(source);
            }
        }
    }
    true
}
