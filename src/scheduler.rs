//! Inbound dispatch and background timers.
//! One consumer drains the bounded inbound queue and runs each message's
//! pipeline as its own task, so slow translations do not hold up other
//! messages. Timers (cache sweep, credential watch, metrics flush, reconnect on
//! a new token) are independent tasks that stop on the shared shutdown token.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::credentials::CredentialManager;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::pipeline::{MessagePipeline, PipelineOutcome};
use crate::translate::cache::TranslationCache;
use crate::transport::{ChatMessage, ChatTransport};

pub const INBOUND_QUEUE_CAPACITY: usize = 256;

pub struct Scheduler {
    pipeline: Arc<MessagePipeline>,
    transport: Arc<dyn ChatTransport>,
    metrics: Arc<MetricsRegistry>,

    inbound_tx: mpsc::Sender<ChatMessage>,
    // Mutex for interior mutability (Scheduler behind Arc)
    inbound_rx: Mutex<Option<mpsc::Receiver<ChatMessage>>>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<MessagePipeline>,
        transport: Arc<dyn ChatTransport>,
        metrics: Arc<MetricsRegistry>,
        queue_capacity: usize,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            pipeline,
            transport,
            metrics,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Sender handed to the transport on every (re)connect.
    pub fn inbound_sender(&self) -> mpsc::Sender<ChatMessage> {
        self.inbound_tx.clone()
    }

    /// Consume inbound messages until `shutdown` fires, then wait for the
    /// in-flight ones. Can only run once.
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(mut rx) = self.inbound_rx.lock().take() else {
            warn!("scheduler receiver already taken");
            return;
        };
        info!("scheduler started");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.spawn_message(&mut tasks, msg),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!("scheduler stopped");
    }

    fn spawn_message(&self, tasks: &mut JoinSet<()>, msg: ChatMessage) {
        let pipeline = Arc::clone(&self.pipeline);
        let transport = Arc::clone(&self.transport);
        let metrics = Arc::clone(&self.metrics);
        let span = info_span!(
            "message",
            message_id = %Uuid::new_v4(),
            channel = %msg.channel,
            user = %msg.username,
        );

        tasks.spawn(
            async move {
                let PipelineOutcome::Reply(lines) = pipeline.handle(&msg).await else {
                    return;
                };
                for line in lines {
                    match transport.say(&msg.channel, &line).await {
                        Ok(()) => metrics.increment(metric_names::REPLIES_SENT),
                        Err(e) => warn!(error = %e, "reply not delivered"),
                    }
                }
            }
            .instrument(span),
        );
    }
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "message task panicked"),
        Err(e) => debug!(error = %e, "message task cancelled"),
    }
}

fn ticker(every: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Periodically drop expired cache entries.
pub fn spawn_cache_sweeper(
    cache: Arc<TranslationCache>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = cache.sweep_expired();
                    if removed > 0 {
                        debug!(removed, remaining = cache.len(), "cache sweep");
                    }
                }
            }
        }
    })
}

/// Check the credential on every tick and refresh it once it is due.
pub fn spawn_credential_watch(
    credentials: Arc<CredentialManager>,
    metrics: Arc<MetricsRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !credentials.can_refresh() {
            warn!("no refresh token configured, the access token will not be renewed");
            return;
        }
        let mut interval = ticker(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !credentials.needs_refresh() {
                continue;
            }
            info!(expires_at = ?credentials.expires_at(), "access token due for refresh");
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = credentials.refresh() => result,
            };
            match result {
                Ok(_) => metrics.increment(metric_names::TOKEN_REFRESH_OK),
                Err(e) => {
                    metrics.increment(metric_names::TOKEN_REFRESH_FAILED);
                    warn!(
                        error = %e,
                        consecutive_failures = credentials.consecutive_failures(),
                        "scheduled token refresh failed"
                    );
                }
            }
        }
    })
}

pub fn spawn_metrics_flush(
    metrics: Arc<MetricsRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(every);
        // The first tick fires immediately and there is nothing to report yet.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => metrics.flush(),
            }
        }
        metrics.flush();
    })
}

/// Reconnect the transport whenever the credential manager issues a new
/// access token. The transport only reads credentials at connect time.
pub fn spawn_reconnector(
    credentials: &CredentialManager,
    transport: Arc<dyn ChatTransport>,
    inbound: mpsc::Sender<ChatMessage>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut tokens = credentials.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = tokens.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let token = tokens.borrow_and_update().clone();
            info!("new access token issued, reconnecting transport");
            if let Err(e) = transport.disconnect().await {
                warn!(error = %e, "disconnect before reconnect failed");
            }
            if let Err(e) = transport.connect(&token, inbound.clone()).await {
                error!(error = %e, "reconnect with refreshed token failed");
            }
        }
    })
}
