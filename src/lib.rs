//! lingobot: chat translation bot core.
//! Per-channel settings, rate limiting, a translation memo cache and a
//! self-refreshing chat credential, wired around one message pipeline.

pub mod channel_config;
pub mod credentials;
pub mod ignore_list;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod scheduler;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod translate;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use channel_config::ConfigStore;
use credentials::endpoint::{TokenExchangeError, TwitchTokenEndpoint};
use credentials::{ClientSecrets, CredentialError, CredentialManager, CredentialState, RefreshPolicy};
use ignore_list::IgnoreList;
use metrics::MetricsRegistry;
use pipeline::{MessagePipeline, PipelineServices, PipelineSettings};
use rate_limit::RateLimiter;
use scheduler::Scheduler;
use settings::{Settings, SettingsError};
use storage::{JsonFileRepository, Repository, StoreError};
use translate::cache::TranslationCache;
use translate::deepseek::DeepSeekTranslator;
use translate::moderation::{ModerationError, ModerationFilter};
use translate::normalize::WhatlangDetector;
use translate::{TranslateError, TranslationService};
use transport::{ChatTransport, ConsoleTransport, TransportError};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CREDENTIAL_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Anything that stops the process before or while connecting.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("configuration: {0}")]
    Settings(#[from] SettingsError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("credential: {0}")]
    Credential(#[from] CredentialError),
    #[error("moderation patterns: {0}")]
    Moderation(#[from] ModerationError),
    #[error("translator: {0}")]
    Translator(#[from] TranslateError),
    #[error("token endpoint: {0}")]
    TokenEndpoint(#[from] TokenExchangeError),
    #[error("text sanitizer: {0}")]
    Sanitizer(#[from] regex::Error),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// `RUST_LOG` filter (default `lingobot=debug`); `LINGOBOT_LOG_JSON=1` for JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lingobot=debug"));
    let json = std::env::var("LINGOBOT_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the bot on the console transport until stdin closes or Ctrl-C.
pub async fn run() -> Result<(), BootError> {
    init_tracing();
    info!("lingobot starting");

    let settings = Settings::from_env()?;
    info!(
        channels = ?settings.channels,
        target_lang = %settings.target_lang,
        storage_dir = %settings.storage_dir().display(),
        "settings loaded"
    );

    let repo: Arc<dyn Repository> = Arc::new(JsonFileRepository::new(settings.storage_dir()));
    let metrics = Arc::new(MetricsRegistry::new());

    let config = Arc::new(ConfigStore::new(Arc::clone(&repo)));
    config.preload(settings.channels.iter().map(String::as_str));
    let ignore_list = Arc::new(IgnoreList::open(Arc::clone(&repo))?);

    let moderation = match ModerationFilter::load_from_file(&settings.moderation_patterns) {
        Ok(filter) => {
            info!(patterns = filter.len(), version = filter.version(), "moderation patterns loaded");
            filter
        }
        Err(ModerationError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                path = %settings.moderation_patterns.display(),
                "moderation pattern file missing, nothing will be screened"
            );
            ModerationFilter::empty()
        }
        Err(e) => return Err(e.into()),
    };

    let cache = Arc::new(TranslationCache::new(settings.cache_capacity, settings.cache_ttl));
    let translation = Arc::new(TranslationService::new(
        Arc::new(DeepSeekTranslator::new(settings.deepseek_api_key.clone())?),
        Arc::clone(&cache),
        Arc::clone(&metrics),
        settings.target_lang.clone(),
        settings.translate_timeout,
    ));

    let bootstrap = settings
        .access_token
        .clone()
        .map(|token| CredentialState::bootstrap(token, settings.refresh_token.clone()));
    let credentials = Arc::new(CredentialManager::open(
        Arc::clone(&repo),
        Arc::new(TwitchTokenEndpoint::new()?),
        ClientSecrets {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
        },
        RefreshPolicy {
            margin: settings.refresh_margin,
            ..RefreshPolicy::default()
        },
        bootstrap,
    )?);

    let pipeline = Arc::new(MessagePipeline::new(
        PipelineServices {
            config,
            ignore_list,
            rate_limiter: Arc::new(RateLimiter::new(
                settings.global_rate_limit,
                settings.channel_rate_limit,
            )),
            translation,
            credentials: Arc::clone(&credentials),
            detector: Arc::new(WhatlangDetector),
            moderation: Arc::new(moderation),
            metrics: Arc::clone(&metrics),
        },
        PipelineSettings {
            min_message_length: settings.min_message_length,
            max_message_length: settings.max_message_length,
            min_confidence: settings.min_confidence,
            bot_owner: settings.bot_owner.clone(),
        },
    )?);

    let shutdown = CancellationToken::new();
    let transport: Arc<dyn ChatTransport> = Arc::new(ConsoleTransport::new(shutdown.clone()));
    let scheduler = Scheduler::new(
        pipeline,
        Arc::clone(&transport),
        Arc::clone(&metrics),
        scheduler::INBOUND_QUEUE_CAPACITY,
    );

    // Subscribe before connecting so a refresh during startup is not missed.
    let reconnector = scheduler::spawn_reconnector(
        &credentials,
        Arc::clone(&transport),
        scheduler.inbound_sender(),
        shutdown.clone(),
    );
    transport
        .connect(&credentials.access_token(), scheduler.inbound_sender())
        .await?;
    info!(channels = settings.channels.len(), "connected");

    let timers = [
        scheduler::spawn_cache_sweeper(Arc::clone(&cache), CACHE_SWEEP_INTERVAL, shutdown.clone()),
        scheduler::spawn_credential_watch(
            Arc::clone(&credentials),
            Arc::clone(&metrics),
            CREDENTIAL_CHECK_INTERVAL,
            shutdown.clone(),
        ),
        scheduler::spawn_metrics_flush(Arc::clone(&metrics), METRICS_FLUSH_INTERVAL, shutdown.clone()),
        reconnector,
    ];

    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        })
    };

    scheduler.run(shutdown.clone()).await;

    shutdown.cancel();
    ctrl_c.abort();
    for timer in timers {
        if let Err(e) = timer.await {
            error!(error = %e, "background task failed");
        }
    }
    if let Err(e) = transport.disconnect().await {
        warn!(error = %e, "disconnect failed");
    }
    info!("lingobot stopped");
    Ok(())
}
