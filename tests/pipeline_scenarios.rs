use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lingobot::channel_config::ConfigStore;
use lingobot::credentials::endpoint::{TokenEndpoint, TokenExchangeError, TokenGrant};
use lingobot::credentials::{ClientSecrets, CredentialManager, CredentialState, RefreshPolicy};
use lingobot::ignore_list::IgnoreList;
use lingobot::metrics::{metric_names, MetricsRegistry};
use lingobot::pipeline::{
    DropReason, MessagePipeline, PipelineOutcome, PipelineServices, PipelineSettings,
};
use lingobot::rate_limit::RateLimiter;
use lingobot::scheduler::Scheduler;
use lingobot::storage::{MemoryRepository, Repository};
use lingobot::translate::cache::TranslationCache;
use lingobot::translate::moderation::ModerationFilter;
use lingobot::translate::normalize::{Detection, LanguageDetector};
use lingobot::translate::{TranslateError, TranslationService, Translator};
use lingobot::transport::{ChatMessage, ChatTransport, TransportError};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Known phrases translate to fixed English; anything containing "ÉCHEC" fails.
#[derive(Default)]
struct FakeTranslator {
    calls: AtomicUsize,
}

impl FakeTranslator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: Option<&str>,
        _target_lang: &str,
    ) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("ÉCHEC") {
            return Err(TranslateError::ApiError("backend down".into()));
        }
        Ok(match text {
            "Bonjour tout le monde" => "Hello everyone".to_string(),
            other => format!("EN({other})"),
        })
    }
}

/// Detects French with high confidence unless told otherwise for a given text.
#[derive(Default)]
struct TableDetector {
    table: Mutex<HashMap<String, Vec<Detection>>>,
}

impl TableDetector {
    fn set(&self, text: &str, detections: Vec<(&str, f64)>) {
        self.table.lock().insert(
            text.to_string(),
            detections
                .into_iter()
                .map(|(lang, confidence)| Detection {
                    lang: lang.to_string(),
                    confidence,
                })
                .collect(),
        );
    }
}

impl LanguageDetector for TableDetector {
    fn detect(&self, text: &str) -> Vec<Detection> {
        self.table.lock().get(text).cloned().unwrap_or_else(|| {
            vec![Detection {
                lang: "fr".into(),
                confidence: 0.95,
            }]
        })
    }
}

struct FakeEndpoint;

#[async_trait]
impl TokenEndpoint for FakeEndpoint {
    async fn refresh(
        &self,
        _refresh_token: &str,
        _client_id: &str,
        _client_secret: &str,
    ) -> Result<TokenGrant, TokenExchangeError> {
        Ok(TokenGrant {
            access_token: "fresh-token".into(),
            refresh_token: Some("fresh-refresh".into()),
            expires_in: 14_400,
        })
    }
}

#[derive(Default)]
struct RecordingTransport {
    said: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn connect(
        &self,
        _access_token: &str,
        _inbound: mpsc::Sender<ChatMessage>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn say(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        self.said.lock().push((channel.to_string(), text.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Options {
    global_limit: usize,
    channel_limit: usize,
    bot_owner: Option<&'static str>,
    blocked: Vec<&'static str>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            global_limit: 20,
            channel_limit: 10,
            bot_owner: None,
            blocked: Vec::new(),
        }
    }
}

struct Harness {
    pipeline: MessagePipeline,
    translator: Arc<FakeTranslator>,
    detector: Arc<TableDetector>,
    cache: Arc<TranslationCache>,
    config: Arc<ConfigStore>,
    ignore_list: Arc<IgnoreList>,
    credentials: Arc<CredentialManager>,
    metrics: Arc<MetricsRegistry>,
}

fn harness() -> Harness {
    harness_with(Options::default())
}

fn harness_with(opts: Options) -> Harness {
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let cache = Arc::new(TranslationCache::new(64, Duration::from_secs(600)));
    let translator = Arc::new(FakeTranslator::default());
    let detector = Arc::new(TableDetector::default());
    let config = Arc::new(ConfigStore::new(Arc::clone(&repo)));
    let ignore_list = Arc::new(IgnoreList::open(Arc::clone(&repo)).expect("ignore list"));

    let translation = Arc::new(TranslationService::new(
        translator.clone(),
        Arc::clone(&cache),
        Arc::clone(&metrics),
        "en",
        Duration::from_secs(5),
    ));
    let credentials = Arc::new(
        CredentialManager::open(
            Arc::clone(&repo),
            Arc::new(FakeEndpoint),
            ClientSecrets {
                client_id: "cid".into(),
                client_secret: "secret".into(),
            },
            RefreshPolicy::default(),
            Some(CredentialState::bootstrap("boot-token", Some("boot-refresh".into()))),
        )
        .expect("credentials"),
    );
    let moderation = ModerationFilter::from_patterns(&opts.blocked).expect("patterns");

    let pipeline = MessagePipeline::new(
        PipelineServices {
            config: Arc::clone(&config),
            ignore_list: Arc::clone(&ignore_list),
            rate_limiter: Arc::new(RateLimiter::new(opts.global_limit, opts.channel_limit)),
            translation,
            credentials: Arc::clone(&credentials),
            detector: detector.clone(),
            moderation: Arc::new(moderation),
            metrics: Arc::clone(&metrics),
        },
        PipelineSettings {
            bot_owner: opts.bot_owner.map(str::to_string),
            ..PipelineSettings::default()
        },
    )
    .expect("pipeline");

    Harness {
        pipeline,
        translator,
        detector,
        cache,
        config,
        ignore_list,
        credentials,
        metrics,
    }
}

fn says(channel: &str, user: &str, text: &str) -> ChatMessage {
    ChatMessage {
        channel: channel.into(),
        username: user.into(),
        text: text.into(),
        is_moderator: false,
    }
}

fn mod_says(channel: &str, user: &str, text: &str) -> ChatMessage {
    ChatMessage {
        is_moderator: true,
        ..says(channel, user, text)
    }
}

async fn as_moderator(h: &Harness, text: &str) -> PipelineOutcome {
    h.pipeline.handle(&mod_says("#lobby", "helper", text)).await
}

fn reply(lines: &[&str]) -> PipelineOutcome {
    PipelineOutcome::Reply(lines.iter().map(|l| l.to_string()).collect())
}

fn single_line(outcome: PipelineOutcome) -> String {
    match outcome {
        PipelineOutcome::Reply(mut lines) if lines.len() == 1 => lines.remove(0),
        other => panic!("expected a single reply line, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn french_message_is_translated_and_cached() {
    let h = harness();
    let outcome = h
        .pipeline
        .handle(&says("#lobby", "Alice", "Bonjour tout le monde"))
        .await;

    assert_eq!(outcome, reply(&["[Alice, fr→en]: Hello everyone"]));
    assert_eq!(
        h.cache.get("Bonjour tout le monde", "fr", "en").as_deref(),
        Some("Hello everyone")
    );
    assert_eq!(h.translator.calls(), 1);
}

#[tokio::test]
async fn repeated_message_is_served_from_cache() {
    let h = harness();
    let msg = says("#lobby", "alice", "Bonjour tout le monde");
    let first = h.pipeline.handle(&msg).await;
    let second = h.pipeline.handle(&msg).await;

    assert_eq!(first, second);
    assert_eq!(h.translator.calls(), 1);
    assert_eq!(h.metrics.counter(metric_names::CACHE_HIT), 1);
    assert_eq!(h.metrics.counter(metric_names::CACHE_MISS), 1);
}

#[tokio::test]
async fn changed_prefix_takes_effect_immediately() {
    let h = harness();
    let changed = h
        .pipeline
        .handle(&mod_says("#lobby", "helper", "!config prefix ?"))
        .await;
    assert_eq!(changed, reply(&["@helper, prefix set to ?"]));
    assert_eq!(h.config.get("lobby").prefix, "?");

    // The old prefix is ordinary chat now; nothing recognizable to translate.
    h.detector.set("!help", vec![]);
    let old = h.pipeline.handle(&says("#lobby", "viewer", "!help")).await;
    assert_eq!(old, PipelineOutcome::Dropped(DropReason::NoLanguage));

    let new = single_line(h.pipeline.handle(&says("#lobby", "viewer", "?help")).await);
    assert!(new.starts_with("@viewer, commands: ?translate"), "{new}");
}

#[tokio::test]
async fn global_limit_drops_the_twenty_first_message() {
    let h = harness_with(Options {
        global_limit: 20,
        channel_limit: 10,
        ..Options::default()
    });
    let channels = ["#one", "#two", "#three"];

    for i in 0..20 {
        let msg = says(channels[i % 3], "chatter", &format!("Bonjour numéro {i}"));
        assert!(
            matches!(h.pipeline.handle(&msg).await, PipelineOutcome::Reply(_)),
            "message {i} should be translated"
        );
    }
    let last = h
        .pipeline
        .handle(&says("#three", "chatter", "Bonjour numéro 20"))
        .await;
    assert_eq!(last, PipelineOutcome::Dropped(DropReason::RateLimited));
    assert_eq!(h.translator.calls(), 20);
    assert_eq!(h.metrics.counter("dropped.rate_limited"), 1);
}

#[tokio::test]
async fn channel_limit_applies_per_channel() {
    let h = harness_with(Options {
        global_limit: 100,
        channel_limit: 2,
        ..Options::default()
    });
    for i in 0..2 {
        let msg = says("#busy", "chatter", &format!("Salut encore {i}"));
        assert!(matches!(h.pipeline.handle(&msg).await, PipelineOutcome::Reply(_)));
    }
    let third = h.pipeline.handle(&says("#busy", "chatter", "Salut encore 2")).await;
    assert_eq!(third, PipelineOutcome::Dropped(DropReason::RateLimited));

    let elsewhere = h.pipeline.handle(&says("#quiet", "chatter", "Salut encore 3")).await;
    assert!(matches!(elsewhere, PipelineOutcome::Reply(_)));
}

// ---------------------------------------------------------------------------
// Translate path gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_drops_empty_and_oversized_messages() {
    let h = harness();
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "   ")).await,
        PipelineOutcome::Dropped(DropReason::Empty)
    );
    let long = "mot ".repeat(200);
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", &long)).await,
        PipelineOutcome::Dropped(DropReason::TooLong)
    );
}

#[tokio::test]
async fn short_and_emote_only_messages_are_too_short() {
    let h = harness();
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "lol")).await,
        PipelineOutcome::Dropped(DropReason::TooShort)
    );
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "[Kappa] [PogChamp]")).await,
        PipelineOutcome::Dropped(DropReason::TooShort)
    );
    assert_eq!(h.translator.calls(), 0);
}

#[tokio::test]
async fn excluded_and_ignored_users_are_skipped() {
    let h = harness();
    h.config.exclude_user("lobby", "Quiet").expect("exclude");
    h.ignore_list.add("spammer").expect("ignore");

    assert_eq!(
        h.pipeline.handle(&says("#lobby", "quiet", "Bonjour tout le monde")).await,
        PipelineOutcome::Dropped(DropReason::ExcludedUser)
    );
    assert_eq!(
        h.pipeline.handle(&says("#other", "SPAMMER", "Bonjour tout le monde")).await,
        PipelineOutcome::Dropped(DropReason::IgnoredUser)
    );
}

#[tokio::test]
async fn disabled_auto_translate_drops_chat_but_keeps_commands() {
    let h = harness();
    h.pipeline
        .handle(&mod_says("#lobby", "helper", "!config autoTranslate off"))
        .await;

    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "Bonjour tout le monde")).await,
        PipelineOutcome::Dropped(DropReason::AutoTranslateDisabled)
    );
    let help = h.pipeline.handle(&says("#lobby", "a", "!help")).await;
    assert!(matches!(help, PipelineOutcome::Reply(_)));
}

#[tokio::test]
async fn moderated_text_is_never_translated() {
    let h = harness_with(Options {
        blocked: vec![r"\bvilain\b"],
        ..Options::default()
    });
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "tu es VILAIN ce soir")).await,
        PipelineOutcome::Dropped(DropReason::Moderated)
    );
    assert_eq!(h.translator.calls(), 0);
}

#[tokio::test]
async fn detection_gates_drop_in_order() {
    let h = harness();
    h.detector.set("Hello there friends", vec![("en", 0.99)]);
    h.detector.set("hmm bof bof", vec![("fr", 0.2)]);
    h.detector.set("zzzz zzzz", vec![]);

    let cases = [
        ("Hello there friends", DropReason::AlreadyTarget),
        ("hmm bof bof", DropReason::LowConfidence),
        ("zzzz zzzz", DropReason::NoLanguage),
    ];
    for (text, reason) in cases {
        assert_eq!(
            h.pipeline.handle(&says("#lobby", "a", text)).await,
            PipelineOutcome::Dropped(reason),
            "{text}"
        );
    }
    assert_eq!(h.translator.calls(), 0);
}

#[tokio::test]
async fn language_filter_limits_source_languages() {
    let h = harness();
    h.pipeline
        .handle(&mod_says("#lobby", "helper", "!config languageFilter de, es"))
        .await;
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "Bonjour tout le monde")).await,
        PipelineOutcome::Dropped(DropReason::LanguageFiltered)
    );

    h.detector.set("Hallo zusammen", vec![("de", 0.9)]);
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "Hallo zusammen")).await,
        reply(&["[a, de→en]: EN(Hallo zusammen)"])
    );
}

#[tokio::test]
async fn failed_translation_is_dropped_and_not_cached() {
    let h = harness();
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "a", "ÉCHEC total ici")).await,
        PipelineOutcome::Dropped(DropReason::TranslationFailed)
    );
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn emotes_are_kept_in_place_around_the_translation() {
    let h = harness();
    let outcome = h
        .pipeline
        .handle(&says("#lobby", "a", "Bonjour [Kappa] tout le monde"))
        .await;
    assert_eq!(outcome, reply(&["[a, fr→en]: Hello [Kappa] everyone"]));
    // Emotes never reach the translator or the cache key.
    assert!(h.cache.get("Bonjour tout le monde", "fr", "en").is_some());
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn translate_command_shares_the_cache_with_auto_translation() {
    let h = harness();
    let line = single_line(
        h.pipeline
            .handle(&says("#lobby", "bob", "!translate FR Bonjour tout le monde"))
            .await,
    );
    assert_eq!(line, "[bob, fr→en]: Hello everyone");

    h.pipeline
        .handle(&says("#lobby", "carol", "Bonjour tout le monde"))
        .await;
    assert_eq!(h.translator.calls(), 1);
}

#[tokio::test]
async fn translate_command_always_answers() {
    let h = harness();
    let usage = single_line(h.pipeline.handle(&says("#lobby", "bob", "!translate de")).await);
    assert_eq!(usage, "@bob, usage: !translate <lang> <text>");

    let failed = single_line(
        h.pipeline
            .handle(&says("#lobby", "bob", "!translate fr ÉCHEC"))
            .await,
    );
    assert_eq!(failed, "@bob, translation failed: API error: backend down");
}

#[tokio::test]
async fn config_reads_writes_and_rejects_unknown_keys() {
    let h = harness();
    let current = single_line(
        h.pipeline
            .handle(&mod_says("#lobby", "helper", "!config AUTOTRANSLATE"))
            .await,
    );
    assert_eq!(current, "@helper, autoTranslate is true");

    let unknown = single_line(
        h.pipeline
            .handle(&mod_says("#lobby", "helper", "!config colour blue"))
            .await,
    );
    assert_eq!(
        unknown,
        "@helper, unknown config key 'colour'. Valid keys: autoTranslate, respondToCommands, \
         moderatorOnly, prefix, languageFilter"
    );

    let usage = single_line(h.pipeline.handle(&mod_says("#lobby", "helper", "!config")).await);
    assert!(usage.starts_with("@helper, usage: !config <key> [value]"), "{usage}");
}

#[tokio::test]
async fn config_requires_moderator_or_channel_owner() {
    let h = harness();
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "viewer", "!config prefix ?")).await,
        PipelineOutcome::Dropped(DropReason::Unauthorized)
    );
    assert_eq!(h.config.get("lobby").prefix, "!");

    let owner = h.pipeline.handle(&says("#lobby", "Lobby", "!config prefix ~")).await;
    assert_eq!(owner, reply(&["@Lobby, prefix set to ~"]));
}

#[tokio::test]
async fn moderator_only_channels_ignore_viewer_commands() {
    let h = harness();
    h.pipeline
        .handle(&mod_says("#lobby", "helper", "!config moderatorOnly on"))
        .await;

    assert_eq!(
        h.pipeline.handle(&says("#lobby", "viewer", "!help")).await,
        PipelineOutcome::Dropped(DropReason::Unauthorized)
    );
    let moderator = h.pipeline.handle(&mod_says("#lobby", "helper", "!help")).await;
    assert!(matches!(moderator, PipelineOutcome::Reply(_)));
}

#[tokio::test]
async fn disabled_commands_and_unknown_commands_are_silent() {
    let h = harness();
    assert_eq!(
        h.pipeline.handle(&says("#lobby", "viewer", "!dance now")).await,
        PipelineOutcome::Dropped(DropReason::UnknownCommand)
    );

    h.pipeline
        .handle(&mod_says("#lobby", "helper", "!config respondToCommands false"))
        .await;
    assert_eq!(
        h.pipeline.handle(&mod_says("#lobby", "helper", "!help")).await,
        PipelineOutcome::Dropped(DropReason::CommandsDisabled)
    );
}

#[tokio::test]
async fn exclude_and_include_report_whether_anything_changed() {
    let h = harness();

    assert_eq!(
        as_moderator(&h, "!exclude @Quiet").await,
        reply(&["@helper, quiet will no longer be translated here."])
    );
    assert_eq!(
        as_moderator(&h, "!exclude quiet").await,
        reply(&["@helper, quiet is already excluded."])
    );
    assert_eq!(
        as_moderator(&h, "!include quiet").await,
        reply(&["@helper, quiet will be translated again."])
    );
    assert_eq!(
        as_moderator(&h, "!include quiet").await,
        reply(&["@helper, quiet is not excluded."])
    );
}

#[tokio::test]
async fn global_ignore_is_owner_only_and_paginated() {
    let h = harness();
    assert_eq!(
        h.pipeline
            .handle(&mod_says("#lobby", "helper", "!globalignore add troll"))
            .await,
        PipelineOutcome::Dropped(DropReason::Unauthorized)
    );

    for i in 0..12 {
        let text = format!("!globalignore add user{i:02}");
        h.pipeline.handle(&says("#lobby", "lobby", &text)).await;
    }
    let listed = h
        .pipeline
        .handle(&says("#lobby", "lobby", "!globalignore list"))
        .await;
    let PipelineOutcome::Reply(lines) = listed else {
        panic!("expected list reply");
    };
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("Ignored users (1/2): user00, user01"));
    assert_eq!(lines[1], "Ignored users (2/2): user10, user11");

    let removed = h
        .pipeline
        .handle(&says("#lobby", "lobby", "!globalignore remove USER00"))
        .await;
    assert_eq!(removed, reply(&["@lobby, user00 is no longer ignored."]));
    assert!(!h.ignore_list.contains("user00"));
}

#[tokio::test]
async fn configured_bot_owner_replaces_channel_owners_for_global_ignore() {
    let h = harness_with(Options {
        bot_owner: Some("admin"),
        ..Options::default()
    });
    assert_eq!(
        h.pipeline
            .handle(&says("#lobby", "lobby", "!globalignore add troll"))
            .await,
        PipelineOutcome::Dropped(DropReason::Unauthorized)
    );
    let admin = h
        .pipeline
        .handle(&says("#lobby", "Admin", "!globalignore add troll"))
        .await;
    assert_eq!(admin, reply(&["@Admin, troll is now ignored in every channel."]));
}

#[tokio::test]
async fn help_lists_owner_commands_only_for_the_owner() {
    let h = harness();
    let viewer = single_line(h.pipeline.handle(&says("#lobby", "viewer", "!help")).await);
    assert_eq!(viewer, "@viewer, commands: !translate, !help");

    let owner = single_line(h.pipeline.handle(&says("#lobby", "lobby", "!help")).await);
    assert!(owner.contains("!globalignore"), "{owner}");
    assert!(owner.contains("!refreshtoken"), "{owner}");
}

#[tokio::test]
async fn refreshtoken_rotates_the_credential_for_the_channel_owner() {
    let h = harness();
    assert_eq!(
        h.pipeline
            .handle(&mod_says("#lobby", "helper", "!refreshtoken"))
            .await,
        PipelineOutcome::Dropped(DropReason::Unauthorized)
    );

    let mut tokens = h.credentials.subscribe();
    let done = h.pipeline.handle(&says("#lobby", "lobby", "!refreshtoken")).await;
    assert_eq!(done, reply(&["@lobby, access token refreshed, reconnecting."]));
    assert_eq!(h.credentials.access_token(), "fresh-token");
    assert!(tokens.has_changed().expect("sender alive"));
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduler_delivers_replies_to_the_transport() {
    let h = harness();
    let transport = Arc::new(RecordingTransport::default());
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(h.pipeline),
        transport.clone(),
        Arc::clone(&h.metrics),
        16,
    ));
    let inbound = scheduler.inbound_sender();
    let shutdown = CancellationToken::new();
    let running = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    inbound
        .send(says("#lobby", "alice", "Bonjour tout le monde"))
        .await
        .expect("queue open");
    inbound
        .send(says("#lobby", "alice", "lol"))
        .await
        .expect("queue open");

    for _ in 0..100 {
        if !transport.said.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    running.await.expect("scheduler exits");

    assert_eq!(
        *transport.said.lock(),
        vec![("#lobby".to_string(), "[alice, fr→en]: Hello everyone".to_string())]
    );
    assert_eq!(h.metrics.counter(metric_names::REPLIES_SENT), 1);
    assert_eq!(h.metrics.counter(metric_names::MESSAGES_RECEIVED), 2);
}
