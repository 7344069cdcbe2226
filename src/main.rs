use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use leadline::api::{self, AppState};
use leadline::automation::spawn_scheduler;
use leadline::channels::{
    ChannelRegistry, EmailConfig, EmailSender, MetaConfig, MetaGraphChannel, TelegramChannel,
    WebChatHub,
};
use leadline::config::{PipelineConfig, ServerConfig, WebhookSecrets};
use leadline::identity::model::Channel;
use leadline::llm::{DraftGenerator, LlmConfig, TemplateDraftGenerator, create_drafter};
use leadline::reply::FlowCatalog;
use leadline::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let server = ServerConfig::from_env()?;
    let _log_guard = init_tracing(server.log_dir.as_deref());

    let pipeline = PipelineConfig::from_env()?;
    let secrets = WebhookSecrets::from_env();

    eprintln!("📨 Leadline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhooks: http://0.0.0.0:{}/webhooks/{{channel}}", server.port);
    eprintln!("   Operator API: http://0.0.0.0:{}/api", server.port);
    eprintln!("   Web chat: ws://0.0.0.0:{}/ws/webchat", server.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", server.db_path.display()))?,
    );
    eprintln!("   Database: {}", server.db_path.display());

    // ── Channels ─────────────────────────────────────────────────────────
    let webchat = WebChatHub::new();
    let channels = build_channels(&webchat)?;
    let active: Vec<&str> = channels
        .configured_senders()
        .iter()
        .map(|c| c.as_str())
        .collect();
    eprintln!("   Channels: {}", active.join(", "));

    // ── Drafting ─────────────────────────────────────────────────────────
    let drafter: Arc<dyn DraftGenerator> = match LlmConfig::from_env() {
        Some(config) => {
            let drafter = create_drafter(&config)?;
            eprintln!("   Drafts: {}", drafter.model_name());
            drafter
        }
        None => {
            eprintln!("   Drafts: templates only (no API key)");
            Arc::new(TemplateDraftGenerator)
        }
    };

    let flows = FlowCatalog::load(pipeline.flows_path.as_deref())?;

    let state = AppState::assemble(
        db,
        channels,
        drafter,
        flows,
        &pipeline,
        secrets,
    );

    // ── Scheduler ────────────────────────────────────────────────────────
    let _scheduler = spawn_scheduler(state.automation.clone(), pipeline.scheduler_interval);
    eprintln!(
        "   Scheduler: every {}s\n",
        pipeline.scheduler_interval.as_secs()
    );

    let app = api::router(state, &webchat);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, "HTTP server started");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Console logging always; a daily rolling file when a log dir is configured.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "leadline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

/// Register every adapter whose environment is configured.
fn build_channels(webchat: &WebChatHub) -> anyhow::Result<ChannelRegistry> {
    let mut channels =
        ChannelRegistry::new().with_sender(Channel::WebChat, Arc::new(webchat.clone()));

    if let Some(telegram) = TelegramChannel::from_env() {
        let telegram = Arc::new(telegram);
        channels = channels
            .with_sender(Channel::Telegram, telegram.clone())
            .with_fetcher(Channel::Telegram, telegram);
    }

    if let Some(meta) = MetaConfig::from_env() {
        if meta.phone_number_id.is_some() {
            let chat = Arc::new(MetaGraphChannel::new(meta.clone(), Channel::Chat)?);
            channels = channels
                .with_sender(Channel::Chat, chat.clone())
                .with_fetcher(Channel::Chat, chat);
        }
        let social = Arc::new(MetaGraphChannel::new(meta, Channel::Social)?);
        channels = channels
            .with_sender(Channel::Social, social.clone())
            .with_fetcher(Channel::Social, social);
    }

    if let Some(email) = EmailConfig::from_env() {
        channels = channels.with_sender(Channel::Email, Arc::new(EmailSender::new(email)));
    }

    Ok(channels)
}
