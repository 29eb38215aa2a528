use std::sync::Arc;

use futures::StreamExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use learn_earn::api::{ApiState, api_routes};
use learn_earn::channels::{ChannelManager, CliChannel, TelegramChannel};
use learn_earn::config::AppConfig;
use learn_earn::conversation::{ConversationEngine, EngineResponder, SessionDispatcher};
use learn_earn::kyc::ApprovalCoordinator;
use learn_earn::ledger::{
    AccountKeys, CustodialKeyStore, HttpLedgerClient, LedgerClient, SettingsKeyStore,
    ensure_custodial_account,
};
use learn_earn::notify::{NotificationRetrier, Notifier};
use learn_earn::quiz::{RewardWorkflow, load_quiz_file};
use learn_earn::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    // ── Logging ─────────────────────────────────────────────────────────
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "learn-earn.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("🎓 Learn & Earn v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Ledger: {}", config.ledger.base_url);
    eprintln!("   API: http://0.0.0.0:{}/api/v1/users", config.api_port);

    // ── Database ────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    eprintln!("   Database: {}", config.db_path.display());

    if let Some(path) = &config.quiz_file {
        let quizzes = load_quiz_file(path)?;
        for quiz in &quizzes {
            db.upsert_quiz(quiz).await?;
        }
        eprintln!("   Quizzes: {} loaded from {}", quizzes.len(), path.display());
    }

    // ── Ledger ──────────────────────────────────────────────────────────
    let ledger: Arc<dyn LedgerClient> = Arc::new(HttpLedgerClient::new(
        &config.ledger.base_url,
        config.ledger.timeout,
    )?);

    let custody = Arc::new(SettingsKeyStore::new(Arc::clone(&db)));
    if let Some(seed) = &config.custodial_seed {
        custody
            .save(&AccountKeys {
                address: seed.address.clone(),
                signing_key: seed.signing_key.clone(),
            })
            .await?;
    }
    match ensure_custodial_account(custody.as_ref(), ledger.as_ref()).await {
        Ok(keys) => eprintln!("   Reward wallet: {}", keys.address),
        Err(e) => {
            tracing::warn!("No custodial reward account yet, rewards will fail until one exists: {e}");
        }
    }

    // ── Channels & notifications ────────────────────────────────────────
    let mut channels = ChannelManager::new();
    let notifier: Arc<dyn Notifier> = match &config.telegram {
        Some(telegram) => {
            let channel =
                TelegramChannel::new(telegram.bot_token.clone(), telegram.allowed_users.clone());
            eprintln!(
                "   Telegram: enabled (allowed: {})",
                if telegram.allowed_users.iter().any(|u| u == "*") {
                    "everyone".to_string()
                } else {
                    telegram.allowed_users.join(", ")
                }
            );
            channels.add(Box::new(channel.clone()));
            Arc::new(channel)
        }
        None => {
            eprintln!("   Telegram: disabled, using the terminal");
            channels.add(Box::new(CliChannel::new()));
            Arc::new(CliChannel::new())
        }
    };
    let channels = Arc::new(channels);
    let retrier = Arc::new(NotificationRetrier::new(notifier, config.notify_retry));

    // ── Workflows ───────────────────────────────────────────────────────
    let approvals = Arc::new(ApprovalCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&ledger),
        Arc::clone(&retrier),
        config.provision_stale_after,
    ));
    let rewards = Arc::new(RewardWorkflow::new(
        Arc::clone(&db),
        Arc::clone(&ledger),
        custody,
        Arc::clone(&retrier),
    ));
    let engine = Arc::new(ConversationEngine::new(
        Arc::clone(&db),
        Arc::clone(&ledger),
        rewards,
    ));
    let dispatcher = SessionDispatcher::new(
        Arc::new(EngineResponder::new(engine, Arc::clone(&channels))),
        config.session_idle_timeout,
    );

    // ── HTTP API ────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        db: Arc::clone(&db),
        approvals,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port)).await?;
    tracing::info!(port = config.api_port, "HTTP API listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP API stopped: {e}");
        }
    });

    // ── Message loop ────────────────────────────────────────────────────
    let mut messages = channels.start_all().await?;
    eprintln!("   Channels: {}\n", channels.names().join(", "));

    loop {
        tokio::select! {
            msg = messages.next() => match msg {
                Some(msg) => dispatcher.dispatch(msg),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    dispatcher.shutdown();
    channels.shutdown_all().await?;
    retrier.shutdown().await;
    Ok(())
}
