//! angel: multi-session conversational LLM proxy

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use angel_core::{build_provider, Config, Engine, ProviderConfig, ProviderKind, ToolRegistry};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "angel=info,angel_core=info,angel_server=info,angel_tools=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Port via the first positional argument, config path via the second
    // or ANGEL_CONFIG.
    let mut config_path = None;
    let mut port_arg = None;
    for arg in std::env::args().skip(1) {
        if let Ok(port) = arg.parse::<u16>() {
            port_arg = Some(port);
        } else {
            config_path = Some(std::path::PathBuf::from(arg));
        }
    }
    let config_path = config_path
        .or_else(|| std::env::var("ANGEL_CONFIG").ok().map(Into::into))
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join("angel/angel.toml")
        });

    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(port) = port_arg {
        config.port = port;
    }

    // Pick the backend: the first configured provider, or a local
    // OpenAI-compatible endpoint when nothing is configured.
    let provider_config = config.providers.first().cloned().unwrap_or_else(|| {
        tracing::warn!("no provider configured; falling back to http://localhost:11434");
        ProviderConfig {
            name: "local".to_string(),
            kind: ProviderKind::OpenAi,
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            api_key_env: None,
        }
    });
    let provider = build_provider(&provider_config)?;
    tracing::info!(
        provider = %provider_config.name,
        model = %config.default_model,
        data_dir = %config.data_dir.display(),
        "starting"
    );

    let mut registry = ToolRegistry::new();
    angel_tools::register_builtin(&mut registry);

    let port = config.port;
    let engine = Engine::new(config, provider, Arc::new(registry))?;

    // One-shot migration from a pre-split monolithic database.
    if let Ok(legacy) = std::env::var("ANGEL_MIGRATE") {
        let legacy = std::path::PathBuf::from(legacy);
        let report = angel_core::migrate_monolithic(
            &legacy,
            engine.main(),
            &engine.config().sessions_dir(),
        )
        .with_context(|| format!("migrating {}", legacy.display()))?;
        tracing::info!(?report, "legacy database migrated");
    }

    tokio::spawn(angel_core::housekeeping::run(
        Arc::clone(&engine),
        HOUSEKEEPING_INTERVAL,
    ));

    angel_server::serve(engine, port).await
}
