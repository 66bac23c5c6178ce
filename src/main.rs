use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use deskchat::config::Config;
use deskchat::core::cache::CacheStore;
use deskchat::core::chat::{ChatOptions, ChatService};
use deskchat::core::llm::anthropic::AnthropicProvider;
use deskchat::core::refresh::{RefreshScheduler, SchedulerConfig};
use deskchat::core::tools::Toolbox;
use deskchat::interfaces::web;
use deskchat::logging;
use deskchat::sources::TicketSource;
use deskchat::sources::freshservice::FreshserviceSource;
use deskchat::sources::jira::JiraSource;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let config = Config::from_env()?;
    info!("Starting deskchat on {}:{}", config.api_host, config.api_port);

    let cache = Arc::new(CacheStore::open(
        &config.data_dir,
        config.jira.cache_ttl,
        config.freshservice.cache_ttl,
    )?);

    let jira: Arc<dyn TicketSource> = Arc::new(JiraSource::new(config.jira.clone()));
    let freshservice: Arc<dyn TicketSource> =
        Arc::new(FreshserviceSource::new(config.freshservice.clone()));

    let scheduler = RefreshScheduler::new(
        cache.clone(),
        jira.clone(),
        freshservice.clone(),
        SchedulerConfig {
            jira_interval: config.jira.refresh_interval,
            freshservice_interval: config.freshservice.refresh_interval,
            ..SchedulerConfig::default()
        },
    );
    scheduler.start();

    let toolbox = Arc::new(Toolbox::new(
        cache.clone(),
        scheduler.clone(),
        freshservice.clone(),
    ));
    let provider = Arc::new(AnthropicProvider::new(
        config.anthropic_api_key.clone(),
        config.model.clone(),
    ));
    let chat = Arc::new(ChatService::new(provider, toolbox, ChatOptions::default()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let result = web::serve(
        &config.api_host,
        config.api_port,
        chat,
        cache,
        scheduler.clone(),
        shutdown,
    )
    .await;

    scheduler.shutdown();
    result
}
