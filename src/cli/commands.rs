use anyhow::{Result, Context};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, error};

use crate::agent::{AgentOptions, AgentService};
use crate::agent_center::{AgentCenterService, InMemoryAgentStore};
use crate::bus::{InMemoryBus, MessageBus, RedisBus};
use crate::cli::config::{AgentSettings, CrawlerConfig};
use crate::crawler::Spider;
use crate::dataflow::{create_storage, DataParser, FollowRequestSelector};
use crate::downloader::HttpClientDownloader;
use crate::statistics::{InMemoryStatisticsStore, StatisticsClient, StatisticsService, StatisticsStore};

/// Crawl a site in this process: statistics, agent center, one agent and the spider
pub async fn crawl(
    url: String,
    profile: Option<String>,
    depth: Option<u32>,
    speed: Option<f64>,
    distributed: bool,
) -> Result<()> {
    let mut config = load_config(profile.as_deref())?;

    // Override configuration with command line parameters if provided
    if let Some(d) = depth {
        config.spider.depth = d;
    }
    if let Some(s) = speed {
        config.spider.speed = s;
    }
    config.validate()?;

    let bus = connect_bus(&config, distributed).await?;
    let services = CancellationToken::new();
    let statistics_store = Arc::new(InMemoryStatisticsStore::new());

    let mut tasks = vec![
        StatisticsService::new(bus.clone(), statistics_store.clone())
            .run(services.clone())
            .await?,
        AgentCenterService::new(bus.clone(), Arc::new(InMemoryAgentStore::new()))
            .run(services.clone())
            .await?,
    ];
    tasks.push(start_agent(&config, bus.clone(), services.clone()).await?);

    let storage = create_storage(&config.spider.storage_type, &config.storage)?;
    let mut builder = Spider::builder(config.spider.clone(), bus.clone())
        .add_data_flow(page_parser())
        .add_boxed_data_flow(storage)
        .add_urls([url.as_str()])?;
    if distributed {
        builder = builder.with_redis_url(&config.bus.redis_url);
    }

    let spider = builder.build().await.context("Failed to set up the crawl")?;
    let spider_id = spider.id().clone();
    let crawl = spider.cancellation_token();
    info!("Crawl {} started on {}", spider_id, url);

    let mut running = tokio::spawn(spider.run());
    let result = tokio::select! {
        result = &mut running => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping crawl {}", spider_id);
            crawl.cancel();
            running.await
        }
    };

    // Let the statistics service drain the last events
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(statistics) = statistics_store.spider_statistics(&spider_id.id).await? {
        println!("Crawl: {}", spider_id);
        println!("Total: {}", statistics.total);
        println!("Success: {}", statistics.success);
        println!("Failure: {}", statistics.failure);
    }

    services.cancel();
    join_all(tasks).await;

    result.context("Crawl task failed")??;
    Ok(())
}

/// Run a standalone agent until interrupted or told to exit
pub async fn agent(profile: Option<String>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    config.validate()?;

    let bus = connect_bus(&config, true).await?;
    let cancel = CancellationToken::new();
    let task = start_agent(&config, bus, cancel.clone()).await?;

    wait_for_shutdown(&cancel).await;
    join_all(vec![task]).await;
    Ok(())
}

/// Run the statistics service and agent center until interrupted
pub async fn center(profile: Option<String>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    config.validate()?;

    let bus = connect_bus(&config, true).await?;
    let cancel = CancellationToken::new();
    let tasks = vec![
        StatisticsService::new(bus.clone(), Arc::new(InMemoryStatisticsStore::new()))
            .run(cancel.clone())
            .await?,
        AgentCenterService::new(bus, Arc::new(InMemoryAgentStore::new()))
            .run(cancel.clone())
            .await?,
    ];

    wait_for_shutdown(&cancel).await;
    join_all(tasks).await;
    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles().await?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    // Load the profile if it exists
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        },
        Err(_) => {
            // Profile doesn't exist, create a new one
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name).await?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}

fn load_config(profile: Option<&str>) -> Result<CrawlerConfig> {
    CrawlerConfig::load(profile)
        .context(format!("Failed to load profile: {}", profile.unwrap_or("default")))
}

async fn connect_bus(config: &CrawlerConfig, distributed: bool) -> Result<Arc<dyn MessageBus>> {
    if distributed {
        let bus = RedisBus::connect(&config.bus.redis_url, config.bus.message_ttl)
            .await
            .context(format!("Failed to connect to redis at {}", config.bus.redis_url))?;
        Ok(Arc::new(bus))
    } else {
        Ok(Arc::new(InMemoryBus::new()))
    }
}

async fn start_agent(
    config: &CrawlerConfig,
    bus: Arc<dyn MessageBus>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let downloader = HttpClientDownloader::new(config.spider.user_agent.as_deref())?
        .with_name(&config.agent.downloader);
    let agent = AgentService::new(
        bus.clone(),
        Arc::new(downloader),
        StatisticsClient::new(bus),
        agent_options(&config.agent),
    );
    Ok(agent.run(cancel).await?)
}

fn agent_options(settings: &AgentSettings) -> AgentOptions {
    let mut options = AgentOptions::default();
    if let Some(id) = &settings.agent_id {
        options.agent_id = id.clone();
        options.agent_name = id.clone();
    }
    if let Some(name) = &settings.agent_name {
        options.agent_name = name.clone();
    }
    options.heartbeat_interval = Duration::from_secs(settings.heartbeat_interval);
    options.with_env()
}

/// Follows every link and records the page title
fn page_parser() -> DataParser {
    DataParser::new("page")
        .add_follow_request_selector(FollowRequestSelector::new("a[href]"))
        .with_parse(|context| {
            let titles = context.selectable().select_text("title")?;
            if let Some(title) = titles.first() {
                let record = json!({ "title": title, "status": context.response.status_code });
                context.add_data("page", record);
            }
            Ok(())
        })
}

async fn wait_for_shutdown(cancel: &CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_options_from_settings() {
        let settings = AgentSettings {
            agent_id: Some("agent-1".to_string()),
            agent_name: None,
            heartbeat_interval: 7,
            ..Default::default()
        };
        let options = agent_options(&settings);
        if std::env::var("AGENT_ID").is_err() {
            assert_eq!(options.agent_id, "agent-1");
        }
        assert_eq!(options.heartbeat_interval, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_page_parser_records_title() {
        use crate::crawler::{Request, Response, SpiderOptions};
        use crate::dataflow::{DataFlow, DataFlowContext};

        let mut parser = page_parser();
        parser.initialize().await.unwrap();

        let response = Response::new("h", 200)
            .with_header("content-type", "text/html")
            .with_content(b"<html><head><title>Home</title></head><body><a href='/next'>n</a></body></html>".to_vec());
        let mut context = DataFlowContext::new(
            Request::new("http://example.test/").unwrap(),
            response,
            Arc::new(SpiderOptions::default()),
        );
        parser.handle(&mut context).await.unwrap();

        assert_eq!(context.data("page")[0]["title"], "Home");
        assert_eq!(context.follow_requests()[0].url.as_str(), "http://example.test/next");
    }
}
