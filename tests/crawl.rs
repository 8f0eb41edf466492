use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use spider_engine::agent::{AgentOptions, AgentService};
use spider_engine::bus::{handler, topics, InMemoryBus, MessageBus};
use spider_engine::crawler::{SpiderBuilder, SpiderId, SpiderOptions};
use spider_engine::dataflow::{DataFlow, DataFlowContext, DataParser, FlowOutcome, FollowRequestSelector};
use spider_engine::downloader::{names, FakeDownloader};
use spider_engine::scheduler::{QueueScheduler, Scheduler};
use spider_engine::statistics::{
    InMemoryStatisticsStore, SpiderStatistics, StatisticsClient, StatisticsService, StatisticsStore,
};

const HOME: &str = r#"<html><body>
    <a href="/a">a</a>
    <a href="/b">b</a>
    <a href="/c">c</a>
    <a href="/a">a again</a>
</body></html>"#;

struct Harness {
    bus: Arc<dyn MessageBus>,
    store: Arc<InMemoryStatisticsStore>,
    downloader: Arc<FakeDownloader>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn start(downloader: FakeDownloader) -> Self {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStatisticsStore::new());
        let downloader = Arc::new(downloader);
        let cancel = CancellationToken::new();

        let statistics = StatisticsService::new(bus.clone(), store.clone())
            .run(cancel.clone())
            .await
            .unwrap();
        let agent = AgentService::new(
            bus.clone(),
            downloader.clone(),
            StatisticsClient::new(bus.clone()),
            AgentOptions {
                agent_id: "agent-1".to_string(),
                agent_name: "agent-1".to_string(),
                heartbeat_interval: Duration::from_secs(5),
            },
        )
        .run(cancel.clone())
        .await
        .unwrap();

        Self {
            bus,
            store,
            downloader,
            cancel,
            tasks: vec![statistics, agent],
        }
    }

    fn options(&self) -> SpiderOptions {
        SpiderOptions {
            empty_sleep_time: 1,
            speed: 200.0,
            default_downloader: names::FAKE.to_string(),
            ..Default::default()
        }
    }

    async fn statistics(&self, spider_id: &str) -> SpiderStatistics {
        // Events are applied asynchronously
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.store.spider_statistics(spider_id).await.unwrap().unwrap()
    }

    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn scheduler() -> Arc<QueueScheduler> {
    Arc::new(QueueScheduler::distinct_bfs(Arc::new(AtomicBool::new(false))))
}

fn link_parser() -> DataParser {
    DataParser::new("links").add_follow_request_selector(FollowRequestSelector::new("a"))
}

#[tokio::test]
async fn test_crawl_follows_distinct_links() {
    let harness = Harness::start(FakeDownloader::new().with_page("http://example.test/", HOME)).await;
    let scheduler = scheduler();

    let spider = SpiderBuilder::new(harness.options(), harness.bus.clone())
        .with_spider_id(SpiderId::new("site", None).unwrap())
        .with_scheduler(scheduler.clone())
        .add_data_flow(link_parser())
        .add_urls(["http://example.test/"])
        .unwrap()
        .build()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(20), spider.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(scheduler.total().await.unwrap(), 4);
    assert_eq!(harness.downloader.downloads(), 4);

    let statistics = harness.statistics("site").await;
    assert_eq!(statistics.total, 4);
    assert_eq!(statistics.success, 4);
    assert_eq!(statistics.failure, 0);
    assert!(statistics.exit.is_some());

    let agent = harness.store.agent_statistics("agent-1").await.unwrap().unwrap();
    assert_eq!(agent.success, 4);

    harness.stop().await;
}

#[tokio::test]
async fn test_depth_limit_stops_following() {
    let harness = Harness::start(
        FakeDownloader::new()
            .with_page("http://example.test/", HOME)
            .with_page("http://example.test/a", r#"<a href="/deep">deep</a>"#),
    )
    .await;
    let scheduler = scheduler();

    let spider = SpiderBuilder::new(SpiderOptions { depth: 1, ..harness.options() }, harness.bus.clone())
        .with_spider_id(SpiderId::new("shallow", None).unwrap())
        .with_scheduler(scheduler.clone())
        .add_data_flow(link_parser())
        .add_urls(["http://example.test/"])
        .unwrap()
        .build()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(20), spider.run())
        .await
        .unwrap()
        .unwrap();

    // /deep sits at depth 2 and never reaches the scheduler
    assert_eq!(scheduler.total().await.unwrap(), 4);

    let statistics = harness.statistics("shallow").await;
    assert_eq!(statistics.success, 4);
    assert_eq!(statistics.failure, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_retry_budget_counts_one_failure() {
    let harness = Harness::start(FakeDownloader::new().with_status("http://example.test/", 500, "boom")).await;

    let spider = SpiderBuilder::new(SpiderOptions { retried_times: 2, ..harness.options() }, harness.bus.clone())
        .with_spider_id(SpiderId::new("flaky", None).unwrap())
        .add_data_flow(link_parser())
        .add_urls(["http://example.test/"])
        .unwrap()
        .build()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(20), spider.run())
        .await
        .unwrap()
        .unwrap();

    // First attempt plus two retries
    assert_eq!(harness.downloader.downloads(), 3);

    let statistics = harness.statistics("flaky").await;
    assert_eq!(statistics.success, 0);
    assert_eq!(statistics.failure, 1);

    let agent = harness.store.agent_statistics("agent-1").await.unwrap().unwrap();
    assert_eq!(agent.failure, 3);

    harness.stop().await;
}

/// Stops the crawl on the first page it sees
struct StopOnFirstPage;

#[async_trait]
impl DataFlow for StopOnFirstPage {
    fn name(&self) -> &str {
        "stop"
    }

    async fn handle(&self, _context: &mut DataFlowContext) -> anyhow::Result<FlowOutcome> {
        Ok(FlowOutcome::Exit("enough".to_string()))
    }
}

#[tokio::test]
async fn test_data_flow_can_stop_the_crawl() {
    let harness = Harness::start(FakeDownloader::new().with_page("http://example.test/", HOME)).await;

    // Without the exit the crawl would idle for a minute
    let spider = SpiderBuilder::new(SpiderOptions { empty_sleep_time: 60, ..harness.options() }, harness.bus.clone())
        .with_spider_id(SpiderId::new("stopper", None).unwrap())
        .add_data_flow(StopOnFirstPage)
        .add_data_flow(link_parser())
        .add_urls(["http://example.test/"])
        .unwrap()
        .build()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), spider.run())
        .await
        .unwrap()
        .unwrap();

    let statistics = harness.statistics("stopper").await;
    assert!(statistics.exit.is_some());
    assert_eq!(statistics.success, 0);
    assert_eq!(harness.downloader.downloads(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_failing_data_flow_init_aborts() {
    let harness = Harness::start(FakeDownloader::new()).await;

    let broken = DataParser::new("broken").add_required_validator("(unclosed");
    let spider = SpiderBuilder::new(harness.options(), harness.bus.clone())
        .with_spider_id(SpiderId::new("broken", None).unwrap())
        .add_data_flow(broken)
        .add_urls(["http://example.test/"])
        .unwrap()
        .build()
        .await
        .unwrap();
    let token = spider.cancellation_token();

    assert!(spider.run().await.is_err());
    assert!(token.is_cancelled());
    assert_eq!(harness.downloader.downloads(), 0);

    harness.stop().await;
}

/// Fails on every page it handles
#[derive(Default)]
struct AlwaysFails {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DataFlow for AlwaysFails {
    fn name(&self) -> &str {
        "fails"
    }

    async fn handle(&self, _context: &mut DataFlowContext) -> anyhow::Result<FlowOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("cannot store page")
    }
}

#[tokio::test]
async fn test_failing_data_flow_retries_until_budget() {
    let harness = Harness::start(FakeDownloader::new().with_page("http://example.test/", HOME)).await;
    let failing = AlwaysFails::default();
    let calls = failing.calls.clone();

    let spider = SpiderBuilder::new(SpiderOptions { retried_times: 2, ..harness.options() }, harness.bus.clone())
        .with_spider_id(SpiderId::new("fragile", None).unwrap())
        .add_data_flow(failing)
        .add_data_flow(link_parser())
        .add_urls(["http://example.test/"])
        .unwrap()
        .build()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(20), spider.run())
        .await
        .unwrap()
        .unwrap();

    // Each retry is a fresh download; links are never reached
    assert_eq!(harness.downloader.downloads(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let statistics = harness.statistics("fragile").await;
    assert_eq!(statistics.total, 1);
    assert_eq!(statistics.success, 0);
    assert_eq!(statistics.failure, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_in_flight_ceiling_holds_back_dispatch() {
    let harness = Harness::start(FakeDownloader::new()).await;

    // No agent serves this downloader, so nothing ever comes back
    let dispatched = Arc::new(AtomicUsize::new(0));
    let counter = dispatched.clone();
    harness
        .bus
        .consume(
            &topics::downloader("silent"),
            handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
            harness.cancel.clone(),
        )
        .await
        .unwrap();

    let options = SpiderOptions {
        requested_queue_count: 0,
        batch: 1,
        default_downloader: "silent".to_string(),
        ..harness.options()
    };
    let spider = SpiderBuilder::new(options, harness.bus.clone())
        .with_spider_id(SpiderId::new("ceiling", None).unwrap())
        .add_urls(["http://example.test/a", "http://example.test/b", "http://example.test/c"])
        .unwrap()
        .build()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(20), spider.run())
        .await
        .unwrap()
        .unwrap();

    // One request over a ceiling of zero, then the crawl waits out its budget
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    assert_eq!(harness.downloader.downloads(), 0);

    let statistics = harness.statistics("ceiling").await;
    assert_eq!(statistics.total, 3);
    assert_eq!(statistics.success, 0);
    assert!(statistics.exit.is_some());

    harness.stop().await;
}
