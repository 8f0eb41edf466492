//! Crawl orchestration: admission, dispatch, response correlation and shutdown

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::options::{RuntimeOptions, SpiderOptions};
use super::request::{Request, RequestPolicy};
use super::requested_queue::RequestedQueue;
use super::response::Response;
use super::throttle::Throttle;
use crate::bus::{handler, topics, Message, MessageBus};
use crate::dataflow::{DataFlow, DataFlowContext, FlowOutcome};
use crate::downloader::names;
use crate::error::{Result, SpiderError};
use crate::scheduler::{create_scheduler, Scheduler};
use crate::statistics::StatisticsClient;
use crate::supplier::RequestSupplier;

/// Longest accepted crawl id
pub const MAX_SPIDER_ID_LEN: usize = 36;

/// Backoff quantum of the dispatch loop, in milliseconds
const WAIT_QUANTUM_MS: u64 = 10;

const PRINT_INTERVAL: Duration = Duration::from_secs(5);

/// Identity of one crawl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderId {
    pub id: String,
    pub name: String,
}

impl SpiderId {
    pub fn new(id: &str, name: Option<&str>) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(SpiderError::Config("spider id cannot be empty".to_string()));
        }
        if id.chars().count() > MAX_SPIDER_ID_LEN {
            return Err(SpiderError::Config(format!(
                "spider id {} is longer than {} characters",
                id, MAX_SPIDER_ID_LEN
            )));
        }

        Ok(Self {
            id: id.to_string(),
            name: name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(id)
                .to_string(),
        })
    }

    /// Fresh random id
    pub fn generate(name: Option<&str>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            name: name.map(str::to_string).unwrap_or_else(|| id.clone()),
            id,
        }
    }

    /// Read `SPIDER_ID` and `SPIDER_NAME`, generating an id when unset
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("SPIDER_NAME").ok();
        match std::env::var("SPIDER_ID") {
            Ok(id) if !id.trim().is_empty() => Self::new(&id, name.as_deref()),
            _ => Ok(Self::generate(name.as_deref())),
        }
    }
}

impl fmt::Display for SpiderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

type TimeoutHook = Arc<dyn Fn(&[Request]) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&Request, &Response) + Send + Sync>;
type EmptyHook = Arc<dyn Fn() + Send + Sync>;
type ConfigureHook = Arc<dyn Fn(&mut Request) + Send + Sync>;

/// Callbacks a host can observe a crawl with
#[derive(Clone, Default)]
pub struct SpiderHooks {
    on_request_timeout: Option<TimeoutHook>,
    on_request_error: Option<ErrorHook>,
    on_scheduler_empty: Option<EmptyHook>,
    configure_request: Option<ConfigureHook>,
}

impl SpiderHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the requests requeued by a timeout sweep
    pub fn on_request_timeout<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Request]) + Send + Sync + 'static,
    {
        self.on_request_timeout = Some(Arc::new(f));
        self
    }

    /// Called after a failed download was resubmitted
    pub fn on_request_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &Response) + Send + Sync + 'static,
    {
        self.on_request_error = Some(Arc::new(f));
        self
    }

    pub fn on_scheduler_empty<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_scheduler_empty = Some(Arc::new(f));
        self
    }

    /// Adjust each dequeued request before dispatch
    pub fn configure_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        self.configure_request = Some(Arc::new(f));
        self
    }
}

/// Assembles a [`Spider`]
pub struct SpiderBuilder {
    options: SpiderOptions,
    bus: Arc<dyn MessageBus>,
    spider_id: Option<SpiderId>,
    scheduler: Option<Arc<dyn Scheduler>>,
    runtime: Option<Arc<RuntimeOptions>>,
    statistics: Option<StatisticsClient>,
    redis_url: Option<String>,
    hooks: SpiderHooks,
    data_flows: Vec<Box<dyn DataFlow>>,
    seeds: Vec<Request>,
    suppliers: Vec<Box<dyn RequestSupplier>>,
    cancel: Option<CancellationToken>,
}

impl SpiderBuilder {
    pub fn new(options: SpiderOptions, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            options,
            bus,
            spider_id: None,
            scheduler: None,
            runtime: None,
            statistics: None,
            redis_url: None,
            hooks: SpiderHooks::default(),
            data_flows: Vec::new(),
            seeds: Vec::new(),
            suppliers: Vec::new(),
            cancel: None,
        }
    }

    pub fn with_spider_id(mut self, spider_id: SpiderId) -> Self {
        self.spider_id = Some(spider_id);
        self
    }

    /// Use this scheduler instead of the one named by the options
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Share runtime options with the host so it can retune the crawl
    pub fn with_runtime_options(mut self, runtime: Arc<RuntimeOptions>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_statistics(mut self, statistics: StatisticsClient) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Redis server for the redis scheduler kinds
    pub fn with_redis_url(mut self, redis_url: &str) -> Self {
        self.redis_url = Some(redis_url.to_string());
        self
    }

    pub fn with_hooks(mut self, hooks: SpiderHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Append a pipeline stage; stages run in the order they are added
    pub fn add_data_flow<D: DataFlow + 'static>(mut self, data_flow: D) -> Self {
        self.data_flows.push(Box::new(data_flow));
        self
    }

    pub fn add_boxed_data_flow(mut self, data_flow: Box<dyn DataFlow>) -> Self {
        self.data_flows.push(data_flow);
        self
    }

    pub fn add_request(mut self, request: Request) -> Self {
        self.seeds.push(request);
        self
    }

    /// Seed GET requests carrying the default timeout and user agent
    pub fn add_urls<I, S>(mut self, urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            let mut request = Request::new(url.as_ref())?.with_timeout(self.options.default_timeout);
            if let Some(user_agent) = &self.options.user_agent {
                request = request.with_header("User-Agent", user_agent);
            }
            self.seeds.push(request);
        }
        Ok(self)
    }

    pub fn add_request_supplier<S: RequestSupplier + 'static>(mut self, supplier: S) -> Self {
        self.suppliers.push(Box::new(supplier));
        self
    }

    /// Validate the options and wire the crawl
    pub async fn build(self) -> Result<Spider> {
        self.options.validate()?;

        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(RuntimeOptions::new(&self.options)));

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => {
                create_scheduler(self.options.scheduler, runtime.drain_flag(), self.redis_url.as_deref())
                    .await?
            }
        };

        let spider_id = match self.spider_id {
            Some(spider_id) => spider_id,
            None => SpiderId::from_env()?,
        };

        Ok(Spider {
            id: spider_id,
            options: Arc::new(self.options),
            runtime,
            statistics: self
                .statistics
                .unwrap_or_else(|| StatisticsClient::new(self.bus.clone())),
            bus: self.bus,
            scheduler,
            hooks: self.hooks,
            data_flows: self.data_flows,
            seeds: self.seeds,
            suppliers: self.suppliers,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

/// One crawl, ready to run
pub struct Spider {
    id: SpiderId,
    options: Arc<SpiderOptions>,
    runtime: Arc<RuntimeOptions>,
    bus: Arc<dyn MessageBus>,
    scheduler: Arc<dyn Scheduler>,
    statistics: StatisticsClient,
    hooks: SpiderHooks,
    data_flows: Vec<Box<dyn DataFlow>>,
    seeds: Vec<Request>,
    suppliers: Vec<Box<dyn RequestSupplier>>,
    cancel: CancellationToken,
}

impl Spider {
    pub fn builder(options: SpiderOptions, bus: Arc<dyn MessageBus>) -> SpiderBuilder {
        SpiderBuilder::new(options, bus)
    }

    pub fn id(&self) -> &SpiderId {
        &self.id
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    pub fn runtime_options(&self) -> Arc<RuntimeOptions> {
        self.runtime.clone()
    }

    /// Token that stops the crawl when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the crawl to completion
    pub async fn run(self) -> Result<()> {
        let Spider {
            id,
            options,
            runtime,
            bus,
            scheduler,
            statistics,
            hooks,
            mut data_flows,
            seeds,
            suppliers,
            cancel,
        } = self;

        info!("Initializing spider {}, {}", id, id.name);
        statistics.start(&id.id, &id.name).await;

        let admission = Admission {
            spider_id: id.id.clone(),
            options: options.clone(),
            scheduler: scheduler.clone(),
            statistics: statistics.clone(),
        };

        let setup = async {
            scheduler.initialize(&id.id).await?;

            let seeded = admission.admit(seeds).await?;
            debug!("{} admitted {} seed requests", id, seeded);

            initialize_data_flows(&id, &mut data_flows).await?;

            let supplier_count = suppliers.len();
            for (index, supplier) in suppliers.iter().enumerate() {
                let requests = supplier.get_all(cancel.clone()).await?;
                admission.admit(requests).await?;
                info!("{} loaded requests from supplier {}/{}", id, index + 1, supplier_count);
            }

            statistics.increase_total(&id.id, scheduler.total().await?).await;
            Ok::<(), SpiderError>(())
        };

        // statistics already saw the start
        if let Err(e) = setup.await {
            error!("{} failed to start: {}", id, e);
            statistics.exit(&id.id).await;
            cancel.cancel();
            return Err(e);
        }

        let engine = Arc::new(Engine {
            id,
            options,
            runtime,
            bus,
            scheduler,
            statistics,
            hooks,
            admission,
            requested_queue: RequestedQueue::new(),
            has_parsers: data_flows.iter().any(|flow| flow.is_parser()),
            data_flows,
            cancel,
            exited: AtomicBool::new(false),
        });

        let consumer = engine.clone().subscribe().await?;
        let printer = (!engine.bus.is_distributed()).then(|| engine.spawn_printer());

        let result = engine.dispatch().await;
        if let Err(e) = &result {
            error!("{} exited with error: {}", engine.id, e);
        }
        engine.exit().await;

        if let Err(e) = consumer.await {
            error!("{} consumer task failed: {}", engine.id, e);
        }
        if let Some(printer) = printer {
            if let Err(e) = printer.await {
                error!("{} statistics printer failed: {}", engine.id, e);
            }
        }

        engine.release().await;
        result
    }
}

async fn initialize_data_flows(id: &SpiderId, data_flows: &mut [Box<dyn DataFlow>]) -> Result<()> {
    if data_flows.is_empty() {
        warn!("{} has no data flow", id);
        return Ok(());
    }

    let names: Vec<&str> = data_flows.iter().map(|flow| flow.name()).collect();
    info!("{} data flows: {}", id, names.join(" -> "));

    for flow in data_flows.iter_mut() {
        if let Err(e) = flow.initialize().await {
            error!("{} initializing data flow {} failed: {:#}", id, flow.name(), e);
            return Err(SpiderError::Config(format!(
                "data flow {} failed to initialize: {:#}",
                flow.name(),
                e
            )));
        }
    }
    Ok(())
}

/// The single path every seed, follow-link and retry takes into the scheduler
#[derive(Clone)]
struct Admission {
    spider_id: String,
    options: Arc<SpiderOptions>,
    scheduler: Arc<dyn Scheduler>,
    statistics: StatisticsClient,
}

impl Admission {
    /// Returns the number of requests the scheduler accepted
    async fn admit(&self, requests: Vec<Request>) -> Result<usize> {
        if requests.is_empty() {
            return Ok(0);
        }

        let mut admitted = Vec::with_capacity(requests.len());
        for mut request in requests {
            if request.downloader.as_deref().map_or(true, |name| name.trim().is_empty()) {
                request.downloader = Some(self.options.default_downloader.clone());
            }

            let downloader = request.downloader.as_deref().unwrap_or_default();
            let has_pattern = request
                .pppoe_pattern
                .as_deref()
                .is_some_and(|pattern| !pattern.trim().is_empty());
            if names::requires_pattern(downloader) && !has_pattern {
                return Err(SpiderError::MissingPattern {
                    uri: request.url.to_string(),
                    hash: request.hash().to_string(),
                    downloader: downloader.to_string(),
                });
            }

            if request.requested_times() > self.options.retried_times {
                debug!(
                    "{} gives up {} after {} attempts",
                    self.spider_id,
                    request.url,
                    request.requested_times()
                );
                self.statistics.increase_failure(&self.spider_id).await;
                continue;
            }

            if self.options.depth > 0 && request.depth() > self.options.depth {
                continue;
            }

            request.set_owner(&self.spider_id);
            admitted.push(request);
        }

        if admitted.is_empty() {
            return Ok(0);
        }
        self.scheduler.enqueue(admitted).await
    }
}

/// State shared by the dispatch loop and the response consumer
struct Engine {
    id: SpiderId,
    options: Arc<SpiderOptions>,
    runtime: Arc<RuntimeOptions>,
    bus: Arc<dyn MessageBus>,
    scheduler: Arc<dyn Scheduler>,
    statistics: StatisticsClient,
    hooks: SpiderHooks,
    admission: Admission,
    requested_queue: RequestedQueue,
    data_flows: Vec<Box<dyn DataFlow>>,
    has_parsers: bool,
    cancel: CancellationToken,
    exited: AtomicBool,
}

impl Engine {
    async fn subscribe(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let topic = topics::spider(&self.id.id);
        info!("{} register topic {}", self.id, topic);

        let engine = self.clone();
        self.bus
            .consume(
                &topic,
                handler(move |bytes| {
                    let engine = engine.clone();
                    async move { engine.on_message(bytes).await }
                }),
                self.cancel.clone(),
            )
            .await
    }

    fn spawn_printer(&self) -> JoinHandle<()> {
        let statistics = self.statistics.clone();
        let spider_id = self.id.id.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + PRINT_INTERVAL;
            let mut interval = tokio::time::interval_at(start, PRINT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => statistics.print(&spider_id).await,
                }
            }
        })
    }

    async fn on_message(&self, bytes: Vec<u8>) {
        let message = match Message::from_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} deserializing message failed: {}", self.id, e);
                return;
            }
        };

        match message {
            Message::SpiderExit { spider_id } => {
                info!("{} received exit message for {}", self.id, spider_id);
                if spider_id == self.id.id {
                    self.exit().await;
                }
            }
            Message::Response(response) => {
                if let Err(e) = self.on_response(*response).await {
                    error!("{} handling response failed: {}", self.id, e);
                    self.exit().await;
                }
            }
            other => warn!("{} received unsupported message: {}", self.id, other.kind()),
        }
    }

    async fn on_response(&self, response: Response) -> Result<()> {
        // Late answers to requests already requeued by a timeout land here
        let Some(mut request) = self.requested_queue.dequeue(&response.request_hash) else {
            debug!("{} dropped response for unknown request {}", self.id, response.request_hash);
            return Ok(());
        };

        if response.is_success() {
            request.agent = Some(response.agent.clone()).filter(|agent| !agent.is_empty());
            if self.bus.is_distributed() {
                info!(
                    "{} download {}, {} via {} success",
                    self.id,
                    request.url,
                    request.hash(),
                    response.agent
                );
            }

            self.statistics
                .increase_agent_success(&response.agent, response.elapsed_ms)
                .await;
            self.handle_response(request, response).await
        } else {
            self.statistics
                .increase_agent_failure(&response.agent, response.elapsed_ms)
                .await;
            warn!(
                "{} download {}, {} status code: {} failed: {}",
                self.id,
                request.url,
                request.hash(),
                response.status_code,
                response.reason_phrase.as_deref().unwrap_or_default()
            );

            request.increase_requested_times();
            self.admission.admit(vec![request.clone()]).await?;

            if let Some(hook) = &self.hooks.on_request_error {
                hook(&request, &response);
            }
            Ok(())
        }
    }

    /// Run the pipeline over one successful response
    async fn handle_response(&self, request: Request, response: Response) -> Result<()> {
        let mut context = DataFlowContext::new(request, response, self.options.clone());

        for flow in &self.data_flows {
            match flow.handle(&mut context).await {
                Ok(FlowOutcome::Continue) => {}
                Ok(FlowOutcome::Exit(reason)) => {
                    info!("{} exit requested by {}: {}", self.id, flow.name(), reason);
                    self.exit().await;
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "{} handle {}, {} failed in {}: {:#}",
                        self.id,
                        context.request.url,
                        context.request.hash(),
                        flow.name(),
                        e
                    );
                    self.scheduler.fail(&context.request).await?;

                    let mut retry = context.request.clone();
                    retry.increase_requested_times();
                    self.admission.admit(vec![retry]).await?;
                    return Ok(());
                }
            }
        }

        let follow_requests = context.take_follow_requests();
        let count = self.admission.admit(follow_requests).await?;
        if count > 0 {
            self.statistics.increase_total(&self.id.id, count as u64).await;
        }

        self.statistics.increase_success(&self.id.id).await;
        self.scheduler.success(&context.request).await
    }

    /// Without parsers every request is worth downloading
    fn is_valid_request(&self, request: &Request) -> bool {
        !self.has_parsers
            || self
                .data_flows
                .iter()
                .filter(|flow| flow.is_parser())
                .any(|flow| flow.is_valid_request(request))
    }

    async fn dispatch(&self) -> Result<()> {
        let sleep_limit = self.options.empty_sleep_time * 1000;
        let mut throttle = Throttle::new(self.runtime.speed());
        let mut sleep_time = 0;
        let start = Instant::now();
        let mut end = start;

        while !self.cancel.is_cancelled() {
            if self.requested_queue.len() > self.options.requested_queue_count {
                sleep_time += WAIT_QUANTUM_MS;
                let waiting = format!("{} has too many requests in flight", self.id);
                if self.wait_for_continue(sleep_time, sleep_limit, end - start, Some(&waiting)).await {
                    continue;
                }
                break;
            }

            if self.requeue_timed_out().await? {
                continue;
            }

            let requests = self.scheduler.dequeue(self.runtime.batch()).await?;

            if requests.is_empty() {
                if let Some(hook) = &self.hooks.on_scheduler_empty {
                    hook();
                }

                sleep_time += WAIT_QUANTUM_MS;
                if !self.wait_for_continue(sleep_time, sleep_limit, end - start, None).await {
                    break;
                }
                continue;
            }

            sleep_time = 0;
            for mut request in requests {
                if let Some(configure) = &self.hooks.configure_request {
                    configure(&mut request);
                }

                // Nothing would consume the response
                if !self.is_valid_request(&request) {
                    debug!("{} skipped {}, no parser claims it", self.id, request.url);
                    continue;
                }

                let speed = self.runtime.speed();
                if throttle.needs_rebuild(speed) {
                    debug!("{} speed changed from {} to {}", self.id, throttle.speed(), speed);
                    throttle = Throttle::new(speed);
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = throttle.acquire() => {}
                }

                self.publish_request(request).await?;
            }

            end = Instant::now();
        }

        Ok(())
    }

    /// Requeue every request past its deadline. Returns whether any was found.
    async fn requeue_timed_out(&self) -> Result<bool> {
        let mut timed_out = self.requested_queue.timeout_list();
        if timed_out.is_empty() {
            return Ok(false);
        }

        for request in &mut timed_out {
            request.increase_requested_times();
            warn!("{} request {}, {} timed out", self.id, request.url, request.hash());
        }

        self.admission.admit(timed_out.clone()).await?;

        if let Some(hook) = &self.hooks.on_request_timeout {
            hook(&timed_out);
        }
        Ok(true)
    }

    async fn wait_for_continue(
        &self,
        sleep_time: u64,
        sleep_limit: u64,
        busy: Duration,
        waiting: Option<&str>,
    ) -> bool {
        if sleep_time > sleep_limit {
            info!("{} exit: {} seconds", self.id, busy.as_secs());
            return false;
        }

        if let Some(waiting) = waiting {
            debug!("{}", waiting);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(WAIT_QUANTUM_MS)) => true,
        }
    }

    async fn publish_request(&self, mut request: Request) -> Result<()> {
        request.stamp_dispatch_time();

        let topic = dispatch_topic(&request, self.bus.is_distributed());

        let bytes = Message::Request(Box::new(request.clone())).to_bytes()?;
        let (uri, hash) = (request.url.to_string(), request.hash().to_string());

        if !self.requested_queue.enqueue(request) {
            return Err(SpiderError::InFlightCollision { uri, hash });
        }

        self.bus.publish(&topic, bytes).await
    }

    /// Idempotent: the first call reports the exit and stops the crawl
    async fn exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.statistics.exit(&self.id.id).await;
        self.cancel.cancel();
    }

    async fn release(&self) {
        if let Err(e) = self.bus.close_topic(&topics::spider(&self.id.id)).await {
            warn!("{} closing topic failed: {}", self.id, e);
        }
        if let Err(e) = self.scheduler.close().await {
            warn!("{} closing scheduler failed: {}", self.id, e);
        }
        for flow in &self.data_flows {
            if let Err(e) = flow.close().await {
                warn!("{} closing data flow {} failed: {:#}", self.id, flow.name(), e);
            }
        }
        self.requested_queue.clear();
        info!("{} stopped", self.id);
    }
}

/// Topic a request is dispatched on. Agents only listen on their own topic
/// when the bus is distributed, so chained routing needs one.
fn dispatch_topic(request: &Request, distributed: bool) -> String {
    match (&request.agent, request.policy) {
        (Some(agent), RequestPolicy::Chained) if distributed && !agent.is_empty() => topics::agent(agent),
        _ => topics::downloader(request.downloader.as_deref().unwrap_or(names::HTTP_CLIENT)),
    }
}
