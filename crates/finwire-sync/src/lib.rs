//! Harvest pipeline orchestration: config, pacing, snapshot publication, periodic runner.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use finwire_adapters::{adapter_for_source, eastmoney_profile, SourceAdapter, SourceProfile};
use finwire_core::{ArticleRecord, FeedItem};
use finwire_storage::{
    ArticleStore, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, PageFetcher,
    RetryDisposition, SaveOutcome, DEFAULT_USER_AGENT,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finwire-sync";

const TAG_RULES_VERSION: u32 = 1;
const DEFAULT_LISTING_URL: &str = "https://finance.eastmoney.com/a/cywjh.html";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// Registry used when no sources file exists: the eastmoney headline listing.
    pub fn builtin() -> Self {
        let profile = eastmoney_profile();
        Self {
            sources: vec![SourceConfig {
                source_id: profile.source_id,
                display_name: "东方财富网".to_string(),
                enabled: true,
                origin: profile.origin,
                source_label: profile.source_label,
                category: profile.category,
                listing_urls: vec![DEFAULT_LISTING_URL.to_string()],
            }],
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(path = %path.display(), "sources file not found; using built-in registry");
            return Ok(Self::builtin());
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub origin: String,
    pub source_label: String,
    pub category: String,
    #[serde(default)]
    pub listing_urls: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn profile(&self) -> SourceProfile {
        SourceProfile {
            source_id: self.source_id.clone(),
            origin: self.origin.clone(),
            source_label: self.source_label.clone(),
            category: self.category.clone(),
        }
    }
}

/// Inclusive millisecond range a pacing delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        if min_ms <= max_ms {
            Self { min_ms, max_ms }
        } else {
            Self {
                min_ms: max_ms,
                max_ms: min_ms,
            }
        }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Accepts `"100-300"` or a single `"250"`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        match text.split_once('-') {
            Some((min, max)) => Some(Self::new(
                min.trim().parse().ok()?,
                max.trim().parse().ok()?,
            )),
            None => text.parse().ok().map(|ms| Self::new(ms, ms)),
        }
    }

    pub fn sample(&self) -> Duration {
        if self.min_ms == self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::rng().random_range(self.min_ms..=self.max_ms))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub between_details: DelayRange,
    pub between_sources: DelayRange,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            between_details: DelayRange::new(100, 300),
            between_sources: DelayRange::new(1000, 2000),
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            between_details: DelayRange::zero(),
            between_sources: DelayRange::zero(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_file: PathBuf,
    pub tag_rules_file: PathBuf,
    pub poll_interval: Duration,
    pub pacing: Pacing,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub fetch_retries: usize,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://finwire.db?mode=rwc".to_string(),
            sources_file: PathBuf::from("sources.yaml"),
            tag_rules_file: PathBuf::from("rules/tags.yaml"),
            poll_interval: Duration::from_secs(1800),
            pacing: Pacing::default(),
            http_timeout_secs: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            fetch_retries: BackoffPolicy::default().max_retries,
            web_port: 5000,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            sources_file: std::env::var("FINWIRE_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            tag_rules_file: std::env::var("FINWIRE_TAG_RULES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.tag_rules_file),
            poll_interval: env_parsed("FINWIRE_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            pacing: Pacing {
                between_details: std::env::var("FINWIRE_DETAIL_DELAY_MS")
                    .ok()
                    .and_then(|v| DelayRange::parse(&v))
                    .unwrap_or(defaults.pacing.between_details),
                between_sources: std::env::var("FINWIRE_SOURCE_DELAY_MS")
                    .ok()
                    .and_then(|v| DelayRange::parse(&v))
                    .unwrap_or(defaults.pacing.between_sources),
            },
            http_timeout_secs: env_parsed("FINWIRE_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("FINWIRE_USER_AGENT").unwrap_or(defaults.user_agent),
            fetch_retries: env_parsed("FINWIRE_FETCH_RETRIES").unwrap_or(defaults.fetch_retries),
            web_port: env_parsed("FINWIRE_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.fetch_retries,
            ..Default::default()
        }
    }
}

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, record: ArticleRecord) -> ArticleRecord;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, record: ArticleRecord) -> ArticleRecord {
        record
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRule {
    tag: String,
    contains_any: Vec<String>,
}

/// Tags records whose title or content mentions any of a rule's keywords.
pub struct KeywordTagHook {
    rules: Vec<TagRule>,
}

impl KeywordTagHook {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: TagRulesFile = serde_yaml::from_str(text).context("parsing tag rules")?;
        anyhow::ensure!(
            file.version == TAG_RULES_VERSION,
            "unsupported tag rules version {} (expected {TAG_RULES_VERSION})",
            file.version
        );
        Ok(Self { rules: file.rules })
    }

    /// `None` when the rules file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text)
            .map(Some)
            .with_context(|| format!("loading {}", path.display()))
    }
}

impl EnrichmentHook for KeywordTagHook {
    fn apply(&self, record: ArticleRecord) -> ArticleRecord {
        let combined = format!("{} {}", record.title, record.content).to_lowercase();
        let mut tags = record.tags.clone();
        for rule in &self.rules {
            if rule
                .contains_any
                .iter()
                .any(|needle| combined.contains(&needle.to_lowercase()))
                && !tags.contains(&rule.tag)
            {
                tags.push(rule.tag.clone());
            }
        }
        record.with_tags(tags)
    }
}

/// Sender half of the cooperative stop signal.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn channel() -> (Self, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx },
            StopSignal {
                rx,
                _keepalive: None,
            },
        )
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Checked between stub iterations; also interrupts pacing and idle waits.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested (or the sender is gone).
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep unless stopped first. Returns `false` if the wait was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_stopped();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_stopped(),
            _ = self.stopped() => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    ListingUnreachable,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: PassStatus,
    pub listed: usize,
    pub built: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub fetch_failed: usize,
    pub save_failed: usize,
}

#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub summary: PassSummary,
    pub records: Vec<ArticleRecord>,
}

impl PassOutcome {
    pub fn completed(&self) -> bool {
        self.summary.status == PassStatus::Completed
    }
}

/// A registry entry bound to its adapter.
pub struct ConfiguredSource {
    pub config: SourceConfig,
    pub adapter: Box<dyn SourceAdapter>,
}

impl ConfiguredSource {
    pub fn source_id(&self) -> &str {
        &self.config.source_id
    }
}

pub fn configure_sources(registry: &SourceRegistry) -> Result<Vec<Arc<ConfiguredSource>>> {
    registry
        .enabled()
        .map(|config| {
            let adapter = adapter_for_source(&config.profile())
                .with_context(|| format!("building adapter for {}", config.source_id))?
                .with_context(|| format!("no adapter registered for {}", config.source_id))?;
            Ok(Arc::new(ConfiguredSource {
                config: config.clone(),
                adapter,
            }))
        })
        .collect()
}

/// Records from the most recent completed pass of each source, replaced wholesale per pass.
#[derive(Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<RwLock<SnapshotState>>,
}

#[derive(Default)]
struct SnapshotState {
    by_source: BTreeMap<String, Arc<Vec<ArticleRecord>>>,
    passes: BTreeMap<String, PassSummary>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, source_id: &str, records: Vec<ArticleRecord>) {
        let records = Arc::new(records);
        self.inner
            .write()
            .await
            .by_source
            .insert(source_id.to_string(), records);
    }

    /// Keep the summary; replace the source's records only when the pass completed.
    pub async fn apply(&self, outcome: PassOutcome) {
        let mut state = self.inner.write().await;
        if outcome.completed() {
            state
                .by_source
                .insert(outcome.summary.source_id.clone(), Arc::new(outcome.records));
        }
        state
            .passes
            .insert(outcome.summary.source_id.clone(), outcome.summary);
    }

    pub async fn records(&self) -> Vec<ArticleRecord> {
        let parts = self
            .inner
            .read()
            .await
            .by_source
            .values()
            .cloned()
            .collect::<Vec<_>>();
        parts.iter().flat_map(|p| p.iter().cloned()).collect()
    }

    pub async fn feed(&self) -> Vec<FeedItem> {
        let parts = self
            .inner
            .read()
            .await
            .by_source
            .values()
            .cloned()
            .collect::<Vec<_>>();
        parts.iter().flat_map(|p| p.iter().map(FeedItem::from)).collect()
    }

    pub async fn passes(&self) -> Vec<PassSummary> {
        self.inner.read().await.passes.values().cloned().collect()
    }
}

pub struct Pipeline {
    fetcher: Arc<dyn PageFetcher>,
    store: ArticleStore,
    enrichment: Box<dyn EnrichmentHook>,
    pacing: Pacing,
    backoff: BackoffPolicy,
}

impl Pipeline {
    pub fn new(fetcher: Arc<dyn PageFetcher>, store: ArticleStore) -> Self {
        Self {
            fetcher,
            store,
            enrichment: Box::<NoopEnrichmentHook>::default(),
            pacing: Pacing::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    pub fn store(&self) -> &ArticleStore {
        &self.store
    }

    async fn fetch_with_retry(&self, url: &str, stop: &StopSignal) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch_text(url).await {
                Ok(text) => return Ok(text),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, retrying"
                    );
                    attempt += 1;
                    if !stop.sleep(delay).await {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One full pass over a source: listing pages, then each stub's detail page.
    pub async fn run_source(&self, source: &ConfiguredSource, stop: &StopSignal) -> PassOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("source_pass", %run_id, source_id = source.source_id());
        self.run_source_inner(run_id, source, stop)
            .instrument(span)
            .await
    }

    async fn run_source_inner(
        &self,
        run_id: Uuid,
        source: &ConfiguredSource,
        stop: &StopSignal,
    ) -> PassOutcome {
        let started_at = Utc::now();
        let mut summary = PassSummary {
            run_id,
            source_id: source.source_id().to_string(),
            started_at,
            finished_at: started_at,
            status: PassStatus::Completed,
            listed: 0,
            built: 0,
            inserted: 0,
            skipped: 0,
            fetch_failed: 0,
            save_failed: 0,
        };

        let mut stubs = Vec::new();
        let mut seen = HashSet::new();
        let mut reached_listing = false;
        for (idx, listing_url) in source.config.listing_urls.iter().enumerate() {
            // Listing pages of one source hit the same host, so they share detail pacing.
            if idx > 0 && !stop.sleep(self.pacing.between_details.sample()).await {
                break;
            }
            match self.fetch_with_retry(listing_url, stop).await {
                Ok(html) => {
                    reached_listing = true;
                    for stub in source.adapter.parse_listing(&html) {
                        if seen.insert(stub.url.clone()) {
                            stubs.push(stub);
                        }
                    }
                }
                Err(err) => warn!(url = %listing_url, error = %err, "listing fetch failed"),
            }
        }

        if !reached_listing {
            summary.status = if stop.is_stopped() {
                PassStatus::Stopped
            } else {
                PassStatus::ListingUnreachable
            };
            summary.finished_at = Utc::now();
            warn!(status = ?summary.status, "no listing page reached; pass aborted");
            return PassOutcome {
                summary,
                records: Vec::new(),
            };
        }

        summary.listed = stubs.len();
        info!(listed = summary.listed, "listing parsed");
        if stop.is_stopped() {
            summary.status = PassStatus::Stopped;
        }

        let mut records = Vec::with_capacity(stubs.len());
        for (idx, stub) in stubs.into_iter().enumerate() {
            if stop.is_stopped()
                || (idx > 0 && !stop.sleep(self.pacing.between_details.sample()).await)
            {
                summary.status = PassStatus::Stopped;
                break;
            }

            let html = match self.fetch_with_retry(&stub.url, stop).await {
                Ok(html) => html,
                Err(err) => {
                    summary.fetch_failed += 1;
                    warn!(url = %stub.url, error = %err, "detail fetch failed; skipping");
                    continue;
                }
            };

            let detail = source.adapter.extract_detail(&html);
            let record = self.enrichment.apply(ArticleRecord::build(stub, detail));
            match self.store.save(&record).await {
                Ok(SaveOutcome::Inserted) => summary.inserted += 1,
                Ok(SaveOutcome::Skipped) => summary.skipped += 1,
                Err(err) => {
                    summary.save_failed += 1;
                    warn!(url = %record.url, error = %err, "saving article failed");
                }
            }
            records.push(record);
        }

        summary.built = records.len();
        summary.finished_at = Utc::now();
        info!(
            status = ?summary.status,
            built = summary.built,
            inserted = summary.inserted,
            skipped = summary.skipped,
            fetch_failed = summary.fetch_failed,
            save_failed = summary.save_failed,
            "pass finished"
        );
        PassOutcome { summary, records }
    }
}

/// One sequential pass over every source, pausing between sources.
pub async fn run_once(
    pipeline: &Pipeline,
    sources: &[Arc<ConfiguredSource>],
    snapshot: &SnapshotStore,
    stop: &StopSignal,
) -> Vec<PassSummary> {
    let mut summaries = Vec::with_capacity(sources.len());
    for (idx, source) in sources.iter().enumerate() {
        if idx > 0 && !stop.sleep(pipeline.pacing().between_sources.sample()).await {
            break;
        }
        let outcome = pipeline.run_source(source, stop).await;
        summaries.push(outcome.summary.clone());
        snapshot.apply(outcome).await;
        if stop.is_stopped() {
            break;
        }
    }
    summaries
}

/// Background tasks, one per source, each on its own fixed-interval ticker.
pub struct Runner {
    stop: StopHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Runner {
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        sources: Vec<Arc<ConfiguredSource>>,
        snapshot: SnapshotStore,
        interval: Duration,
    ) -> Self {
        let (stop, _) = StopHandle::channel();
        let period = interval.max(Duration::from_millis(1));
        let mut stagger = Duration::ZERO;
        let mut tasks = Vec::with_capacity(sources.len());
        for (idx, source) in sources.into_iter().enumerate() {
            if idx > 0 {
                stagger += pipeline.pacing().between_sources.sample();
            }
            tasks.push(tokio::spawn(source_loop(
                pipeline.clone(),
                source,
                snapshot.clone(),
                period,
                stagger,
                stop.signal(),
            )));
        }
        info!(sources = tasks.len(), interval_secs = period.as_secs(), "runner started");
        Self { stop, tasks }
    }

    /// Request stop and wait for every source task to wind down.
    pub async fn shutdown(self) {
        self.stop.stop();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "source task ended abnormally");
            }
        }
        info!("runner stopped");
    }
}

async fn source_loop(
    pipeline: Arc<Pipeline>,
    source: Arc<ConfiguredSource>,
    snapshot: SnapshotStore,
    period: Duration,
    initial_delay: Duration,
    stop: StopSignal,
) {
    if !stop.sleep(initial_delay).await {
        return;
    }
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.stopped() => break,
        }
        let outcome = pipeline.run_source(&source, &stop).await;
        snapshot.apply(outcome).await;
        if stop.is_stopped() {
            break;
        }
    }
}

/// Wire store, fetcher, enrichment, and sources from config.
pub async fn build_pipeline(
    config: &SyncConfig,
) -> Result<(Arc<Pipeline>, Vec<Arc<ConfiguredSource>>)> {
    let store = ArticleStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("creating article schema")?;

    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let enrichment: Box<dyn EnrichmentHook> =
        match KeywordTagHook::load(&config.tag_rules_file).await? {
            Some(hook) => Box::new(hook),
            None => Box::<NoopEnrichmentHook>::default(),
        };

    let registry = SourceRegistry::load(&config.sources_file).await?;
    let sources = configure_sources(&registry)?;

    let pipeline = Pipeline::new(Arc::new(fetcher), store)
        .with_enrichment(enrichment)
        .with_pacing(config.pacing)
        .with_backoff(config.backoff());
    Ok((Arc::new(pipeline), sources))
}
