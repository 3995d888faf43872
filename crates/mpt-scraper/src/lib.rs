//! Headless-browser page sessions + layered extraction of menu items.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use chrono::Utc;
use futures::StreamExt;
use mpt_core::{is_unwanted, normalize_product_id, parse_price, truncate_description, ScrapedItem};
use mpt_storage::ArtifactStore;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "mpt-scraper";

pub const DEFAULT_TARGET_URL: &str = "https://app.cardapioweb.com/acai_moto_food";

/// Accessible names of buttons that close a popup.
pub static CLOSE_BUTTON_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(close|fechar|x|×)\s*$").expect("close button regex is valid")
});

const ANCESTOR_TAGS: &[&str] = &["div", "article", "li"];

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid selector `{selector}` for {field}: {message}")]
    Invalid {
        field: &'static str,
        selector: String,
        message: String,
    },
    #[error("reading selector file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing selector file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("product name marker `{0}` never appeared")]
    MarkersMissing(String),
    #[error("browser {operation} failed: {message}")]
    Browser {
        operation: &'static str,
        message: String,
    },
    #[error("{0} is not supported by this session")]
    Unsupported(&'static str),
}

/// CSS selectors for the tracked menu, overridable from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub name: String,
    pub description: String,
    pub price_current: String,
    pub price_previous: String,
    pub price_base: String,
    pub price_base_loose: String,
    pub forward: ForwardSelectors,
    pub overlay_marker: String,
    pub close_buttons: Vec<String>,
}

/// Looser variants used when scanning forward from a name in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardSelectors {
    pub price_current: String,
    pub price_base: String,
    pub price_base_loose: String,
    pub price_previous: String,
    pub description: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            name: "h3.text-base.font-medium.leading-6.text-gray-700.line-clamp-2".into(),
            description: ".text-sm.font-light.text-gray-500.line-clamp-3".into(),
            price_current: "span.text-base.text-green-500".into(),
            price_previous: "span.text-sm.text-gray-500.line-through".into(),
            price_base: r"div.mt-3.text-base.text-gray-700.md\:mt-6".into(),
            price_base_loose: "div.mt-3.text-base.text-gray-700".into(),
            forward: ForwardSelectors::default(),
            overlay_marker: ".z-30.flex.items-center.justify-between.p-4".into(),
            close_buttons: vec![
                ".z-30.flex.items-center.justify-between.p-4 > .MuiButtonBase-root".into(),
                r#"button.MuiButtonBase-root[aria-label="Close"]"#.into(),
                r#"button[aria-label="Fechar"]"#.into(),
                r#"button[aria-label="close"]"#.into(),
            ],
        }
    }
}

impl Default for ForwardSelectors {
    fn default() -> Self {
        Self {
            price_current: "span.text-green-500".into(),
            price_base: r"div.mt-3.text-base.text-gray-700.md\:mt-6".into(),
            price_base_loose: "div.mt-3.text-base.text-gray-700".into(),
            price_previous: "span.line-through".into(),
            description: ".text-sm.text-gray-500".into(),
        }
    }
}

impl SelectorConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, SelectorError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Built-in selectors, or the YAML file at `path` layered over them.
    pub fn load(path: Option<&Path>) -> Result<Self, SelectorError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| SelectorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }
}

fn compile(field: &'static str, selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|e| SelectorError::Invalid {
        field,
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// A `SelectorConfig` with every selector parsed once.
#[derive(Debug, Clone)]
pub struct SelectorSet {
    config: SelectorConfig,
    name: Selector,
    description: Selector,
    price_current: Selector,
    price_previous: Selector,
    price_base: Selector,
    price_base_loose: Selector,
    forward_current: Selector,
    forward_base: Selector,
    forward_base_loose: Selector,
    forward_previous: Selector,
    forward_description: Selector,
}

impl SelectorSet {
    pub fn compile(config: SelectorConfig) -> Result<Self, SelectorError> {
        compile("overlay_marker", &config.overlay_marker)?;
        for selector in &config.close_buttons {
            compile("close_buttons", selector)?;
        }
        Ok(Self {
            name: compile("name", &config.name)?,
            description: compile("description", &config.description)?,
            price_current: compile("price_current", &config.price_current)?,
            price_previous: compile("price_previous", &config.price_previous)?,
            price_base: compile("price_base", &config.price_base)?,
            price_base_loose: compile("price_base_loose", &config.price_base_loose)?,
            forward_current: compile("forward.price_current", &config.forward.price_current)?,
            forward_base: compile("forward.price_base", &config.forward.price_base)?,
            forward_base_loose: compile(
                "forward.price_base_loose",
                &config.forward.price_base_loose,
            )?,
            forward_previous: compile("forward.price_previous", &config.forward.price_previous)?,
            forward_description: compile("forward.description", &config.forward.description)?,
            config,
        })
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }
}

/// Raw sibling texts found for one product name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldTexts {
    pub current: String,
    pub previous: String,
    pub base: String,
    pub description: String,
}

impl FieldTexts {
    fn has_price(&self) -> bool {
        !self.current.is_empty() || !self.base.is_empty()
    }
}

/// One way of locating a name's sibling fields in the rendered tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Search the nearest `div`/`article`/`li` ancestors, innermost first.
    AncestorWalk { max_depth: usize },
    /// Take the first matching element after the name in document order.
    ForwardScan,
}

pub const DEFAULT_STRATEGIES: &[LookupStrategy] = &[
    LookupStrategy::AncestorWalk { max_depth: 6 },
    LookupStrategy::ForwardScan,
];

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text_within(container: ElementRef<'_>, selector: &Selector) -> String {
    container
        .select(selector)
        .next()
        .map(element_text)
        .unwrap_or_default()
}

fn first_text_after(document: &Html, name: ElementRef<'_>, selector: &Selector) -> String {
    let mut passed = false;
    for node in document.root_element().descendants() {
        if node.id() == name.id() {
            passed = true;
            continue;
        }
        if !passed {
            continue;
        }
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        if el.ancestors().any(|a| a.id() == name.id()) {
            continue;
        }
        if selector.matches(&el) {
            return element_text(el);
        }
    }
    String::new()
}

impl LookupStrategy {
    pub fn resolve(
        &self,
        document: &Html,
        name: ElementRef<'_>,
        selectors: &SelectorSet,
    ) -> Option<FieldTexts> {
        match *self {
            Self::AncestorWalk { max_depth } => name
                .ancestors()
                .filter_map(ElementRef::wrap)
                .filter(|el| ANCESTOR_TAGS.contains(&el.value().name()))
                .take(max_depth)
                .find_map(|container| {
                    let mut base = first_text_within(container, &selectors.price_base);
                    if base.is_empty() {
                        base = first_text_within(container, &selectors.price_base_loose);
                    }
                    let fields = FieldTexts {
                        current: first_text_within(container, &selectors.price_current),
                        previous: first_text_within(container, &selectors.price_previous),
                        base,
                        description: first_text_within(container, &selectors.description),
                    };
                    fields.has_price().then_some(fields)
                }),
            Self::ForwardScan => {
                let mut base = first_text_after(document, name, &selectors.forward_base);
                if base.is_empty() {
                    base = first_text_after(document, name, &selectors.forward_base_loose);
                }
                let fields = FieldTexts {
                    current: first_text_after(document, name, &selectors.forward_current),
                    previous: first_text_after(document, name, &selectors.forward_previous),
                    base,
                    description: first_text_after(document, name, &selectors.forward_description),
                };
                (fields != FieldTexts::default()).then_some(fields)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub markers_found: usize,
    pub markers_walked: usize,
    pub empty_names: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub extracted: usize,
    pub ancestor_hits: usize,
    pub forward_hits: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub items: Vec<ScrapedItem>,
    pub report: ExtractionReport,
}

/// Extracts candidate items from a rendered DOM snapshot.
///
/// Name markers are walked in document order, capped at `max_items` (0 means
/// no cap). Names repeating an earlier normalized id are skipped, and items
/// failing the unwanted filter are counted in `report.rejected`.
pub fn extract_from_html(
    html: &str,
    selectors: &SelectorSet,
    strategies: &[LookupStrategy],
    max_items: usize,
) -> Extraction {
    let document = Html::parse_document(html);
    let names = document.select(&selectors.name).collect::<Vec<_>>();
    let take = if max_items == 0 {
        names.len()
    } else {
        names.len().min(max_items)
    };

    let mut out = Extraction::default();
    out.report.markers_found = names.len();
    let mut seen = HashSet::new();

    for (index, name_el) in names.into_iter().take(take).enumerate() {
        out.report.markers_walked += 1;
        let name = element_text(name_el);
        if name.is_empty() {
            out.report.empty_names += 1;
            continue;
        }
        let id = normalize_product_id(&name);
        if !id.is_empty() && !seen.insert(id) {
            out.report.duplicates += 1;
            continue;
        }

        let mut fields = FieldTexts::default();
        let mut resolved_by = None;
        for strategy in strategies {
            if let Some(found) = strategy.resolve(&document, name_el, selectors) {
                fields = found;
                resolved_by = Some(*strategy);
                break;
            }
        }
        match resolved_by {
            Some(LookupStrategy::AncestorWalk { .. }) => out.report.ancestor_hits += 1,
            Some(LookupStrategy::ForwardScan) => out.report.forward_hits += 1,
            None => out.report.unresolved += 1,
        }

        let current = parse_price(&fields.current);
        let base = parse_price(&fields.base);
        let price = if current > 0.0 { current } else { base };
        debug!(
            index,
            %name,
            current = %fields.current,
            base = %fields.base,
            previous = %fields.previous,
            price,
            "resolved item"
        );

        if is_unwanted(&name, price) {
            debug!(%name, "skipping unwanted item");
            out.report.rejected += 1;
            continue;
        }

        out.items.push(ScrapedItem {
            name,
            price,
            description: truncate_description(&fields.description),
            extracted_prev_price: parse_price(&fields.previous),
            extracted_base_price: base,
            extracted_current_price: current,
        });
    }

    out.report.extracted = out.items.len();
    out
}

/// Operations the extractor needs from a live page.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), ScrapeError>;

    /// Polls until `selector` matches or `timeout` passes; `Ok(false)` on timeout.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
        -> Result<bool, ScrapeError>;

    /// Clicks the first visible match. `Ok(false)` when nothing visible matched.
    async fn click_first_visible(&self, selector: &str, timeout: Duration)
        -> Result<bool, ScrapeError>;

    async fn click_button_named(&self, name: &Regex, timeout: Duration)
        -> Result<bool, ScrapeError>;

    async fn press_escape(&self) -> Result<(), ScrapeError>;

    async fn element_exists(&self, selector: &str) -> Result<bool, ScrapeError>;

    /// Scrolls down by `px` and reports the page geometry afterwards.
    async fn scroll_by(&self, px: u32) -> Result<ScrollMetrics, ScrapeError>;

    async fn content(&self) -> Result<String, ScrapeError>;

    async fn screenshot(&self) -> Result<Vec<u8>, ScrapeError>;

    async fn close(&self) -> Result<(), ScrapeError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn PageSession>, ScrapeError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollMetrics {
    pub content_height: f64,
    pub viewport_height: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct OverlayPolicy {
    pub attempts: usize,
    pub pause: Duration,
    pub click_timeout: Duration,
}

impl Default for OverlayPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_millis(300),
            click_timeout: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollPolicy {
    pub step_px: u32,
    pub interval: Duration,
    pub settle: Duration,
    pub max_steps: usize,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            step_px: 800,
            interval: Duration::from_millis(200),
            settle: Duration::from_millis(500),
            max_steps: 400,
        }
    }
}

/// Best-effort popup dismissal. Returns the number of rounds attempted.
pub async fn dismiss_overlays(
    session: &dyn PageSession,
    selectors: &SelectorConfig,
    policy: &OverlayPolicy,
) -> usize {
    let mut rounds = 0;
    for attempt in 0..policy.attempts {
        rounds += 1;
        let mut closed = false;

        for selector in &selectors.close_buttons {
            match session.click_first_visible(selector, policy.click_timeout).await {
                Ok(true) => {
                    debug!(attempt, %selector, "closed overlay");
                    closed = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => debug!(attempt, %selector, error = %err, "close selector failed"),
            }
        }

        if !closed {
            match session
                .click_button_named(&CLOSE_BUTTON_NAME, policy.click_timeout)
                .await
            {
                Ok(hit) => closed = hit,
                Err(err) => debug!(attempt, error = %err, "close button lookup failed"),
            }
        }

        if !closed {
            if let Err(err) = session.press_escape().await {
                debug!(attempt, error = %err, "escape failed");
            }
        }

        tokio::time::sleep(policy.pause).await;

        match session.element_exists(&selectors.overlay_marker).await {
            Ok(false) => break,
            Ok(true) => {}
            Err(err) => {
                debug!(attempt, error = %err, "overlay check failed");
                break;
            }
        }
    }
    rounds
}

/// Scrolls until the page bottom (as measured after each step) is reached.
pub async fn auto_scroll(
    session: &dyn PageSession,
    policy: &ScrollPolicy,
) -> Result<usize, ScrapeError> {
    let mut scrolled = 0.0;
    let mut steps = 0;
    while steps < policy.max_steps {
        let metrics = session.scroll_by(policy.step_px).await?;
        steps += 1;
        scrolled += f64::from(policy.step_px);
        if scrolled >= metrics.content_height - metrics.viewport_height {
            break;
        }
        tokio::time::sleep(policy.interval).await;
    }
    tokio::time::sleep(policy.settle).await;
    Ok(steps)
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub target_url: String,
    pub max_items: usize,
    pub marker_timeout: Duration,
    pub debug: bool,
    pub overlays: OverlayPolicy,
    pub scroll: ScrollPolicy,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.to_string(),
            max_items: 0,
            marker_timeout: Duration::from_secs(20),
            debug: false,
            overlays: OverlayPolicy::default(),
            scroll: ScrollPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeOutput {
    pub items: Vec<ScrapedItem>,
    pub report: ExtractionReport,
    pub diagnostics: Vec<PathBuf>,
}

/// Drives one page session from navigation to extracted items.
#[derive(Debug, Clone)]
pub struct PageExtractor {
    selectors: SelectorSet,
    settings: ExtractorSettings,
    artifacts: Option<ArtifactStore>,
}

impl PageExtractor {
    pub fn new(selectors: SelectorSet, settings: ExtractorSettings) -> Self {
        Self {
            selectors,
            settings,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn settings(&self) -> &ExtractorSettings {
        &self.settings
    }

    /// Runs one scrape. The session is closed on every exit path.
    pub async fn scrape(&self, launcher: &dyn BrowserLauncher) -> Result<ScrapeOutput, ScrapeError> {
        let session = launcher.launch().await?;
        let outcome = self.drive(session.as_ref()).await;
        if let Err(err) = &outcome {
            warn!(error = %err, "scrape failed");
            if self.settings.debug {
                self.capture_diagnostics(session.as_ref(), "error").await;
            }
        }
        if let Err(err) = session.close().await {
            debug!(error = %err, "closing browser session failed");
        }
        outcome
    }

    async fn drive(&self, session: &dyn PageSession) -> Result<ScrapeOutput, ScrapeError> {
        let config = self.selectors.config();
        session.goto(&self.settings.target_url).await?;
        dismiss_overlays(session, config, &self.settings.overlays).await;

        if !session
            .wait_for_selector(&config.name, self.settings.marker_timeout)
            .await?
        {
            return Err(ScrapeError::MarkersMissing(config.name.clone()));
        }
        dismiss_overlays(session, config, &self.settings.overlays).await;

        let steps = auto_scroll(session, &self.settings.scroll).await?;
        debug!(steps, "scrolled page");
        dismiss_overlays(session, config, &self.settings.overlays).await;

        let html = session.content().await?;
        let extraction = extract_from_html(
            &html,
            &self.selectors,
            DEFAULT_STRATEGIES,
            self.settings.max_items,
        );

        let mut diagnostics = Vec::new();
        if extraction.report.markers_found == 0 && self.settings.debug {
            diagnostics = self.capture_diagnostics(session, "no-items").await;
        }

        info!(
            markers = extraction.report.markers_found,
            extracted = extraction.report.extracted,
            rejected = extraction.report.rejected,
            "extraction finished"
        );
        Ok(ScrapeOutput {
            items: extraction.items,
            report: extraction.report,
            diagnostics,
        })
    }

    async fn capture_diagnostics(&self, session: &dyn PageSession, reason: &str) -> Vec<PathBuf> {
        let Some(store) = &self.artifacts else {
            return Vec::new();
        };
        let captured_at = Utc::now();
        let mut saved = Vec::new();

        match session.screenshot().await {
            Ok(png) => match store.store_bytes(captured_at, "screenshots", "png", &png).await {
                Ok(artifact) => saved.push(artifact.absolute_path),
                Err(err) => debug!(reason, error = %err, "storing screenshot failed"),
            },
            Err(err) => debug!(reason, error = %err, "screenshot failed"),
        }
        match session.content().await {
            Ok(html) => match store
                .store_bytes(captured_at, "snapshots", "html", html.as_bytes())
                .await
            {
                Ok(artifact) => saved.push(artifact.absolute_path),
                Err(err) => debug!(reason, error = %err, "storing page snapshot failed"),
            },
            Err(err) => debug!(reason, error = %err, "page snapshot failed"),
        }

        for path in &saved {
            warn!(reason, path = %path.display(), "saved diagnostics");
        }
        saved
    }
}

/// Replays a saved DOM snapshot. Interaction calls are no-ops.
#[derive(Debug, Clone)]
pub struct StaticPageSession {
    html: String,
}

impl StaticPageSession {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    fn matches(&self, selector: &str) -> Result<bool, ScrapeError> {
        let selector = Selector::parse(selector).map_err(|e| ScrapeError::Browser {
            operation: "select",
            message: e.to_string(),
        })?;
        Ok(Html::parse_document(&self.html)
            .select(&selector)
            .next()
            .is_some())
    }
}

#[async_trait]
impl PageSession for StaticPageSession {
    async fn goto(&self, _url: &str) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, ScrapeError> {
        self.matches(selector)
    }

    async fn click_first_visible(
        &self,
        _selector: &str,
        _timeout: Duration,
    ) -> Result<bool, ScrapeError> {
        Ok(false)
    }

    async fn click_button_named(
        &self,
        _name: &Regex,
        _timeout: Duration,
    ) -> Result<bool, ScrapeError> {
        Ok(false)
    }

    async fn press_escape(&self) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn element_exists(&self, selector: &str) -> Result<bool, ScrapeError> {
        self.matches(selector)
    }

    async fn scroll_by(&self, _px: u32) -> Result<ScrollMetrics, ScrapeError> {
        Ok(ScrollMetrics::default())
    }

    async fn content(&self) -> Result<String, ScrapeError> {
        Ok(self.html.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ScrapeError> {
        Err(ScrapeError::Unsupported("screenshot"))
    }

    async fn close(&self) -> Result<(), ScrapeError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StaticLauncher {
    html: String,
}

impl StaticLauncher {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    pub async fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(tokio::fs::read_to_string(path).await?))
    }
}

#[async_trait]
impl BrowserLauncher for StaticLauncher {
    async fn launch(&self) -> Result<Box<dyn PageSession>, ScrapeError> {
        Ok(Box::new(StaticPageSession::new(self.html.clone())))
    }
}

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    pub headless: bool,
    pub operation_timeout: Duration,
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn PageSession>, ScrapeError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .request_timeout(self.operation_timeout);
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(ScrapeError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler.abort();
                return Err(ScrapeError::Launch(err.to_string()));
            }
        };

        Ok(Box::new(ChromiumSession {
            browser: Mutex::new(Some(browser)),
            page,
            handler,
            timeout: self.operation_timeout,
        }))
    }
}

pub struct ChromiumSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler: JoinHandle<()>,
    timeout: Duration,
}

impl ChromiumSession {
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ScrapeError>
    where
        F: Future<Output = Result<T, CdpError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ScrapeError::Browser {
                operation,
                message: err.to_string(),
            }),
            Err(_) => Err(ScrapeError::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }

    async fn is_visible(&self, element: &Element) -> bool {
        const VISIBLE_JS: &str = "function() { const r = this.getBoundingClientRect(); \
             const s = window.getComputedStyle(this); \
             return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none'; }";
        match element.call_js_fn(VISIBLE_JS, false).await {
            Ok(ret) => ret
                .result
                .value
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn click_within(&self, element: &Element, timeout: Duration) -> Result<(), ScrapeError> {
        match tokio::time::timeout(timeout, element.click()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(ScrapeError::Browser {
                operation: "click",
                message: err.to_string(),
            }),
            Err(_) => Err(ScrapeError::Timeout {
                operation: "click",
                timeout,
            }),
        }
    }
}

#[async_trait]
impl PageSession for ChromiumSession {
    async fn goto(&self, url: &str) -> Result<(), ScrapeError> {
        let navigate = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, CdpError>(())
        };
        self.bounded("navigation", navigate)
            .await
            .map_err(|err| ScrapeError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            })
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, ScrapeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn click_first_visible(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, ScrapeError> {
        let elements = self
            .bounded("find elements", self.page.find_elements(selector))
            .await?;
        for element in &elements {
            if self.is_visible(element).await {
                self.click_within(element, timeout).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn click_button_named(
        &self,
        name: &Regex,
        timeout: Duration,
    ) -> Result<bool, ScrapeError> {
        let buttons = self
            .bounded("find buttons", self.page.find_elements("button, [role=\"button\"]"))
            .await?;
        for button in &buttons {
            let label = match button.attribute("aria-label").await {
                Ok(Some(label)) if !label.trim().is_empty() => label,
                _ => button.inner_text().await.ok().flatten().unwrap_or_default(),
            };
            if name.is_match(label.trim()) && self.is_visible(button).await {
                self.click_within(button, timeout).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn press_escape(&self) -> Result<(), ScrapeError> {
        let body = self.bounded("find body", self.page.find_element("body")).await?;
        self.bounded("press escape", async { body.press_key("Escape").await.map(|_| ()) })
            .await
    }

    async fn element_exists(&self, selector: &str) -> Result<bool, ScrapeError> {
        let found = self
            .bounded("find elements", self.page.find_elements(selector))
            .await?;
        Ok(!found.is_empty())
    }

    async fn scroll_by(&self, px: u32) -> Result<ScrollMetrics, ScrapeError> {
        let script = format!(
            "(() => {{ window.scrollBy(0, {px}); \
             return [document.body.scrollHeight, window.innerHeight]; }})()"
        );
        let result = self.bounded("scroll", self.page.evaluate(script)).await?;
        let [content_height, viewport_height] =
            result
                .into_value::<[f64; 2]>()
                .map_err(|e| ScrapeError::Browser {
                    operation: "scroll",
                    message: e.to_string(),
                })?;
        Ok(ScrollMetrics {
            content_height,
            viewport_height,
        })
    }

    async fn content(&self) -> Result<String, ScrapeError> {
        self.bounded("read content", self.page.content()).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ScrapeError> {
        let params = ScreenshotParams::builder().full_page(true).build();
        self.bounded("screenshot", self.page.screenshot(params)).await
    }

    async fn close(&self) -> Result<(), ScrapeError> {
        let mut result = Ok(());
        if let Err(err) = self.page.clone().close().await {
            debug!(error = %err, "closing page failed");
        }
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(err) = browser.close().await {
                result = Err(ScrapeError::Browser {
                    operation: "close",
                    message: err.to_string(),
                });
            }
            let _ = browser.wait().await;
        }
        self.handler.abort();
        result
    }
}
