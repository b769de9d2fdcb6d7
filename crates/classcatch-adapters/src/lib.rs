//! Timetable-site access: the two fetch channels and the results-table parser.

mod browser;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classcatch_core::{Channel, ProxyAddr, ScrapedRow};
use classcatch_storage::{
    build_client, classify_reqwest_error, classify_status, random_user_agent, FailureKind,
    HttpClientConfig,
};
use reqwest::header::REFERER;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub use browser::{settle_height, BrowserChannel, ScrollPolicy};

pub const CRATE_NAME: &str = "classcatch-adapters";

/// Substring every genuine results page carries.
pub const RESULTS_TABLE_MARKER: &str = "data-table";

const RESULTS_TABLE_SELECTOR: &str = "div.data-table table";

/// Endpoints and search parameters of the timetable site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableSite {
    pub base_url: String,
    pub term: String,
}

impl TimetableSite {
    pub fn new(base_url: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            term: term.into(),
        }
    }

    pub fn landing_url(&self) -> String {
        format!("{}/timetable.main", self.base_url)
    }

    pub fn search_url(&self) -> String {
        format!("{}/timetable.display_courses", self.base_url)
    }

    pub fn referer_url(&self) -> String {
        format!("{}/timetable.subject_search", self.base_url)
    }

    /// Subject-area search over every department, distributive, period and delivery mode.
    pub fn search_form(&self) -> Vec<(&'static str, String)> {
        let fixed = [
            ("distribradio", "alldistribs"),
            ("depts", "no_value"),
            ("periods", "no_value"),
            ("distribs", "no_value"),
            ("distribs_i", "no_value"),
            ("distribs_wc", "no_value"),
            ("distribs_lang", "no_value"),
            ("deliveryradio", "alldelivery"),
            ("deliverymodes", "no_value"),
            ("pmode", "public"),
            ("term", ""),
            ("levl", ""),
            ("fys", "n"),
            ("wrt", "n"),
            ("pe", "n"),
            ("review", "n"),
            ("crnl", "no_value"),
            ("classyear", "2008"),
            ("searchtype", "Subject Area(s)"),
            ("termradio", "selectterms"),
            ("subjectradio", "selectsubjects"),
            ("hoursradio", "allhours"),
            ("sortorder", "dept"),
        ];
        let mut form: Vec<(&'static str, String)> =
            fixed.iter().map(|(k, v)| (*k, v.to_string())).collect();
        form.push(("terms", self.term.clone()));
        form
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub channel: Channel,
    pub proxy: Option<ProxyAddr>,
    pub markup: String,
    pub fetched_at: DateTime<Utc>,
}

/// Why one fetch attempt did not produce a usable page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("{kind:?} failure: {message}")]
    Transport { kind: FailureKind, message: String },
    #[error("http status {0}")]
    Status(u16),
    #[error("results table marker missing from response")]
    MissingMarker,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("browser: {0}")]
    Browser(String),
}

impl ChannelError {
    fn transport(err: reqwest::Error) -> Self {
        ChannelError::Transport {
            kind: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }
}

/// Strategy seam between the orchestrator and the concrete channels.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        channel: Channel,
        proxy: Option<ProxyAddr>,
    ) -> Result<FetchedPage, ChannelError>;
}

/// Plain HTTP channel: a single form POST against the search endpoint.
#[derive(Debug, Clone)]
pub struct RequestsChannel {
    site: TimetableSite,
    timeout: Duration,
}

impl RequestsChannel {
    pub fn new(site: TimetableSite, timeout: Duration) -> Self {
        Self { site, timeout }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            site: self.site.clone(),
            timeout,
        }
    }

    pub async fn fetch(&self, proxy: Option<ProxyAddr>) -> Result<FetchedPage, ChannelError> {
        let span = info_span!(
            "requests_fetch",
            proxy = %proxy.map(|p| p.to_string()).unwrap_or_else(|| "direct".into()),
            term = %self.site.term
        );
        self.post_search(proxy).instrument(span).await
    }

    async fn post_search(&self, proxy: Option<ProxyAddr>) -> Result<FetchedPage, ChannelError> {
        let config = HttpClientConfig {
            user_agent: Some(random_user_agent().to_string()),
            ..HttpClientConfig::through(proxy, self.timeout)
        };
        let client = build_client(&config).map_err(ChannelError::transport)?;

        let response = client
            .post(self.site.search_url())
            .header(REFERER, self.site.referer_url())
            .form(&self.site.search_form())
            .send()
            .await
            .map_err(ChannelError::transport)?;

        let status = response.status();
        if classify_status(status).is_some() {
            return Err(ChannelError::Status(status.as_u16()));
        }

        let markup = response.text().await.map_err(ChannelError::transport)?;
        if !markup.contains(RESULTS_TABLE_MARKER) {
            return Err(ChannelError::MissingMarker);
        }
        debug!(bytes = markup.len(), "search response accepted");

        Ok(FetchedPage {
            channel: Channel::Requests,
            proxy,
            markup,
            fetched_at: Utc::now(),
        })
    }
}

/// Production fetcher dispatching to the requests or browser channel.
#[derive(Debug, Clone)]
pub struct TimetableFetcher {
    requests: RequestsChannel,
    browser: BrowserChannel,
}

impl TimetableFetcher {
    pub fn new(requests: RequestsChannel, browser: BrowserChannel) -> Self {
        Self { requests, browser }
    }
}

#[async_trait]
impl PageFetcher for TimetableFetcher {
    async fn fetch(
        &self,
        channel: Channel,
        proxy: Option<ProxyAddr>,
    ) -> Result<FetchedPage, ChannelError> {
        match channel {
            Channel::Requests => self.requests.fetch(proxy).await,
            Channel::Browser => self.browser.fetch(proxy).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("results table not found (selector `{0}`)")]
    TableMissing(&'static str),
    #[error("results table has no header cells")]
    HeaderMissing,
    #[error("invalid selector `{0}`: {1}")]
    Selector(&'static str, String),
}

fn selector(css: &'static str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(css, e.to_string()))
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn count_or_zero(value: &str) -> i32 {
    value.trim().parse().unwrap_or(0)
}

/// Reads the results table into rows, resolving columns by header name.
///
/// Separator rows (any cell with `colspan`) are dropped. A page without the
/// results table is an error rather than an empty result: it means the site
/// changed shape.
pub fn parse_timetable(markup: &str) -> Result<Vec<ScrapedRow>, ParseError> {
    let document = Html::parse_document(markup);
    let table_sel = selector(RESULTS_TABLE_SELECTOR)?;
    let tr_sel = selector("tr")?;
    let th_sel = selector("th")?;
    let td_sel = selector("td")?;

    let table = document
        .select(&table_sel)
        .next()
        .ok_or(ParseError::TableMissing(RESULTS_TABLE_SELECTOR))?;

    let mut rows = table.select(&tr_sel);
    let header_row = rows.next().ok_or(ParseError::HeaderMissing)?;
    let columns: HashMap<String, usize> = header_row
        .select(&th_sel)
        .enumerate()
        .map(|(idx, cell)| (cell_text(&cell), idx))
        .collect();
    if columns.is_empty() {
        return Err(ParseError::HeaderMissing);
    }

    let mut parsed = Vec::new();
    for row in rows {
        let cells: Vec<ElementRef<'_>> = row.select(&td_sel).collect();
        if cells.is_empty() || cells.iter().any(|c| c.value().attr("colspan").is_some()) {
            continue;
        }
        let texts: Vec<String> = cells.iter().map(cell_text).collect();
        let col = |name: &str| {
            columns
                .get(name)
                .and_then(|&idx| texts.get(idx))
                .cloned()
                .unwrap_or_default()
        };

        parsed.push(ScrapedRow {
            subject_code: col("Subj"),
            course_number: col("Num"),
            section: col("Sec"),
            title: col("Title"),
            instructor: col("Instructor"),
            term: col("Term"),
            limit: count_or_zero(&col("Lim")),
            enrollment: count_or_zero(&col("Enrl")),
            distrib: col("Dist"),
            world_culture: col("WC"),
            lang_req: col("Lang Req"),
            period: col("Period"),
            period_code: col("Period Code"),
            status: col("Status"),
            text: col("Text"),
            xlist: col("Xlist"),
            crn: col("CRN"),
        });
    }

    Ok(parsed)
}
