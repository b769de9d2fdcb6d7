use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use chrono::Utc;
use classcatch_core::{Channel, ProxyAddr};
use futures::StreamExt;
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info_span, warn, Instrument};

use crate::{ChannelError, FetchedPage, TimetableSite, RESULTS_TABLE_MARKER};

const SUBJECT_SEARCH_SELECTOR: &str = "input[value='Subject Area(s)']";
const SUBMIT_SELECTOR: &str = "input[value='Search for Courses']";
const RESULTS_SELECTOR: &str = "div.data-table table";
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// How long to keep scrolling a lazily rendered results page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollPolicy {
    pub interval: Duration,
    pub max_iterations: u32,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_iterations: 60,
        }
    }
}

/// Repeats `probe` (scroll, then report document height) until two
/// consecutive heights match. Returns `false` when the iteration cap is hit.
pub async fn settle_height<F, Fut>(mut probe: F, policy: ScrollPolicy) -> Result<bool, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<i64, ChannelError>>,
{
    let mut last = probe().await?;
    for _ in 0..policy.max_iterations {
        sleep(policy.interval).await;
        let height = probe().await?;
        if height == last {
            return Ok(true);
        }
        last = height;
    }
    Ok(false)
}

/// Headless Chromium channel. Each fetch launches a fresh browser bound to
/// at most one proxy and tears it down afterwards.
#[derive(Debug, Clone)]
pub struct BrowserChannel {
    site: TimetableSite,
    chrome_path: Option<PathBuf>,
    page_load_timeout: Duration,
    element_timeout: Duration,
    scroll: ScrollPolicy,
}

impl BrowserChannel {
    pub fn new(site: TimetableSite, page_load_timeout: Duration) -> Self {
        Self {
            site,
            chrome_path: None,
            page_load_timeout,
            element_timeout: Duration::from_secs(10),
            scroll: ScrollPolicy::default(),
        }
    }

    pub fn with_chrome_path(mut self, path: Option<PathBuf>) -> Self {
        self.chrome_path = path;
        self
    }

    pub fn with_scroll_policy(mut self, scroll: ScrollPolicy) -> Self {
        self.scroll = scroll;
        self
    }

    /// Drives the search form end to end and returns the rendered results.
    pub async fn fetch(&self, proxy: Option<ProxyAddr>) -> Result<FetchedPage, ChannelError> {
        let span = info_span!(
            "browser_fetch",
            proxy = %proxy.map(|p| p.to_string()).unwrap_or_else(|| "direct".into()),
            term = %self.site.term
        );
        async {
            let markup = self
                .with_browser(proxy, |page| self.run_search(page))
                .await?;
            if !markup.contains(RESULTS_TABLE_MARKER) {
                return Err(ChannelError::MissingMarker);
            }
            Ok(FetchedPage {
                channel: Channel::Browser,
                proxy,
                markup,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }

    /// Loads the landing page through `proxy` and checks the search form rendered.
    pub async fn probe_landing(&self, proxy: ProxyAddr) -> Result<(), ChannelError> {
        self.with_browser(Some(proxy), |page| async move {
            wait_for_selector(&page, SUBJECT_SEARCH_SELECTOR, self.element_timeout).await
        })
        .await
    }

    fn config(&self, proxy: Option<ProxyAddr>, profile: &Path) -> Result<BrowserConfig, ChannelError> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--ignore-certificate-errors")
            .request_timeout(self.page_load_timeout);
        if let Some(addr) = proxy {
            builder = builder.arg(format!("--proxy-server={}", addr.proxy_url()));
        }
        if let Some(path) = &self.chrome_path {
            builder = builder.chrome_executable(path);
        }
        builder.build().map_err(ChannelError::Browser)
    }

    async fn with_browser<T, F, Fut>(&self, proxy: Option<ProxyAddr>, work: F) -> Result<T, ChannelError>
    where
        F: FnOnce(Page) -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        // Concurrent launches sharing a profile collide on Chromium's singleton lock.
        let profile = launch_profile()?;
        let (mut browser, mut handler) = Browser::launch(self.config(proxy, profile.path())?)
            .await
            .map_err(|e| ChannelError::Browser(format!("launch failed: {e}")))?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        let landing = self.site.landing_url();
        let outcome = match timeout(self.page_load_timeout, browser.new_page(landing.as_str())).await {
            Ok(Ok(page)) => work(page).await,
            Ok(Err(e)) => Err(ChannelError::Browser(format!("loading {landing}: {e}"))),
            Err(_) => Err(ChannelError::Timeout(self.page_load_timeout)),
        };

        if let Err(e) = browser.close().await {
            debug!(error = %e, "browser close failed");
        }
        let _ = browser.wait().await;
        events.abort();
        if let Err(e) = profile.close() {
            debug!(error = %e, "removing browser profile failed");
        }
        outcome
    }

    async fn run_search(&self, page: Page) -> Result<String, ChannelError> {
        wait_for_selector(&page, SUBJECT_SEARCH_SELECTOR, self.element_timeout).await?;
        click(&page, SUBJECT_SEARCH_SELECTOR).await?;

        let tick_term = format!(
            "(() => {{ const box = document.querySelector(\"input[value='{}']\"); \
             if (!box) return false; if (!box.checked) box.click(); return true; }})()",
            self.site.term
        );
        let ticked: bool = page
            .evaluate(tick_term.as_str())
            .await
            .map_err(|e| ChannelError::Browser(format!("selecting term: {e}")))?
            .into_value()
            .map_err(|e| ChannelError::Browser(format!("term checkbox result: {e}")))?;
        if !ticked {
            return Err(ChannelError::Browser(format!(
                "term {} not offered by search form",
                self.site.term
            )));
        }

        wait_for_selector(&page, SUBMIT_SELECTOR, self.element_timeout).await?;
        click(&page, SUBMIT_SELECTOR).await?;
        wait_for_selector(&page, RESULTS_SELECTOR, self.page_load_timeout).await?;

        let settled = settle_height(|| scroll_to_bottom(&page), self.scroll).await?;
        if !settled {
            warn!(
                max_iterations = self.scroll.max_iterations,
                "results page height never settled; using current content"
            );
        }

        page.content()
            .await
            .map_err(|e| ChannelError::Browser(format!("reading page content: {e}")))
    }
}

/// Fresh Chromium profile directory, removed when the guard is closed or dropped.
fn launch_profile() -> Result<TempDir, ChannelError> {
    tempfile::Builder::new()
        .prefix("classcatch-chromium-")
        .tempdir()
        .map_err(|e| ChannelError::Browser(format!("creating profile dir: {e}")))
}

async fn wait_for_selector(page: &Page, selector: &str, limit: Duration) -> Result<(), ChannelError> {
    let deadline = Instant::now() + limit;
    loop {
        if page.find_element(selector).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ChannelError::Timeout(limit));
        }
        sleep(SELECTOR_POLL).await;
    }
}

async fn click(page: &Page, selector: &str) -> Result<(), ChannelError> {
    let element = page
        .find_element(selector)
        .await
        .map_err(|e| ChannelError::Browser(format!("finding {selector}: {e}")))?;
    element
        .click()
        .await
        .map_err(|e| ChannelError::Browser(format!("clicking {selector}: {e}")))?;
    Ok(())
}

async fn scroll_to_bottom(page: &Page) -> Result<i64, ChannelError> {
    page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
        .await
        .map_err(|e| ChannelError::Browser(format!("scrolling: {e}")))?;
    page.evaluate("document.body.scrollHeight")
        .await
        .map_err(|e| ChannelError::Browser(format!("reading scroll height: {e}")))?
        .into_value::<i64>()
        .map_err(|e| ChannelError::Browser(format!("scroll height: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_iterations: u32) -> ScrollPolicy {
        ScrollPolicy {
            interval: Duration::ZERO,
            max_iterations,
        }
    }

    #[tokio::test]
    async fn height_settles_once_two_readings_match() {
        let heights = [800, 1600, 2400, 2400, 9999];
        let calls = Cell::new(0usize);
        let settled = settle_height(
            || {
                let idx = calls.get();
                calls.set(idx + 1);
                async move { Ok(heights[idx]) }
            },
            fast(60),
        )
        .await
        .unwrap();
        assert!(settled);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn endless_growth_stops_at_the_cap() {
        let calls = Cell::new(0i64);
        let settled = settle_height(
            || {
                let n = calls.get();
                calls.set(n + 1);
                async move { Ok(n * 100) }
            },
            fast(5),
        )
        .await
        .unwrap();
        assert!(!settled);
        assert_eq!(calls.get(), 6);
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let err = settle_height(
            || async { Err::<i64, _>(ChannelError::Browser("page closed".into())) },
            fast(3),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ChannelError::Browser("page closed".into()));
    }

    #[test]
    fn every_launch_gets_its_own_profile_dir() {
        let channel = BrowserChannel::new(
            TimetableSite::new("https://timetable.example", "202501"),
            Duration::from_secs(30),
        )
        .with_chrome_path(Some(PathBuf::from("/usr/bin/chromium")));

        let first = launch_profile().unwrap();
        let second = launch_profile().unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().is_dir());
        assert!(second.path().is_dir());

        let proxy: ProxyAddr = "1.2.3.4:80".parse().unwrap();
        assert!(channel.config(Some(proxy), first.path()).is_ok());
        assert!(channel.config(None, second.path()).is_ok());

        let removed = first.path().to_path_buf();
        first.close().unwrap();
        assert!(!removed.exists());
    }

    #[tokio::test]
    #[ignore = "needs a local Chromium and network access"]
    async fn live_search_returns_results_table() {
        let site = TimetableSite::new("https://oracle-www.dartmouth.edu/dart/groucho", "202501");
        let channel = BrowserChannel::new(site, Duration::from_secs(60));
        let page = channel.fetch(None).await.unwrap();
        assert!(crate::parse_timetable(&page.markup).is_ok());
    }
}
