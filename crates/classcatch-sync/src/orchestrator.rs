use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use classcatch_adapters::{FetchedPage, PageFetcher};
use classcatch_core::{Channel, ChannelVerdict, ProxyAddr, ProxyRecord};
use classcatch_storage::{ProxyStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};

/// One fetch attempt: a channel, optionally routed through a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Strategy {
    pub channel: Channel,
    pub proxy: Option<ProxyAddr>,
}

impl Strategy {
    pub fn via(channel: Channel, proxy: ProxyAddr) -> Self {
        Self {
            channel,
            proxy: Some(proxy),
        }
    }

    pub fn direct(channel: Channel) -> Self {
        Self {
            channel,
            proxy: None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy {
            Some(addr) => write!(f, "{} via {}", self.channel, addr),
            None => write!(f, "{} direct", self.channel),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Fetched,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct Acquisition {
    pub page: Option<FetchedPage>,
    pub winner: Option<Strategy>,
    pub attempts: Vec<AttemptRecord>,
}

/// Picks one channel per proxy that has at least one fresh working channel.
///
/// Proxies are ordered by their most recent verification, newest first, with
/// ties broken by address. Requests wins when it is at least as fresh as the
/// browser channel.
pub fn plan_candidates(records: &[ProxyRecord], now: DateTime<Utc>, window: Duration) -> Vec<Strategy> {
    let mut usable: Vec<&ProxyRecord> = records
        .iter()
        .filter(|r| r.has_fresh_channel(now, window))
        .collect();
    usable.sort_by(|a, b| match b.latest_verification().cmp(&a.latest_verification()) {
        Ordering::Equal => a.addr.cmp(&b.addr),
        other => other,
    });

    usable
        .into_iter()
        .filter_map(|record| {
            let requests_fresh = record.requests.is_fresh(now, window);
            let browser_fresh = record.browser.is_fresh(now, window);
            let requests_preferred = requests_fresh
                && (!browser_fresh || record.requests.last_verified >= record.browser.last_verified);
            if requests_preferred {
                Some(Strategy::via(Channel::Requests, record.addr))
            } else if browser_fresh {
                Some(Strategy::via(Channel::Browser, record.addr))
            } else {
                None
            }
        })
        .collect()
}

/// Walks the proxy candidates, then the direct channels, until one fetch succeeds.
#[derive(Clone)]
pub struct ScrapeOrchestrator {
    fetcher: Arc<dyn PageFetcher>,
    proxies: Arc<dyn ProxyStore>,
    window: Duration,
}

impl ScrapeOrchestrator {
    pub fn new(fetcher: Arc<dyn PageFetcher>, proxies: Arc<dyn ProxyStore>, window: Duration) -> Self {
        Self {
            fetcher,
            proxies,
            window,
        }
    }

    pub async fn plan(&self, now: DateTime<Utc>) -> Result<Vec<Strategy>, StoreError> {
        let records = self.proxies.proxies().await?;
        let mut strategies = plan_candidates(&records, now, self.window);
        strategies.push(Strategy::direct(Channel::Requests));
        strategies.push(Strategy::direct(Channel::Browser));
        Ok(strategies)
    }

    /// Only store failures are errors; an exhausted chain is an `Acquisition` without a page.
    pub async fn acquire(&self, now: DateTime<Utc>) -> Result<Acquisition, StoreError> {
        let strategies = self.plan(now).await?;
        info!(strategies = strategies.len(), "scrape strategies planned");

        let mut acquisition = Acquisition::default();
        for strategy in strategies {
            match self.fetcher.fetch(strategy.channel, strategy.proxy).await {
                Ok(page) => {
                    info!(%strategy, bytes = page.markup.len(), "page fetched");
                    acquisition.attempts.push(AttemptRecord {
                        strategy,
                        outcome: AttemptOutcome::Fetched,
                    });
                    acquisition.winner = Some(strategy);
                    acquisition.page = Some(page);
                    return Ok(acquisition);
                }
                Err(err) => {
                    warn!(%strategy, error = %err, "fetch attempt failed");
                    if let Some(addr) = strategy.proxy {
                        self.proxies
                            .record_verdict(addr, strategy.channel, ChannelVerdict::Failed)
                            .await?;
                    }
                    acquisition.attempts.push(AttemptRecord {
                        strategy,
                        outcome: AttemptOutcome::Failed {
                            error: err.to_string(),
                        },
                    });
                }
            }
        }
        warn!(attempts = acquisition.attempts.len(), "every scrape strategy failed");
        Ok(acquisition)
    }
}
