use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use classcatch_adapters::{BrowserChannel, RequestsChannel};
use classcatch_core::{Channel, ChannelVerdict, ProxyAddr, ProxyCandidate};
use classcatch_storage::{
    build_client, classify_status, random_user_agent, HttpClientConfig, ProxyStore, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

/// Network checks the funnel runs against each proxy.
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    /// Stage 1: can the proxy reach a neutral endpoint at all.
    async fn liveness(&self, addr: ProxyAddr) -> bool;

    /// Stage 2: can the proxy reach the timetable site over `channel`.
    async fn fitness(&self, channel: Channel, addr: ProxyAddr) -> bool;
}

#[derive(Debug, Clone)]
pub struct HttpProxyProbe {
    liveness_url: String,
    timeout: Duration,
    requests: RequestsChannel,
    browser: BrowserChannel,
}

impl HttpProxyProbe {
    pub fn new(
        liveness_url: impl Into<String>,
        timeout: Duration,
        requests: RequestsChannel,
        browser: BrowserChannel,
    ) -> Self {
        Self {
            liveness_url: liveness_url.into(),
            timeout,
            requests: requests.with_timeout(timeout),
            browser,
        }
    }
}

#[async_trait]
impl ProxyProbe for HttpProxyProbe {
    async fn liveness(&self, addr: ProxyAddr) -> bool {
        let config = HttpClientConfig {
            user_agent: Some(random_user_agent().to_string()),
            ..HttpClientConfig::through(Some(addr), self.timeout)
        };
        let client = match build_client(&config) {
            Ok(client) => client,
            Err(err) => {
                warn!(proxy = %addr, error = %err, "could not build proxied client");
                return false;
            }
        };
        match client.get(&self.liveness_url).send().await {
            Ok(response) => classify_status(response.status()).is_none(),
            Err(err) => {
                debug!(proxy = %addr, error = %err, "liveness check failed");
                false
            }
        }
    }

    async fn fitness(&self, channel: Channel, addr: ProxyAddr) -> bool {
        let result = match channel {
            Channel::Requests => self.requests.fetch(Some(addr)).await.map(|_| ()),
            Channel::Browser => self.browser.probe_landing(addr).await,
        };
        if let Err(err) = &result {
            debug!(proxy = %addr, %channel, error = %err, "fitness check failed");
        }
        result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunnelConfig {
    pub liveness_workers: usize,
    pub fitness_workers: usize,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            liveness_workers: 10,
            fitness_workers: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelTally {
    pub working: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FunnelReport {
    pub checked: usize,
    pub stage1_passed: usize,
    pub requests: ChannelTally,
    pub browser: ChannelTally,
    pub candidates: Vec<ProxyCandidate>,
}

impl FunnelReport {
    pub fn tally(&self, channel: Channel) -> ChannelTally {
        match channel {
            Channel::Requests => self.requests,
            Channel::Browser => self.browser,
        }
    }
}

#[derive(Debug, Error)]
pub enum FunnelError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("verification worker aborted: {0}")]
    Worker(#[from] JoinError),
}

/// State owned by a single funnel run.
struct FunnelRun {
    candidates: Vec<ProxyCandidate>,
    survivors: Arc<Mutex<Vec<ProxyAddr>>>,
}

/// Liveness first, then per-channel fitness on the survivors; every stage-2
/// outcome is written to the proxy store.
#[derive(Clone)]
pub struct VerificationFunnel {
    probe: Arc<dyn ProxyProbe>,
    store: Arc<dyn ProxyStore>,
    config: FunnelConfig,
}

impl VerificationFunnel {
    pub fn new(probe: Arc<dyn ProxyProbe>, store: Arc<dyn ProxyStore>, config: FunnelConfig) -> Self {
        Self {
            probe,
            store,
            config,
        }
    }

    pub async fn run(&self, candidates: Vec<ProxyCandidate>) -> Result<FunnelReport, FunnelError> {
        let mut run = FunnelRun {
            candidates,
            survivors: Arc::new(Mutex::new(Vec::new())),
        };
        let span = info_span!("verification_funnel", candidates = run.candidates.len());
        async move {
            self.liveness_stage(&run).await?;

            let mut survivors = run.survivors.lock().await.clone();
            survivors.sort();
            for candidate in &mut run.candidates {
                candidate.stage1_passed = survivors.contains(&candidate.addr);
            }
            info!(survivors = survivors.len(), "liveness stage finished");

            let (requests, browser) = tokio::join!(
                self.fitness_stage(Channel::Requests, &survivors),
                self.fitness_stage(Channel::Browser, &survivors),
            );
            let report = FunnelReport {
                checked: run.candidates.len(),
                stage1_passed: survivors.len(),
                requests: requests?,
                browser: browser?,
                candidates: run.candidates,
            };
            info!(
                requests_working = report.requests.working,
                browser_working = report.browser.working,
                "fitness stage finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn liveness_stage(&self, run: &FunnelRun) -> Result<(), FunnelError> {
        let permits = Arc::new(Semaphore::new(self.config.liveness_workers.max(1)));
        let mut workers = JoinSet::new();
        for candidate in &run.candidates {
            let addr = candidate.addr;
            let probe = Arc::clone(&self.probe);
            let survivors = Arc::clone(&run.survivors);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if probe.liveness(addr).await {
                    survivors.lock().await.push(addr);
                } else {
                    debug!(proxy = %addr, "dropped at liveness");
                }
            });
        }
        while let Some(joined) = workers.join_next().await {
            joined?;
        }
        Ok(())
    }

    async fn fitness_stage(
        &self,
        channel: Channel,
        survivors: &[ProxyAddr],
    ) -> Result<ChannelTally, FunnelError> {
        let permits = Arc::new(Semaphore::new(self.config.fitness_workers.max(1)));
        let mut workers = JoinSet::new();
        for &addr in survivors {
            let probe = Arc::clone(&self.probe);
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let verdict = if probe.fitness(channel, addr).await {
                    ChannelVerdict::Working(Utc::now())
                } else {
                    ChannelVerdict::Failed
                };
                store.record_verdict(addr, channel, verdict).await?;
                Ok::<bool, StoreError>(matches!(verdict, ChannelVerdict::Working(_)))
            });
        }

        let mut tally = ChannelTally::default();
        while let Some(joined) = workers.join_next().await {
            if joined?? {
                tally.working += 1;
            } else {
                tally.failed += 1;
            }
        }
        Ok(tally)
    }
}
