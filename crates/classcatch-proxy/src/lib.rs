//! Proxy acquisition from the public listing service and the two-stage verification funnel.

mod funnel;

use std::collections::HashSet;
use std::time::Duration;

use classcatch_core::{ProxyAddr, ProxyCandidate};
use classcatch_storage::{build_client, classify_status, HttpClientConfig};
use tracing::{info, info_span, warn, Instrument};

pub use funnel::{
    ChannelTally, FunnelConfig, FunnelError, FunnelReport, HttpProxyProbe, ProxyProbe,
    VerificationFunnel,
};

pub const CRATE_NAME: &str = "classcatch-proxy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslTier {
    Yes,
    No,
    All,
}

impl SslTier {
    pub fn as_str(self) -> &'static str {
        match self {
            SslTier::Yes => "yes",
            SslTier::No => "no",
            SslTier::All => "all",
        }
    }

    /// Tiers tried in order when the previous one came back empty.
    pub fn escalation(self) -> &'static [SslTier] {
        match self {
            SslTier::Yes => &[SslTier::Yes, SslTier::No, SslTier::All],
            SslTier::No => &[SslTier::No, SslTier::All],
            SslTier::All => &[SslTier::All],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyListQuery {
    pub limit: usize,
    pub protocol: String,
    pub timeout_ms: u64,
    pub country: String,
    pub ssl: SslTier,
    pub anonymity: String,
}

impl Default for ProxyListQuery {
    fn default() -> Self {
        Self {
            limit: 5,
            protocol: "http".to_string(),
            timeout_ms: 10_000,
            country: "all".to_string(),
            ssl: SslTier::Yes,
            anonymity: "elite".to_string(),
        }
    }
}

impl ProxyListQuery {
    fn params(&self, ssl: SslTier) -> Vec<(&'static str, String)> {
        vec![
            ("request", "getproxies".to_string()),
            ("protocol", self.protocol.clone()),
            ("timeout", self.timeout_ms.to_string()),
            ("country", self.country.clone()),
            ("ssl", ssl.as_str().to_string()),
            ("anonymity", self.anonymity.clone()),
        ]
    }
}

/// Keeps well-formed `ip:port` lines, first occurrence wins, up to `limit`.
pub fn parse_listing(body: &str, limit: usize) -> Vec<ProxyCandidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for line in body.lines() {
        if candidates.len() >= limit {
            break;
        }
        let Ok(addr) = line.parse::<ProxyAddr>() else {
            continue;
        };
        if seen.insert(addr) {
            candidates.push(ProxyCandidate::new(addr));
        }
    }
    candidates
}

/// Client for the free proxy-listing service.
#[derive(Debug, Clone)]
pub struct ProxyPool {
    client: reqwest::Client,
    listing_url: String,
}

impl ProxyPool {
    pub fn new(listing_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = build_client(&HttpClientConfig::through(None, timeout))?;
        Ok(Self::with_client(client, listing_url))
    }

    pub fn with_client(client: reqwest::Client, listing_url: impl Into<String>) -> Self {
        Self {
            client,
            listing_url: listing_url.into(),
        }
    }

    /// Never fails: transport errors and non-200 responses are logged and yield no candidates.
    pub async fn fetch(&self, query: &ProxyListQuery) -> Vec<ProxyCandidate> {
        for &tier in query.ssl.escalation() {
            let span = info_span!("proxy_listing", ssl = tier.as_str(), limit = query.limit);
            let Some(body) = self.fetch_tier(query, tier).instrument(span).await else {
                return Vec::new();
            };
            let candidates = parse_listing(&body, query.limit);
            if !candidates.is_empty() {
                info!(ssl = tier.as_str(), count = candidates.len(), "proxy candidates fetched");
                return candidates;
            }
            warn!(ssl = tier.as_str(), "proxy listing empty");
        }
        Vec::new()
    }

    async fn fetch_tier(&self, query: &ProxyListQuery, tier: SslTier) -> Option<String> {
        let response = match self
            .client
            .get(&self.listing_url)
            .query(&query.params(tier))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "proxy listing request failed");
                return None;
            }
        };
        if let Some(kind) = classify_status(response.status()) {
            warn!(?kind, status = response.status().as_u16(), "proxy listing rejected");
            return None;
        }
        match response.text().await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(error = %err, "proxy listing body unreadable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool(server: &MockServer) -> ProxyPool {
        ProxyPool::new(format!("{}/v2/", server.uri()), Duration::from_secs(5)).unwrap()
    }

    async fn mount_tier(server: &MockServer, ssl: &str, body: &str, hits: u64) {
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .and(query_param("request", "getproxies"))
            .and(query_param("ssl", ssl))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(hits)
            .mount(server)
            .await;
    }

    #[test]
    fn listing_drops_malformed_and_duplicate_lines() {
        let body = "1.2.3.4:8080\r\nnot-a-proxy\n300.1.1.1:80\n5.6.7.8:0\n1.2.3.4:8080\n\n9.9.9.9:3128\n";
        let addrs: Vec<String> = parse_listing(body, 10)
            .into_iter()
            .map(|c| c.addr.to_string())
            .collect();
        assert_eq!(addrs, vec!["1.2.3.4:8080", "9.9.9.9:3128"]);
    }

    #[test]
    fn listing_stops_at_limit() {
        let body = "1.1.1.1:80\n2.2.2.2:80\n3.3.3.3:80\n";
        assert_eq!(parse_listing(body, 2).len(), 2);
        assert!(parse_listing(body, 0).is_empty());
    }

    #[test]
    fn escalation_is_bounded() {
        assert_eq!(SslTier::Yes.escalation().len(), 3);
        assert_eq!(SslTier::No.escalation(), &[SslTier::No, SslTier::All]);
        assert_eq!(SslTier::All.escalation(), &[SslTier::All]);
    }

    #[tokio::test]
    async fn empty_tiers_escalate_to_all() {
        let server = MockServer::start().await;
        mount_tier(&server, "yes", "", 1).await;
        mount_tier(&server, "no", "\n", 1).await;
        mount_tier(&server, "all", "1.2.3.4:8080\n5.6.7.8:3128\n9.10.11.12:80\n", 1).await;

        let query = ProxyListQuery {
            limit: 10,
            ..ProxyListQuery::default()
        };
        let candidates = pool(&server).fetch(&query).await;
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| !c.stage1_passed));
    }

    #[tokio::test]
    async fn starting_at_all_makes_one_request() {
        let server = MockServer::start().await;
        mount_tier(&server, "all", "", 1).await;

        let query = ProxyListQuery {
            ssl: SslTier::All,
            ..ProxyListQuery::default()
        };
        assert!(pool(&server).fetch(&query).await.is_empty());
    }

    #[tokio::test]
    async fn first_non_empty_tier_wins() {
        let server = MockServer::start().await;
        mount_tier(&server, "yes", "1.2.3.4:8080\n", 1).await;
        mount_tier(&server, "no", "5.6.7.8:80\n", 0).await;

        let candidates = pool(&server).fetch(&ProxyListQuery::default()).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr.to_string(), "1.2.3.4:8080");
    }

    #[tokio::test]
    async fn default_query_asks_for_elite_http_proxies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .and(query_param("protocol", "http"))
            .and(query_param("timeout", "10000"))
            .and(query_param("country", "all"))
            .and(query_param("anonymity", "elite"))
            .and(query_param("ssl", "yes"))
            .respond_with(ResponseTemplate::new(200).set_body_string("1.2.3.4:8080\n"))
            .expect(1)
            .mount(&server)
            .await;

        let candidates = pool(&server).fetch(&ProxyListQuery::default()).await;
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn error_responses_yield_nothing_without_escalating() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        assert!(pool(&server).fetch(&ProxyListQuery::default()).await.is_empty());
    }

    #[tokio::test]
    async fn non_200_success_codes_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(203).set_body_string("1.2.3.4:8080\n"))
            .expect(1)
            .mount(&server)
            .await;

        assert!(pool(&server).fetch(&ProxyListQuery::default()).await.is_empty());
    }
}
