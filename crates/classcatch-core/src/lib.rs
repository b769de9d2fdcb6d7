//! Core domain model for ClassCatch: proxies, channel health and course rows.

use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "classcatch-core";

/// How long a recorded channel verdict stays trustworthy.
pub fn default_freshness_window() -> Duration {
    Duration::hours(1)
}

/// Outbound HTTP proxy address. Ports are always in `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyAddrError {
    #[error("expected ip:port, got {0:?}")]
    Shape(String),
    #[error("invalid IPv4 address {0:?}")]
    Ip(String),
    #[error("port out of range: {0:?}")]
    Port(String),
}

impl ProxyAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Result<Self, ProxyAddrError> {
        if port == 0 {
            return Err(ProxyAddrError::Port(port.to_string()));
        }
        Ok(Self { ip, port })
    }

    /// URL handed to HTTP clients and to Chromium's `--proxy-server`.
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for ProxyAddr {
    type Err = ProxyAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let Some((ip, port)) = trimmed.split_once(':') else {
            return Err(ProxyAddrError::Shape(trimmed.to_string()));
        };
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| ProxyAddrError::Ip(ip.to_string()))?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProxyAddrError::Port(port.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyAddrError::Port(port.to_string()))?;
        Self::new(ip, port)
    }
}

/// Proxy surfaced by the listing service for one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCandidate {
    pub addr: ProxyAddr,
    pub stage1_passed: bool,
}

impl ProxyCandidate {
    pub fn new(addr: ProxyAddr) -> Self {
        Self {
            addr,
            stage1_passed: false,
        }
    }
}

/// Access strategy against the timetable site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Requests,
    Browser,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Requests, Channel::Browser];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Requests => "requests",
            Channel::Browser => "browser",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation applied to a single channel of a single proxy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelVerdict {
    Working(DateTime<Utc>),
    /// Clears the working flag; the last successful verification time is kept.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub is_working: bool,
    pub last_verified: Option<DateTime<Utc>>,
}

impl ChannelHealth {
    /// Staleness never clears `is_working`, so every reader goes through here.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_verified {
            Some(at) => self.is_working && at >= now - window,
            None => false,
        }
    }

    pub fn apply(&mut self, verdict: ChannelVerdict) {
        match verdict {
            ChannelVerdict::Working(at) => {
                self.is_working = true;
                self.last_verified = Some(at);
            }
            ChannelVerdict::Failed => self.is_working = false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub addr: ProxyAddr,
    pub requests: ChannelHealth,
    pub browser: ChannelHealth,
}

impl ProxyRecord {
    pub fn new(addr: ProxyAddr) -> Self {
        Self {
            addr,
            requests: ChannelHealth::default(),
            browser: ChannelHealth::default(),
        }
    }

    pub fn health(&self, channel: Channel) -> &ChannelHealth {
        match channel {
            Channel::Requests => &self.requests,
            Channel::Browser => &self.browser,
        }
    }

    pub fn health_mut(&mut self, channel: Channel) -> &mut ChannelHealth {
        match channel {
            Channel::Requests => &mut self.requests,
            Channel::Browser => &mut self.browser,
        }
    }

    pub fn apply(&mut self, channel: Channel, verdict: ChannelVerdict) {
        self.health_mut(channel).apply(verdict);
    }

    /// Greater of the two channel verification timestamps.
    pub fn latest_verification(&self) -> Option<DateTime<Utc>> {
        self.requests.last_verified.max(self.browser.last_verified)
    }

    pub fn has_fresh_channel(&self, now: DateTime<Utc>, window: Duration) -> bool {
        Channel::ALL
            .iter()
            .any(|c| self.health(*c).is_fresh(now, window))
    }
}

/// Numeric reading of a course number such as `"069.12"`.
///
/// Course numbers are stored as text; this is the explicit parse step used
/// when ordering them. The suffix after the dot is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CourseNumber {
    pub integer: u32,
    pub suffix: Option<String>,
}

impl CourseNumber {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (int_part, suffix) = match raw.split_once('.') {
            Some((i, s)) => (i, Some(s)),
            None => (raw, None),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if let Some(s) = suffix {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
        }
        Some(Self {
            integer: int_part.parse().ok()?,
            suffix: suffix.map(ToString::to_string),
        })
    }
}

/// Identity of a course section within one term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CourseKey {
    pub subject_code: String,
    pub course_number: String,
    pub section: String,
}

impl CourseKey {
    /// Subject, then parsed course number (unparseable ones last), then section.
    pub fn natural_cmp(&self, other: &Self) -> Ordering {
        let num_a = CourseNumber::parse(&self.course_number);
        let num_b = CourseNumber::parse(&other.course_number);
        self.subject_code
            .cmp(&other.subject_code)
            .then_with(|| match (&num_a, &num_b) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.course_number.cmp(&other.course_number))
            .then_with(|| self.section.cmp(&other.section))
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject_code, self.course_number, self.section)
    }
}

/// One results-table row, typed but not yet reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrapedRow {
    pub subject_code: String,
    pub course_number: String,
    pub section: String,
    pub title: String,
    pub instructor: String,
    pub term: String,
    pub limit: i32,
    pub enrollment: i32,
    pub distrib: String,
    pub world_culture: String,
    pub lang_req: String,
    pub period: String,
    pub period_code: String,
    pub status: String,
    pub text: String,
    pub xlist: String,
    pub crn: String,
}

impl ScrapedRow {
    pub fn key(&self) -> CourseKey {
        CourseKey {
            subject_code: self.subject_code.clone(),
            course_number: self.course_number.clone(),
            section: self.section.clone(),
        }
    }
}

/// Persisted course section; `row.term` is part of the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRecord {
    pub row: ScrapedRow,
    pub last_updated: DateTime<Utc>,
}

impl CourseRecord {
    pub fn key(&self) -> CourseKey {
        self.row.key()
    }
}

/// Notification trigger for a stored section whose enrollment moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentChange {
    pub key: CourseKey,
    pub term: String,
    pub previous_enrollment: i32,
    pub new_enrollment: i32,
    pub limit: i32,
}

impl EnrollmentChange {
    pub fn seats_remaining(&self) -> i32 {
        (self.limit - self.new_enrollment).max(0)
    }

    /// True when the section went from full to having open seats.
    pub fn opened_up(&self) -> bool {
        self.previous_enrollment >= self.limit && self.new_enrollment < self.limit
    }
}

/// Reconciled writes for one term, applied as a single atomic unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CourseBatch {
    pub term: String,
    pub creates: Vec<ScrapedRow>,
    pub updates: Vec<ScrapedRow>,
    pub changes: Vec<EnrollmentChange>,
    pub skipped: usize,
}

impl CourseBatch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty()
    }
}
