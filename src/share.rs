//! In-memory data model for configured storage shares.
//!
//! A [`StorageShare`] is the normalized representation of one share
//! declared in the configuration: its parsed endpoint URI, validated
//! plugin settings, the stats block filled in by its protocol collector,
//! and the status/debug trail accumulated over the run.  Shares that
//! alias the same physical URL are grouped into a [`StorageEndpoint`]
//! for accounting output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::collectors::Collector;
use crate::config::RawShare;
use crate::errors::StatsError;

/// Default quota sentinel: 1 TB decimal, applied when neither the
/// configuration nor the provider supplies a quota.
pub const DEFAULT_QUOTA_BYTES: u64 = 1_000_000_000_000;

/// Initial status of a freshly constructed share.
pub const STATUS_OK: &str = "[OK][OK][200]";

/// A normalized setting value after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Str(String),
    Bool(bool),
    /// A quota resolved to an absolute byte count.
    Bytes(u64),
}

impl SettingValue {
    pub fn as_str(&self) -> &str {
        match self {
            SettingValue::Str(s) => s,
            _ => "",
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            SettingValue::Bool(b) => *b,
            SettingValue::Str(s) => !matches!(s.to_lowercase().as_str(), "false" | "no"),
            SettingValue::Bytes(_) => true,
        }
    }
}

/// Resolved quota source for a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSetting {
    /// Use the provider-reported quota.
    Api,
    /// Fixed byte count from configuration.
    Bytes(u64),
}

/// Endpoint URL decomposed into the pieces collectors need.
///
/// The scheme is normalized at construction (`dav` to `http`, `davs` to
/// `https`); protocol-specific extras (S3 bucket/domain, Azure
/// account/container) are filled in by each collector's `prepare` step.
#[derive(Debug, Clone, Default)]
pub struct ShareUri {
    /// The URL exactly as written in the configuration.
    pub url: String,
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
    /// `host` or `host:port`.
    pub netloc: String,
    pub path: String,
    /// S3 bucket name.
    pub bucket: Option<String>,
    /// S3 endpoint domain when the bucket is a virtual-host label.
    pub domain: Option<String>,
    /// Azure storage account name.
    pub account: Option<String>,
    /// Azure container name.
    pub container: Option<String>,
}

impl ShareUri {
    /// Parse and normalize a configured URL.
    pub fn parse(raw_url: &str) -> Result<Self, StatsError> {
        let parsed = Url::parse(raw_url).map_err(|e| StatsError::ConnectionInvalidSchema {
            schema: raw_url.to_string(),
            debug: e.to_string(),
        })?;

        let scheme = translate_scheme(parsed.scheme());
        let hostname = parsed.host_str().unwrap_or_default().to_string();
        let port = parsed.port();
        let netloc = match port {
            Some(p) => format!("{hostname}:{p}"),
            None => hostname.clone(),
        };

        Ok(ShareUri {
            url: raw_url.to_string(),
            scheme,
            hostname,
            port,
            netloc,
            path: parsed.path().to_string(),
            bucket: None,
            domain: None,
            account: None,
            container: None,
        })
    }
}

/// Translate schemes the HTTP transport does not understand.
fn translate_scheme(scheme: &str) -> String {
    match scheme {
        "dav" => "http".to_string(),
        "davs" => "https".to_string(),
        other => other.to_string(),
    }
}

/// Capacity metrics for one share, filled in by its collector.
#[derive(Debug, Clone)]
pub struct Stats {
    pub bytesused: u64,
    pub bytesfree: u64,
    pub filecount: u64,
    pub quota: u64,
    /// Unix timestamp when the share was constructed.
    pub starttime: i64,
    /// Unix timestamp when the last endpoint response was received.
    pub endtime: i64,
}

impl Stats {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Stats {
            bytesused: 0,
            bytesfree: 0,
            filecount: 0,
            quota: DEFAULT_QUOTA_BYTES,
            starttime: now,
            endtime: now,
        }
    }
}

/// One configured storage share and everything collected about it.
pub struct StorageShare {
    /// Unique identifier from the configuration.
    pub id: String,
    /// Plugin identifier (filename component from the declaration line).
    pub plugin: String,
    /// Short protocol name: `S3`, `DAV`, `Azure`, or `Unknown` for
    /// degraded shares.
    pub storageprotocol: String,
    pub uri: ShareUri,
    /// Normalized settings: local over global over validator defaults.
    pub plugin_settings: HashMap<String, SettingValue>,
    pub stats: Stats,
    /// Last terminal condition. Latest wins.
    pub status: String,
    /// Append-only diagnostic trail, never cleared.
    pub debug: Vec<String>,
    /// Set when construction or validation failed; the collector is
    /// skipped but the share stays in the output.
    pub degraded: bool,
    collector: Option<Arc<dyn Collector>>,
}

impl StorageShare {
    /// Construct a share from a raw config record. The URI is parsed and
    /// scheme-normalized here; validation and protocol attachment happen
    /// in the dispatcher.
    pub fn new(raw: &RawShare) -> Self {
        let mut share = StorageShare {
            id: raw.id.clone(),
            plugin: raw.plugin.clone(),
            storageprotocol: "Unknown".to_string(),
            uri: ShareUri::default(),
            plugin_settings: HashMap::new(),
            stats: Stats::new(),
            status: STATUS_OK.to_string(),
            debug: Vec::new(),
            degraded: false,
            collector: None,
        };

        match ShareUri::parse(&raw.url) {
            Ok(uri) => share.uri = uri,
            Err(err) => {
                share.uri.url = raw.url.clone();
                share.record_error(&err);
                share.degraded = true;
            }
        }

        share
    }

    /// Attach the protocol collector chosen by the factory.
    pub fn set_collector(&mut self, collector: Arc<dyn Collector>) {
        self.storageprotocol = collector.protocol().to_string();
        self.collector = Some(collector);
    }

    /// The collector to run for this share, if one was attached.
    pub fn collector(&self) -> Option<Arc<dyn Collector>> {
        self.collector.clone()
    }

    /// Record an error or warning: status takes the latest condition,
    /// debug accumulates the full history.
    pub fn record_error(&mut self, err: &StatsError) {
        self.debug.push(err.debug_message());
        self.status = err.status_message();
    }

    pub fn setting(&self, name: &str) -> Option<&SettingValue> {
        self.plugin_settings.get(name)
    }

    pub fn setting_str(&self, name: &str) -> &str {
        self.setting(name).map(SettingValue::as_str).unwrap_or("")
    }

    pub fn setting_bool(&self, name: &str) -> bool {
        self.setting(name).map(SettingValue::as_bool).unwrap_or(false)
    }

    /// The resolved `storagestats.quota` setting.
    pub fn quota_setting(&self) -> QuotaSetting {
        match self.setting("storagestats.quota") {
            Some(SettingValue::Bytes(n)) => QuotaSetting::Bytes(*n),
            _ => QuotaSetting::Api,
        }
    }

    /// Per-request connection timeout from `conn_timeout`.
    pub fn conn_timeout(&self) -> Duration {
        let secs = self
            .setting_str("conn_timeout")
            .parse::<u64>()
            .unwrap_or(10);
        Duration::from_secs(secs)
    }

    /// Mark the moment a response was received from the endpoint.
    pub fn touch_endtime(&mut self) {
        self.stats.endtime = chrono::Utc::now().timestamp();
    }

    /// StAR `StorageShare` field: the bucket or container when known.
    pub fn star_storage_share(&self) -> Option<&str> {
        self.uri
            .bucket
            .as_deref()
            .or(self.uri.container.as_deref())
    }
}

/// A group of shares aliasing the same physical URL.
///
/// Exists purely for accounting output; has no collection behavior.
pub struct StorageEndpoint {
    pub url: String,
    /// Member shares in discovery order.
    pub storage_shares: Vec<StorageShare>,
}

impl StorageEndpoint {
    pub fn new(url: String) -> Self {
        StorageEndpoint {
            url,
            storage_shares: Vec::new(),
        }
    }

    pub fn add_storage_share(&mut self, share: StorageShare) {
        self.storage_shares.push(share);
    }
}
