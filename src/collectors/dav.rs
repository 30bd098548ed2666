//! WebDAV/HTTP stats collection.
//!
//! Two strategies: `rfc4331` issues a depth-0 PROPFIND for the quota
//! properties, `list-files` walks the share with a depth-infinity
//! PROPFIND and sums `getcontentlength` over every entry.  Both ride on
//! `reqwest` with the share's client certificate attached for TLS
//! endpoints.

use std::future::Future;
use std::pin::Pin;

use reqwest::{Certificate, Client, Identity, Method, StatusCode};
use tracing::{debug, warn};

use crate::collectors::Collector;
use crate::errors::StatsError;
use crate::share::{QuotaSetting, StorageShare};
use crate::validate::SettingRule;
use crate::xml;

const DAV_RULES: &[(&str, SettingRule)] = &[
    ("cli_certificate", SettingRule::required("003")),
    ("cli_private_key", SettingRule::required("004")),
    (
        "storagestats.api",
        SettingRule {
            required: false,
            default: Some("rfc4331"),
            valid: &["list-files", "rfc4331"],
            boolean: false,
            status_code: "070",
        },
    ),
];

#[derive(Debug)]
pub struct DavCollector;

impl Collector for DavCollector {
    fn protocol(&self) -> &'static str {
        "DAV"
    }

    fn rules(&self) -> &'static [(&'static str, SettingRule)] {
        DAV_RULES
    }

    fn prepare(&self, _share: &mut StorageShare) {}

    fn collect<'a>(
        &'a self,
        share: &'a mut StorageShare,
    ) -> Pin<Box<dyn Future<Output = Result<(), StatsError>> + Send + 'a>> {
        Box::pin(collect_dav_stats(share))
    }
}

/// Endpoint URL the PROPFIND is issued against.
fn api_url(share: &StorageShare) -> String {
    format!(
        "{}://{}{}",
        share.uri.scheme, share.uri.netloc, share.uri.path
    )
}

/// Build the HTTP client for this share.
///
/// `use_custom_ca` selects whether a configured `ca_path` bundle is
/// loaded; the TLS retry path drops it in favor of the system trust
/// store.  The client identity is only attached for TLS endpoints.
fn build_client(share: &StorageShare, use_custom_ca: bool) -> Result<Client, StatsError> {
    let mut builder = Client::builder().timeout(share.conn_timeout());

    if !share.setting_bool("ssl_check") {
        builder = builder.danger_accept_invalid_certs(true);
    }

    let ca_path = share.setting_str("ca_path");
    if use_custom_ca && !ca_path.is_empty() {
        let pem = std::fs::read(ca_path).map_err(|e| StatsError::ConnectionDavCertPath {
            certfile: ca_path.to_string(),
            debug: e.to_string(),
        })?;
        let cert = Certificate::from_pem(&pem).map_err(|e| StatsError::ConnectionDavCertPath {
            certfile: ca_path.to_string(),
            debug: e.to_string(),
        })?;
        builder = builder.add_root_certificate(cert);
    }

    if share.uri.scheme == "https" {
        builder = builder.identity(load_identity(share)?);
    }

    builder.build().map_err(|e| StatsError::Connection {
        error: "ClientError".to_string(),
        status_code: "400".to_string(),
        debug: e.to_string(),
    })
}

/// Load the client certificate and private key as a single PEM identity.
fn load_identity(share: &StorageShare) -> Result<Identity, StatsError> {
    let certfile = share.setting_str("cli_certificate").to_string();
    let keyfile = share.setting_str("cli_private_key").to_string();

    let mut pem = std::fs::read(&certfile).map_err(|e| StatsError::ConnectionDavCertPath {
        certfile: certfile.clone(),
        debug: e.to_string(),
    })?;
    let key = std::fs::read(&keyfile).map_err(|e| StatsError::ConnectionDavCertPath {
        certfile: keyfile.clone(),
        debug: e.to_string(),
    })?;
    pem.extend_from_slice(&key);

    Identity::from_pem(&pem).map_err(|e| StatsError::ConnectionDavCertPath {
        certfile,
        debug: e.to_string(),
    })
}

fn is_tls_error(err: &reqwest::Error) -> bool {
    let text = format!("{err:?}").to_lowercase();
    text.contains("certificate") || text.contains("ssl") || text.contains("tls")
}

async fn send_propfind(
    client: &Client,
    url: &str,
    depth: &str,
    body: String,
) -> Result<reqwest::Response, reqwest::Error> {
    let method = Method::from_bytes(b"PROPFIND").expect("valid method");
    client
        .request(method, url)
        .header("Depth", depth)
        .header("Content-Type", "application/xml")
        .body(body)
        .send()
        .await
}

async fn collect_dav_stats(share: &mut StorageShare) -> Result<(), StatsError> {
    if !matches!(share.uri.scheme.as_str(), "http" | "https") {
        return Err(StatsError::ConnectionInvalidSchema {
            schema: share.uri.scheme.clone(),
            debug: share.uri.url.clone(),
        });
    }

    let api = share.setting_str("storagestats.api").to_string();
    let url = api_url(share);
    let (depth, body) = if api == "list-files" {
        ("infinity", String::new())
    } else {
        ("0", xml::create_rfc4331_request())
    };
    debug!(share = %share.id, %url, %api, "sending PROPFIND");

    let client = build_client(share, true)?;
    let response = match send_propfind(&client, &url, depth, body.clone()).await {
        Ok(response) => response,
        Err(err) if is_tls_error(&err) => {
            // One retry against the system trust store before giving up.
            warn!(share = %share.id, error = %err, "TLS failure, retrying with default trust store");
            let client = build_client(share, false)?;
            send_propfind(&client, &url, depth, body)
                .await
                .map_err(|e| StatsError::Connection {
                    error: "SSLError".to_string(),
                    status_code: "092".to_string(),
                    debug: e.to_string(),
                })?
        }
        Err(err) => {
            return Err(StatsError::Connection {
                error: "ConnectionError".to_string(),
                status_code: "400".to_string(),
                debug: err.to_string(),
            })
        }
    };

    share.touch_endtime();

    let status = response.status();
    let text = response.text().await.map_err(|e| StatsError::Connection {
        error: "ConnectionError".to_string(),
        status_code: status.as_u16().to_string(),
        debug: e.to_string(),
    })?;

    if status.is_client_error() || status.is_server_error() {
        return Err(StatsError::Connection {
            error: status
                .canonical_reason()
                .unwrap_or("ConnectionError")
                .replace(' ', ""),
            status_code: status.as_u16().to_string(),
            debug: text,
        });
    }
    if status != StatusCode::MULTI_STATUS && !status.is_success() {
        return Err(StatsError::Connection {
            error: "UnexpectedStatus".to_string(),
            status_code: status.as_u16().to_string(),
            debug: text,
        });
    }

    if api == "list-files" {
        let (bytesused, filecount) = xml::sum_getcontentlength(&text)?;
        apply_file_listing(share, bytesused, filecount)
    } else {
        xml::process_rfc4331_response(&text, share)
    }
}

/// Fold a depth-infinity listing into the stats block.
///
/// A listing yields no quota of its own, so an API-quota share keeps the
/// default and surfaces a warning.
fn apply_file_listing(
    share: &mut StorageShare,
    bytesused: u64,
    filecount: u64,
) -> Result<(), StatsError> {
    share.stats.bytesused = bytesused;
    share.stats.filecount = filecount;

    match share.quota_setting() {
        QuotaSetting::Bytes(quota) => {
            share.stats.quota = quota;
            share.stats.bytesfree = quota.saturating_sub(bytesused);
            Ok(())
        }
        QuotaSetting::Api => {
            share.stats.bytesfree = share.stats.quota.saturating_sub(bytesused);
            Err(StatsError::QuotaWarning)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawShare;
    use crate::share::{SettingValue, DEFAULT_QUOTA_BYTES};
    use std::collections::HashMap;

    fn share_for(url: &str) -> StorageShare {
        let raw = RawShare {
            id: "dav1".to_string(),
            url: url.to_string(),
            plugin: "libugrlocplugin_dav.so".to_string(),
            plugin_settings: HashMap::new(),
        };
        StorageShare::new(&raw)
    }

    #[test]
    fn api_url_preserves_port_and_path() {
        let share = share_for("davs://dav.example.org:8443/dpm/data");
        assert_eq!(api_url(&share), "https://dav.example.org:8443/dpm/data");
    }

    #[test]
    fn listing_with_fixed_quota_derives_bytesfree() {
        let mut share = share_for("davs://dav.example.org/data");
        share
            .plugin_settings
            .insert("storagestats.quota".to_string(), SettingValue::Bytes(1000));
        apply_file_listing(&mut share, 300, 4).unwrap();
        assert_eq!(share.stats.bytesused, 300);
        assert_eq!(share.stats.filecount, 4);
        assert_eq!(share.stats.quota, 1000);
        assert_eq!(share.stats.bytesfree, 700);
    }

    #[test]
    fn listing_with_api_quota_keeps_default_and_warns() {
        let mut share = share_for("davs://dav.example.org/data");
        let err = apply_file_listing(&mut share, 300, 4).unwrap_err();
        assert!(matches!(err, StatsError::QuotaWarning));
        assert_eq!(share.stats.quota, DEFAULT_QUOTA_BYTES);
        assert_eq!(share.stats.bytesfree, DEFAULT_QUOTA_BYTES - 300);
    }

    #[test]
    fn missing_certificate_file_is_a_cert_path_error() {
        let mut share = share_for("davs://dav.example.org/data");
        share.plugin_settings.insert(
            "cli_certificate".to_string(),
            SettingValue::Str("/no/such/cert.pem".to_string()),
        );
        share.plugin_settings.insert(
            "cli_private_key".to_string(),
            SettingValue::Str("/no/such/key.pem".to_string()),
        );
        let err = load_identity(&share).unwrap_err();
        match err {
            StatsError::ConnectionDavCertPath { certfile, .. } => {
                assert_eq!(certfile, "/no/such/cert.pem")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn required_cert_settings_are_declared() {
        let names: Vec<&str> = DAV_RULES.iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"cli_certificate"));
        assert!(names.contains(&"cli_private_key"));
    }
}
