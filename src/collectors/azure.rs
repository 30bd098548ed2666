//! Azure Blob Storage stats collection.
//!
//! Lists the configured container page by page and sums blob sizes.
//! Requests are signed with the storage account's Shared Key: an
//! HMAC-SHA256 over the canonical string-to-sign, keyed with the
//! base64-decoded account key.

use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::debug;

use crate::collectors::Collector;
use crate::errors::StatsError;
use crate::share::{QuotaSetting, StorageShare};
use crate::validate::SettingRule;

type HmacSha256 = Hmac<Sha256>;

const AZURE_API_VERSION: &str = "2019-12-12";

const AZURE_RULES: &[(&str, SettingRule)] = &[
    ("azure.key", SettingRule::required("010")),
    (
        "storagestats.api",
        SettingRule {
            required: false,
            default: Some("list-blobs"),
            valid: &["list-blobs"],
            boolean: false,
            status_code: "070",
        },
    ),
];

#[derive(Debug)]
pub struct AzureCollector;

impl Collector for AzureCollector {
    fn protocol(&self) -> &'static str {
        "Azure"
    }

    fn rules(&self) -> &'static [(&'static str, SettingRule)] {
        AZURE_RULES
    }

    /// Blob endpoints are TLS-only.  The account is the first hostname
    /// label, the container the last path segment.
    fn prepare(&self, share: &mut StorageShare) {
        if share.uri.scheme == "azure" {
            share.uri.scheme = "https".to_string();
        }
        share.uri.account = share
            .uri
            .hostname
            .split('.')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        share.uri.container = share
            .uri
            .path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .map(str::to_string);
    }

    fn collect<'a>(
        &'a self,
        share: &'a mut StorageShare,
    ) -> Pin<Box<dyn Future<Output = Result<(), StatsError>> + Send + 'a>> {
        Box::pin(collect_blob_stats(share))
    }
}

fn azure_api_error(error: impl Into<String>, status_code: impl Into<String>, debug: String) -> StatsError {
    StatsError::ConnectionAzureApi {
        error: error.into(),
        status_code: status_code.into(),
        api: "list-blobs".to_string(),
        debug,
    }
}

/// Shared Key authorization header for a container list request.
///
/// String-to-sign per the Azure Storage REST docs: the GET verb, twelve
/// empty standard headers, the canonicalized `x-ms-*` headers, then the
/// canonicalized resource with its query parameters sorted.
fn shared_key_authorization(
    account: &str,
    key: &str,
    date: &str,
    container: &str,
    marker: Option<&str>,
) -> Result<String, StatsError> {
    let decoded_key = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|e| azure_api_error("InvalidAccountKey", "400", e.to_string()))?;

    let mut canonical_resource = format!("/{account}/{container}\ncomp:list");
    if let Some(marker) = marker {
        canonical_resource.push_str(&format!("\nmarker:{marker}"));
    }
    canonical_resource.push_str("\nrestype:container");

    let string_to_sign = format!(
        "GET\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:{date}\nx-ms-version:{AZURE_API_VERSION}\n{canonical_resource}"
    );

    let mut mac = HmacSha256::new_from_slice(&decoded_key)
        .map_err(|e| azure_api_error("InvalidAccountKey", "400", e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!("SharedKey {account}:{signature}"))
}

async fn collect_blob_stats(share: &mut StorageShare) -> Result<(), StatsError> {
    let account = share.uri.account.clone().unwrap_or_default();
    let container = share.uri.container.clone().unwrap_or_default();
    let key = share.setting_str("azure.key").to_string();
    let base_url = format!(
        "{}://{}/{container}?restype=container&comp=list",
        share.uri.scheme, share.uri.netloc
    );

    let client = reqwest::Client::builder()
        .timeout(share.conn_timeout())
        .build()
        .map_err(|e| azure_api_error("ClientError", "400", e.to_string()))?;

    let mut total_bytes: u64 = 0;
    let mut total_files: u64 = 0;
    let mut marker: Option<String> = None;

    loop {
        let url = match &marker {
            Some(m) => format!(
                "{base_url}&marker={}",
                utf8_percent_encode(m, NON_ALPHANUMERIC)
            ),
            None => base_url.clone(),
        };
        debug!(share = %share.id, %url, "listing container blobs");

        let date = httpdate::fmt_http_date(SystemTime::now());
        let authorization =
            shared_key_authorization(&account, &key, &date, &container, marker.as_deref())?;

        let response = client
            .get(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(|e| StatsError::Connection {
                error: "ConnectionError".to_string(),
                status_code: "400".to_string(),
                debug: e.to_string(),
            })?;

        share.touch_endtime();

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| azure_api_error("ConnectionError", status.as_u16().to_string(), e.to_string()))?;

        if status == StatusCode::NOT_FOUND {
            return Err(StatsError::AzureContainerNotFound {
                container: container.clone(),
                debug: body,
            });
        }
        if !status.is_success() {
            return Err(azure_api_error(
                status.canonical_reason().unwrap_or("ConnectionError").replace(' ', ""),
                status.as_u16().to_string(),
                body,
            ));
        }

        let (page_bytes, page_files, next_marker) = parse_blob_list(&body)?;
        total_bytes += page_bytes;
        total_files += page_files;

        match next_marker {
            Some(next) if !next.is_empty() => marker = Some(next),
            _ => break,
        }
    }

    share.stats.bytesused = total_bytes;
    share.stats.filecount = total_files;

    // Blob listings carry no quota; only a configured one applies.
    match share.quota_setting() {
        QuotaSetting::Bytes(quota) => {
            share.stats.quota = quota;
            share.stats.bytesfree = quota.saturating_sub(total_bytes);
            Ok(())
        }
        QuotaSetting::Api => {
            share.stats.bytesfree = share.stats.quota.saturating_sub(total_bytes);
            Err(StatsError::QuotaWarning)
        }
    }
}

/// Parse one `List Blobs` response page.
///
/// Returns summed blob sizes, the blob count, and the continuation
/// marker when the listing is truncated.
fn parse_blob_list(body: &str) -> Result<(u64, u64, Option<String>), StatsError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(body);
    reader.trim_text(true);

    let mut total_bytes: u64 = 0;
    let mut total_files: u64 = 0;
    let mut next_marker: Option<String> = None;
    let mut current: Option<&'static str> = None;

    let malformed = |e: quick_xml::Error| azure_api_error("MalformedXML", "000", e.to_string());

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => {
                current = match e.local_name().as_ref() {
                    b"Content-Length" => Some("length"),
                    b"NextMarker" => Some("marker"),
                    _ => None,
                };
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(malformed)?;
                match current {
                    Some("length") => {
                        if let Ok(size) = text.trim().parse::<u64>() {
                            total_bytes += size;
                            total_files += 1;
                        }
                    }
                    Some("marker") => next_marker = Some(text.trim().to_string()),
                    _ => {}
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok((total_bytes, total_files, next_marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawShare;
    use std::collections::HashMap;

    fn azure_share(url: &str) -> StorageShare {
        let raw = RawShare {
            id: "az1".to_string(),
            url: url.to_string(),
            plugin: "libugrlocplugin_azure.so".to_string(),
            plugin_settings: HashMap::new(),
        };
        StorageShare::new(&raw)
    }

    #[test]
    fn prepare_extracts_account_and_container() {
        let mut share = azure_share("azure://myaccount.blob.core.windows.net/mycontainer");
        AzureCollector.prepare(&mut share);
        assert_eq!(share.uri.scheme, "https");
        assert_eq!(share.uri.account.as_deref(), Some("myaccount"));
        assert_eq!(share.uri.container.as_deref(), Some("mycontainer"));
    }

    #[test]
    fn blob_list_sums_sizes_and_counts() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://myaccount.blob.core.windows.net/" ContainerName="mycontainer">
  <Blobs>
    <Blob>
      <Name>a.dat</Name>
      <Properties><Content-Length>100</Content-Length></Properties>
    </Blob>
    <Blob>
      <Name>b.dat</Name>
      <Properties><Content-Length>250</Content-Length></Properties>
    </Blob>
  </Blobs>
  <NextMarker>marker-2</NextMarker>
</EnumerationResults>"#;
        let (bytes, files, marker) = parse_blob_list(body).unwrap();
        assert_eq!(bytes, 350);
        assert_eq!(files, 2);
        assert_eq!(marker.as_deref(), Some("marker-2"));
    }

    #[test]
    fn final_page_has_no_marker() {
        let body = r#"<EnumerationResults><Blobs>
<Blob><Name>a</Name><Properties><Content-Length>10</Content-Length></Properties></Blob>
</Blobs><NextMarker/></EnumerationResults>"#;
        let (bytes, files, marker) = parse_blob_list(body).unwrap();
        assert_eq!(bytes, 10);
        assert_eq!(files, 1);
        // Empty-element NextMarker yields no continuation.
        assert!(marker.is_none() || marker.as_deref() == Some(""));
    }

    #[test]
    fn shared_key_header_is_account_scoped() {
        let key = base64::engine::general_purpose::STANDARD.encode(b"0123456789abcdef");
        let auth = shared_key_authorization(
            "myaccount",
            &key,
            "Wed, 01 May 2024 12:00:00 GMT",
            "mycontainer",
            None,
        )
        .unwrap();
        assert!(auth.starts_with("SharedKey myaccount:"));
        // Same inputs must sign identically.
        let again = shared_key_authorization(
            "myaccount",
            &key,
            "Wed, 01 May 2024 12:00:00 GMT",
            "mycontainer",
            None,
        )
        .unwrap();
        assert_eq!(auth, again);
        // A marker changes the canonical resource and the signature.
        let with_marker = shared_key_authorization(
            "myaccount",
            &key,
            "Wed, 01 May 2024 12:00:00 GMT",
            "mycontainer",
            Some("m2"),
        )
        .unwrap();
        assert_ne!(auth, with_marker);
    }

    #[test]
    fn invalid_base64_key_is_an_error() {
        let err =
            shared_key_authorization("acct", "not base64!!", "date", "cont", None).unwrap_err();
        assert!(matches!(err, StatsError::ConnectionAzureApi { .. }));
    }
}
