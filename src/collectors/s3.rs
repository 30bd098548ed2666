//! S3 stats collection.
//!
//! Three strategies.  `ceph-admin` asks the Ceph RGW admin API for the
//! bucket usage object over a SigV4-signed REST call; `generic` and
//! `list-objects` page through the bucket with ListObjectsV2 and sum
//! object sizes.  Path-style versus virtual-host addressing follows the
//! `s3.alternate` setting.

use std::future::Future;
use std::pin::Pin;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::collectors::Collector;
use crate::errors::StatsError;
use crate::share::{QuotaSetting, StorageShare, DEFAULT_QUOTA_BYTES};
use crate::validate::SettingRule;

type HmacSha256 = Hmac<Sha256>;

const S3_RULES: &[(&str, SettingRule)] = &[
    (
        "s3.alternate",
        SettingRule {
            required: false,
            default: Some("false"),
            valid: &["true", "false", "yes", "no"],
            boolean: true,
            status_code: "020",
        },
    ),
    (
        "storagestats.api",
        SettingRule {
            required: false,
            default: Some("generic"),
            valid: &["ceph-admin", "generic", "list-objects"],
            boolean: false,
            status_code: "070",
        },
    ),
    ("s3.priv_key", SettingRule::required("021")),
    ("s3.pub_key", SettingRule::required("022")),
    ("s3.region", SettingRule::optional("us-east-1", "023")),
    (
        "s3.signature_ver",
        SettingRule {
            required: false,
            default: Some("s3v4"),
            valid: &["s3", "s3v4"],
            boolean: false,
            status_code: "024",
        },
    ),
];

#[derive(Debug)]
pub struct S3Collector;

impl Collector for S3Collector {
    fn protocol(&self) -> &'static str {
        "S3"
    }

    fn rules(&self) -> &'static [(&'static str, SettingRule)] {
        S3_RULES
    }

    /// Resolve the transport scheme and split the bucket out of the URL.
    ///
    /// Path-style (`s3.alternate`) addressing carries the bucket as the
    /// last path segment; virtual-host addressing carries it as the
    /// first hostname label, with the rest being the endpoint domain.
    fn prepare(&self, share: &mut StorageShare) {
        if share.uri.scheme == "s3" {
            share.uri.scheme = if share.setting_bool("ssl_check") {
                "https".to_string()
            } else {
                "http".to_string()
            };
        }

        if share.setting_bool("s3.alternate") {
            share.uri.bucket = share
                .uri
                .path
                .rsplit('/')
                .find(|s| !s.is_empty())
                .map(str::to_string);
        } else if let Some((bucket, domain)) = share.uri.netloc.split_once('.') {
            share.uri.bucket = Some(bucket.to_string());
            share.uri.domain = Some(domain.to_string());
        }
    }

    fn collect<'a>(
        &'a self,
        share: &'a mut StorageShare,
    ) -> Pin<Box<dyn Future<Output = Result<(), StatsError>> + Send + 'a>> {
        Box::pin(async move {
            let api = share.setting_str("storagestats.api").to_string();
            match api.as_str() {
                "ceph-admin" => collect_ceph_admin(share).await,
                _ => collect_list_objects(share).await,
            }
        })
    }
}

// ── ceph-admin ──────────────────────────────────────────────────────

async fn collect_ceph_admin(share: &mut StorageShare) -> Result<(), StatsError> {
    let bucket = share.uri.bucket.clone().unwrap_or_default();
    let (host, path) = if share.setting_bool("s3.alternate") {
        (share.uri.netloc.clone(), "/admin/bucket".to_string())
    } else {
        (
            share.uri.domain.clone().unwrap_or_default(),
            format!("/admin/{bucket}"),
        )
    };

    // Already alphabetical, as the canonical query requires.
    let query = [
        ("bucket", bucket.as_str()),
        ("format", "json"),
        ("stats", "True"),
    ];
    let query_string = query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let url = format!("{}://{host}{path}?{query_string}", share.uri.scheme);
    debug!(share = %share.id, %url, "requesting ceph-admin bucket stats");

    let timestamp = chrono::Utc::now();
    let headers = sign_v4_get(
        &host,
        &path,
        &query_string,
        share.setting_str("s3.region"),
        share.setting_str("s3.pub_key"),
        share.setting_str("s3.priv_key"),
        &timestamp,
    );

    let mut builder = reqwest::Client::builder().timeout(share.conn_timeout());
    if !share.setting_bool("ssl_check") {
        builder = builder.danger_accept_invalid_certs(true);
    }
    let client = builder.build().map_err(|e| StatsError::ConnectionS3Api {
        error: "ClientError".to_string(),
        status_code: "400".to_string(),
        api: "ceph-admin".to_string(),
        debug: e.to_string(),
    })?;

    let mut request = client.get(&url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    let response = request
        .send()
        .await
        .map_err(|e| StatsError::ConnectionS3Api {
            error: "ConnectionError".to_string(),
            status_code: "400".to_string(),
            api: "ceph-admin".to_string(),
            debug: e.to_string(),
        })?;

    share.touch_endtime();

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| StatsError::ConnectionS3Api {
            error: "ConnectionError".to_string(),
            status_code: status.to_string(),
            api: "ceph-admin".to_string(),
            debug: e.to_string(),
        })?;

    let stats: serde_json::Value =
        serde_json::from_str(&body).map_err(|_| StatsError::ConnectionS3Api {
            error: "NoContent".to_string(),
            status_code: status.to_string(),
            api: "ceph-admin".to_string(),
            debug: body.clone(),
        })?;

    apply_ceph_admin_stats(share, &stats, status)
}

/// Fold a ceph-admin bucket stats document into the share.
fn apply_ceph_admin_stats(
    share: &mut StorageShare,
    stats: &serde_json::Value,
    http_status: u16,
) -> Result<(), StatsError> {
    let usage = match stats.get("usage").filter(|u| u.is_object()) {
        Some(usage) => usage,
        None => {
            let error = stats
                .get("Code")
                .and_then(|c| c.as_str())
                .unwrap_or("NoContent")
                .to_string();
            return Err(StatsError::S3MissingBucketUsage {
                error,
                status_code: http_status.to_string(),
                debug: stats.to_string(),
            });
        }
    };

    let main = usage.get("rgw.main").cloned().unwrap_or_default();
    share.stats.bytesused = main
        .get("size_utilized")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    share.stats.filecount = main
        .get("num_objects")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    match share.quota_setting() {
        QuotaSetting::Bytes(quota) => {
            share.stats.quota = quota;
            share.stats.bytesfree = quota.saturating_sub(share.stats.bytesused);
            Ok(())
        }
        QuotaSetting::Api => {
            let bucket_quota = stats.get("bucket_quota");
            let enabled = bucket_quota
                .and_then(|q| q.get("enabled"))
                .and_then(|e| e.as_bool());
            let max_size = bucket_quota
                .and_then(|q| q.get("max_size"))
                .and_then(|m| m.as_u64())
                .unwrap_or(0);

            let warning = match enabled {
                Some(true) if max_size > 0 => {
                    share.stats.quota = max_size;
                    None
                }
                Some(_) => Some(StatsError::CephQuotaDisabledWarning),
                None => Some(StatsError::QuotaWarning),
            };
            if warning.is_some() {
                share.stats.quota = DEFAULT_QUOTA_BYTES;
            }
            share.stats.bytesfree = share.stats.quota.saturating_sub(share.stats.bytesused);
            match warning {
                Some(warning) => Err(warning),
                None => Ok(()),
            }
        }
    }
}

// ── generic / list-objects ──────────────────────────────────────────

async fn collect_list_objects(share: &mut StorageShare) -> Result<(), StatsError> {
    let bucket = share.uri.bucket.clone().unwrap_or_default();
    let endpoint = if share.setting_bool("s3.alternate") {
        format!("{}://{}", share.uri.scheme, share.uri.netloc)
    } else {
        format!(
            "{}://{}",
            share.uri.scheme,
            share.uri.domain.as_deref().unwrap_or(&share.uri.netloc)
        )
    };
    debug!(share = %share.id, %endpoint, %bucket, "listing bucket objects");

    let credentials = Credentials::new(
        share.setting_str("s3.pub_key"),
        share.setting_str("s3.priv_key"),
        None,
        None,
        "sharestat",
    );
    let timeouts = aws_config::timeout::TimeoutConfig::builder()
        .operation_attempt_timeout(share.conn_timeout())
        .build();
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(share.setting_str("s3.region").to_string()))
        .endpoint_url(endpoint)
        .credentials_provider(credentials)
        .timeout_config(timeouts)
        .load()
        .await;
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(share.setting_bool("s3.alternate"))
        .build();
    let client = aws_sdk_s3::Client::from_conf(s3_config);

    let mut total_bytes: u64 = 0;
    let mut total_files: u64 = 0;
    let mut continuation_token: Option<String> = None;

    loop {
        let mut request = client.list_objects_v2().bucket(&bucket);
        request = request.set_continuation_token(continuation_token.take());
        let page = request.send().await.map_err(list_objects_error)?;

        share.touch_endtime();
        for object in page.contents() {
            total_bytes += object.size().unwrap_or(0).max(0) as u64;
            total_files += 1;
        }

        match page.next_continuation_token() {
            Some(token) => continuation_token = Some(token.to_string()),
            None => break,
        }
    }

    apply_listing(share, total_bytes, total_files)
}

fn list_objects_error(err: SdkError<ListObjectsV2Error, HttpResponse>) -> StatsError {
    let status_code = match &err {
        SdkError::ServiceError(ctx) => ctx.raw().status().as_u16().to_string(),
        _ => "000".to_string(),
    };
    StatsError::ConnectionS3Api {
        error: "ClientError".to_string(),
        status_code,
        api: "list-objects".to_string(),
        debug: format!("{err:?}"),
    }
}

/// Fold an object listing total into the stats block.
///
/// Object listings carry no quota, so an API-quota share keeps the
/// default and surfaces a warning.
fn apply_listing(
    share: &mut StorageShare,
    total_bytes: u64,
    total_files: u64,
) -> Result<(), StatsError> {
    share.stats.bytesused = total_bytes;
    share.stats.filecount = total_files;

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

// ── SigV4 signing for the admin API ─────────────────────────────────

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Sign a GET request with AWS Signature Version 4.
///
/// Returns the headers to attach: `x-amz-date`, `x-amz-content-sha256`,
/// and `Authorization`.  The canonical query string must already be in
/// sorted order.
fn sign_v4_get(
    host: &str,
    path: &str,
    query_string: &str,
    region: &str,
    access_key: &str,
    secret_key: &str,
    timestamp: &chrono::DateTime<chrono::Utc>,
) -> Vec<(&'static str, String)> {
    let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = timestamp.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(b"");

    let canonical_headers = format!(
        "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";
    let canonical_request = format!(
        "GET\n{path}\n{query_string}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let scope = format!("{date}/{region}/s3/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let date_key = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let region_key = hmac_sha256(&date_key, region.as_bytes());
    let service_key = hmac_sha256(&region_key, b"s3");
    let signing_key = hmac_sha256(&service_key, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{scope}, \
         SignedHeaders={signed_headers}, Signature={signature}"
    );

    vec![
        ("x-amz-date", amz_date),
        ("x-amz-content-sha256", payload_hash),
        ("Authorization", authorization),
    ]
}
