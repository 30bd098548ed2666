//! Share construction and concurrent stats collection.
//!
//! Every failure in here is per-share: a share that cannot be built,
//! validated, or collected is degraded in place and the batch carries
//! on.  Collection runs one task per share under a semaphore-bounded
//! pool; results come back in declaration order.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::collectors;
use crate::config::RawShare;
use crate::share::{StorageEndpoint, StorageShare};
use crate::validate;

/// Turn raw config records into fully prepared shares.
///
/// Unknown plugins and failed validation leave a degraded placeholder
/// share in the batch so the failure is visible in every output sink.
pub fn build_storage_shares(raw_shares: Vec<RawShare>) -> Vec<StorageShare> {
    let mut shares = Vec::with_capacity(raw_shares.len());

    for raw in raw_shares {
        let mut share = StorageShare::new(&raw);

        if !share.degraded {
            match collectors::factory(&share.plugin) {
                Ok(collector) => {
                    match validate::validate_settings(&raw.plugin_settings, collector.rules()) {
                        Ok(validated) => {
                            share.plugin_settings = validated.settings;
                            for warning in &validated.warnings {
                                warn!(share = %share.id, "{}", warning.status_message());
                                share.record_error(warning);
                            }
                            collector.prepare(&mut share);
                            share.set_collector(collector);
                        }
                        Err(err) => {
                            error!(share = %share.id, "{}", err.status_message());
                            share.record_error(&err);
                            share.degraded = true;
                        }
                    }
                }
                Err(err) => {
                    error!(share = %share.id, plugin = %share.plugin, "{}", err.status_message());
                    share.record_error(&err);
                    share.degraded = true;
                }
            }
        }

        shares.push(share);
    }

    shares
}

/// Collect stats for every share, at most `parallelism` at a time.
pub async fn collect_storage_stats(
    shares: Vec<StorageShare>,
    parallelism: usize,
) -> Vec<StorageShare> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks = JoinSet::new();

    for (index, share) in shares.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            (index, run_share(share).await)
        });
    }

    let mut collected = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(entry) => collected.push(entry),
            Err(err) => error!("collection task panicked: {err}"),
        }
    }

    collected.sort_by_key(|(index, _)| *index);
    collected.into_iter().map(|(_, share)| share).collect()
}

async fn run_share(mut share: StorageShare) -> StorageShare {
    if share.degraded {
        debug!(share = %share.id, "skipping degraded share");
        return share;
    }

    let Some(collector) = share.collector() else {
        return share;
    };

    match collector.collect(&mut share).await {
        Ok(()) => debug!(share = %share.id, "stats collected"),
        Err(err) if err.is_warning() => {
            warn!(share = %share.id, "{}", err.status_message());
            share.record_error(&err);
        }
        Err(err) => {
            error!(share = %share.id, "{}", err.status_message());
            share.record_error(&err);
        }
    }

    share
}

/// Group shares by their configured URL, preserving first-seen order.
pub fn get_storage_endpoints(shares: Vec<StorageShare>) -> Vec<StorageEndpoint> {
    let mut endpoints: Vec<StorageEndpoint> = Vec::new();

    for share in shares {
        match endpoints.iter_mut().find(|e| e.url == share.uri.url) {
            Some(endpoint) => endpoint.add_storage_share(share),
            None => {
                let mut endpoint = StorageEndpoint::new(share.uri.url.clone());
                endpoint.add_storage_share(share);
                endpoints.push(endpoint);
            }
        }
    }

    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn raw(id: &str, url: &str, plugin: &str, settings: &[(&str, &str)]) -> RawShare {
        RawShare {
            id: id.to_string(),
            url: url.to_string(),
            plugin: plugin.to_string(),
            plugin_settings: settings
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn unknown_plugin_degrades_only_its_own_share() {
        let shares = build_storage_shares(vec![
            raw(
                "good",
                "davs://dav.example.org/data",
                "libugrlocplugin_dav.so",
                &[("cli_certificate", "/c.pem"), ("cli_private_key", "/k.pem")],
            ),
            raw(
                "bad",
                "rucio://x.example.org/",
                "libugrlocplugin_rucio.so",
                &[],
            ),
        ]);

        assert_eq!(shares.len(), 2);
        assert!(!shares[0].degraded);
        assert_eq!(shares[0].storageprotocol, "DAV");
        assert!(shares[1].degraded);
        assert!(shares[1].status.contains("UnsupportedPlugin"));
        assert_eq!(shares[1].storageprotocol, "Unknown");
    }

    #[test]
    fn failed_validation_degrades_the_share_but_keeps_it() {
        let shares = build_storage_shares(vec![raw(
            "nocert",
            "davs://dav.example.org/data",
            "libugrlocplugin_dav.so",
            &[],
        )]);
        assert_eq!(shares.len(), 1);
        assert!(shares[0].degraded);
        assert!(shares[0].status.contains("MissingRequiredSetting"));
    }

    #[test]
    fn missing_optional_settings_are_recorded_as_warnings() {
        let shares = build_storage_shares(vec![raw(
            "dav1",
            "davs://dav.example.org/data",
            "libugrlocplugin_dav.so",
            &[("cli_certificate", "/c.pem"), ("cli_private_key", "/k.pem")],
        )]);
        assert!(!shares[0].degraded);
        assert!(shares[0].status.starts_with("[WARN][MissingSetting]"));
        assert!(!shares[0].debug.is_empty());
    }

    #[test]
    fn endpoints_group_by_url_in_first_seen_order() {
        let shares = build_storage_shares(vec![
            raw(
                "a",
                "davs://one.example.org/data",
                "libugrlocplugin_dav.so",
                &[("cli_certificate", "/c"), ("cli_private_key", "/k")],
            ),
            raw(
                "b",
                "davs://two.example.org/data",
                "libugrlocplugin_dav.so",
                &[("cli_certificate", "/c"), ("cli_private_key", "/k")],
            ),
            raw(
                "c",
                "davs://one.example.org/data",
                "libugrlocplugin_dav.so",
                &[("cli_certificate", "/c"), ("cli_private_key", "/k")],
            ),
        ]);

        let endpoints = get_storage_endpoints(shares);
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].url, "davs://one.example.org/data");
        assert_eq!(endpoints[0].storage_shares.len(), 2);
        assert_eq!(endpoints[0].storage_shares[0].id, "a");
        assert_eq!(endpoints[0].storage_shares[1].id, "c");
        assert_eq!(endpoints[1].storage_shares[0].id, "b");
    }

    #[tokio::test]
    async fn degraded_shares_are_skipped_and_order_is_preserved() {
        let shares = build_storage_shares(vec![
            raw(
                "bad",
                "rucio://x.example.org/",
                "libugrlocplugin_rucio.so",
                &[],
            ),
            raw(
                "nocert",
                "davs://dav.example.org/data",
                "libugrlocplugin_dav.so",
                &[],
            ),
        ]);

        let collected = collect_storage_stats(shares, 4).await;
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].id, "bad");
        assert_eq!(collected[1].id, "nocert");
        // Neither share ran a collector; their failure status stands.
        assert!(collected[0].status.contains("UnsupportedPlugin"));
        assert!(collected[1].status.contains("MissingRequiredSetting"));
    }

    /// Serve one canned RFC4331 PROPFIND response and close.
    async fn spawn_dav_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();

            let body = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/</D:href>
    <D:propstat>
      <D:prop>
        <D:quota-used-bytes>500</D:quota-used-bytes>
        <D:quota-available-bytes>1500</D:quota-available-bytes>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
            let response = format!(
                "HTTP/1.1 207 Multi-Status\r\nContent-Type: application/xml\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(response.as_bytes()).await.unwrap();
        });

        addr
    }

    /// Serve one canned ListObjectsV2 page and close.
    async fn spawn_s3_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8192];
            let _ = sock.read(&mut buf).await.unwrap();

            let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>mybucket</Name>
  <Prefix></Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>false</IsTruncated>
  <Contents>
    <Key>a.dat</Key>
    <LastModified>2024-05-01T00:00:00.000Z</LastModified>
    <ETag>&quot;aaa&quot;</ETag>
    <Size>100</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
  <Contents>
    <Key>b.dat</Key>
    <LastModified>2024-05-01T00:00:00.000Z</LastModified>
    <ETag>&quot;bbb&quot;</ETag>
    <Size>200</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
</ListBucketResult>"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/xml\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(response.as_bytes()).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn s3_share_collects_listing_stats_end_to_end() {
        let addr = spawn_s3_endpoint().await;

        let shares = build_storage_shares(vec![raw(
            "s3test",
            &format!("s3://{addr}/mybucket"),
            "libugrlocplugin_s3.so",
            &[
                ("s3.pub_key", "AKIAEXAMPLE"),
                ("s3.priv_key", "secret"),
                ("s3.alternate", "true"),
                ("s3.region", "us-east-1"),
                ("s3.signature_ver", "s3v4"),
                ("storagestats.api", "generic"),
                ("storagestats.quota", "1000"),
                ("ssl_check", "false"),
                ("conn_timeout", "5"),
            ],
        )]);
        assert!(!shares[0].degraded);
        assert_eq!(shares[0].uri.bucket.as_deref(), Some("mybucket"));

        let collected = collect_storage_stats(shares, 1).await;
        let share = &collected[0];
        assert_eq!(share.stats.bytesused, 300, "status: {}", share.status);
        assert_eq!(share.stats.filecount, 2);
        assert_eq!(share.stats.quota, 1000);
        assert_eq!(share.stats.bytesfree, 700);
        assert_eq!(share.status, crate::share::STATUS_OK);
    }

    #[tokio::test]
    async fn dav_share_collects_rfc4331_stats_end_to_end() {
        let addr = spawn_dav_endpoint().await;

        let shares = build_storage_shares(vec![raw(
            "davtest",
            &format!("dav://{addr}/dav"),
            "libugrlocplugin_dav.so",
            &[
                ("cli_certificate", "/no/cert.pem"),
                ("cli_private_key", "/no/key.pem"),
                ("storagestats.api", "rfc4331"),
                ("storagestats.quota", "api"),
                ("ssl_check", "false"),
                ("conn_timeout", "5"),
            ],
        )]);
        assert!(!shares[0].degraded);

        let collected = collect_storage_stats(shares, 1).await;
        let share = &collected[0];
        assert_eq!(share.stats.bytesused, 500, "status: {}", share.status);
        assert_eq!(share.stats.bytesfree, 1500);
        assert_eq!(share.stats.quota, 2000);
        assert_eq!(share.status, crate::share::STATUS_OK);
    }
}
