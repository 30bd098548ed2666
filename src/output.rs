//! Plain-text report for interactive runs.

use crate::memcache;
use crate::share::StorageShare;

/// Render one share's stats block as printed to stdout.
pub fn render_share(share: &StorageShare, cached: Option<&str>, debug: bool) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "\n#####################################################################\n\
         URL: {}\nID: {}\nProtocol: {}\nTime: {}\nQuota: {}\nBytes Used: {}\n\
         Bytes Free: {}\nStatus: {}\n",
        share.uri.url,
        share.id,
        share.storageprotocol,
        share.stats.endtime,
        share.stats.quota,
        share.stats.bytesused,
        share.stats.bytesfree,
        share.status,
    ));

    if let Some(contents) = cached {
        out.push_str(&format!(
            "\nMemcached Index: {}\nMemcached Contents: {}\n",
            memcache::index_for(&share.id),
            contents,
        ));
    }

    if debug && !share.debug.is_empty() {
        out.push_str("\nDebug:\n");
        for line in &share.debug {
            out.push_str(&format!("  {line}\n"));
        }
    }

    out
}

/// Print every share's stats block, pulling the cached record back out
/// of memcached when a cache address is given.
pub async fn to_stdout(shares: &[StorageShare], memcached_addr: Option<&str>, debug: bool) {
    for share in shares {
        let cached = match memcached_addr {
            Some(addr) => {
                let index = memcache::index_for(&share.id);
                match memcache::get(addr, &index).await {
                    Ok(contents) => Some(contents),
                    Err(err) => Some(err.status_message()),
                }
            }
            None => None,
        };
        print!("{}", render_share(share, cached.as_deref(), debug));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawShare;
    use crate::errors::StatsError;
    use std::collections::HashMap;

    fn share() -> StorageShare {
        let raw = RawShare {
            id: "share1".to_string(),
            url: "davs://dav.example.org/data".to_string(),
            plugin: "libugrlocplugin_dav.so".to_string(),
            plugin_settings: HashMap::new(),
        };
        let mut share = StorageShare::new(&raw);
        share.storageprotocol = "DAV".to_string();
        share.stats.quota = 2000;
        share.stats.bytesused = 500;
        share.stats.bytesfree = 1500;
        share
    }

    #[test]
    fn report_carries_all_stats_fields() {
        let rendered = render_share(&share(), None, false);
        assert!(rendered.contains("URL: davs://dav.example.org/data"));
        assert!(rendered.contains("ID: share1"));
        assert!(rendered.contains("Protocol: DAV"));
        assert!(rendered.contains("Quota: 2000"));
        assert!(rendered.contains("Bytes Used: 500"));
        assert!(rendered.contains("Bytes Free: 1500"));
        assert!(rendered.contains("Status: [OK][OK][200]"));
        assert!(!rendered.contains("Memcached"));
        assert!(!rendered.contains("Debug:"));
    }

    #[test]
    fn cached_contents_and_debug_trail_are_optional_sections() {
        let mut share = share();
        share.record_error(&StatsError::QuotaWarning);

        let rendered = render_share(&share, Some("share1%%DAV%%0%%2000%%500%%1500%%ok"), true);
        assert!(rendered.contains("Memcached Index: Ugrstoragestats_share1"));
        assert!(rendered.contains("Memcached Contents: share1%%DAV%%"));
        assert!(rendered.contains("Debug:"));
        assert!(rendered.contains("NoQuotaGiven"));
    }
}
