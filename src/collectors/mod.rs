//! Protocol collectors.
//!
//! Every protocol implements [`Collector`].  The factory maps the plugin
//! identifier from a share declaration to the collector for its wire
//! protocol; unknown plugins produce a per-share error so the caller can
//! degrade the share without aborting the batch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::errors::StatsError;
use crate::share::StorageShare;
use crate::validate::SettingRule;

pub mod azure;
pub mod dav;
pub mod s3;

/// Stats-collection contract for one wire protocol.
pub trait Collector: Send + Sync + std::fmt::Debug {
    /// Short protocol name used in status output and cache records.
    fn protocol(&self) -> &'static str;

    /// Protocol-specific validation rules, applied on top of
    /// [`crate::validate::BASE_RULES`].
    fn rules(&self) -> &'static [(&'static str, SettingRule)];

    /// Finalize the share's URI after validation: scheme adjustments and
    /// protocol-specific extras (bucket, account, container).
    fn prepare(&self, share: &mut StorageShare);

    /// Contact the endpoint and populate the share's stats block.
    /// Warning-class results leave partial stats in place.
    fn collect<'a>(
        &'a self,
        share: &'a mut StorageShare,
    ) -> Pin<Box<dyn Future<Output = Result<(), StatsError>> + Send + 'a>>;
}

/// Map a declared plugin identifier to its protocol collector.
///
/// DAV and plain HTTP plugins share the DAV collector. An unknown plugin
/// yields an error the caller records on a degraded placeholder share.
pub fn factory(plugin: &str) -> Result<Arc<dyn Collector>, StatsError> {
    match plugin {
        "libugrlocplugin_dav.so" | "libugrlocplugin_http.so" => {
            Ok(Arc::new(dav::DavCollector))
        }
        "libugrlocplugin_s3.so" => Ok(Arc::new(s3::S3Collector)),
        "libugrlocplugin_azure.so" => Ok(Arc::new(azure::AzureCollector)),
        other => Err(StatsError::UnsupportedPlugin {
            plugin: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_plugins_map_to_their_collectors() {
        assert_eq!(factory("libugrlocplugin_dav.so").unwrap().protocol(), "DAV");
        assert_eq!(
            factory("libugrlocplugin_http.so").unwrap().protocol(),
            "DAV"
        );
        assert_eq!(factory("libugrlocplugin_s3.so").unwrap().protocol(), "S3");
        assert_eq!(
            factory("libugrlocplugin_azure.so").unwrap().protocol(),
            "Azure"
        );
    }

    #[test]
    fn unknown_plugin_is_a_per_share_error() {
        let err = factory("libugrlocplugin_rucio.so").unwrap_err();
        match err {
            StatsError::UnsupportedPlugin { plugin } => {
                assert_eq!(plugin, "libugrlocplugin_rucio.so")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
