//! Error types for configuration loading and stats collection.
//!
//! Two severity families exist.  [`ConfigError`] is fatal: the run cannot
//! proceed when configuration cannot be loaded or a setting line references
//! an undeclared share ID.  [`StatsError`] is per-share: it is recorded onto
//! the failing share's `status`/`debug` fields and the batch continues.
//! Warning-class [`StatsError`] variants follow the same recording path but
//! leave any partially collected stats in place.

use thiserror::Error;

/// Fatal configuration errors. Abort the run before any collection.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No readable configuration sources were found at the given paths.
    #[error("[ConfigFileError][000] No configuration files found in paths: {paths:?}")]
    NoConfigFilesFound { paths: Vec<String> },

    /// A setting line's ID segment does not match the most recently
    /// declared share ID in the same file.
    #[error(
        "[SettingIDMismatch][000] Failed to match ID in line {line_number} of file \
         '{config_file}': \"{line}\". Check your configuration."
    )]
    SettingIdMismatch {
        config_file: String,
        line_number: usize,
        line: String,
    },

    /// A configuration file could not be read.
    #[error("[ConfigFileError][000] Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Per-share errors and warnings raised during share construction,
/// settings validation, and stats collection.
///
/// The `Display` form is `[{code}][{status}] message`; prefix with the
/// severity tag via [`StatsError::status_message`] to obtain the string
/// stored in a share's `status` field.
#[derive(Debug, Error, Clone)]
pub enum StatsError {
    /// Generic transport failure contacting an endpoint.
    #[error("[{error}][{status_code}] Failed to establish a connection.")]
    Connection {
        error: String,
        status_code: String,
        debug: String,
    },

    /// The share's URL carries a scheme the transport cannot speak.
    #[error("[InvalidSchema][400] Invalid URL schema \"{schema}\".")]
    ConnectionInvalidSchema { schema: String, debug: String },

    /// Client certificate or private key path could not be used.
    #[error("[ClientCertError][091] Invalid client certificate path \"{certfile}\".")]
    ConnectionDavCertPath { certfile: String, debug: String },

    /// An S3 API request failed or returned an unusable body.
    #[error("[{error}][{status_code}] Error requesting stats using API \"{api}\".")]
    ConnectionS3Api {
        error: String,
        status_code: String,
        api: String,
        debug: String,
    },

    /// An Azure API request failed.
    #[error("[{error}][{status_code}] Error requesting stats using API \"{api}\".")]
    ConnectionAzureApi {
        error: String,
        status_code: String,
        api: String,
        debug: String,
    },

    /// The configured Azure container does not exist.
    #[error("[ContainerNotFound][404] Azure container \"{container}\" not found.")]
    AzureContainerNotFound { container: String, debug: String },

    /// Ceph admin API response carried no bucket usage object.
    #[error("[{error}][{status_code}] Failed to get bucket usage information.")]
    S3MissingBucketUsage {
        error: String,
        status_code: String,
        debug: String,
    },

    /// RFC4331 quota properties are absent: the endpoint does not support
    /// the method. Distinct from an unreachable endpoint.
    #[error("[UnsupportedMethod][071] WebDAV quota method not supported by endpoint.")]
    DavQuotaMethod { debug: String },

    /// The configured plugin has no collector implementation.
    #[error("[UnsupportedPlugin][009] Stats collection for plugin \"{plugin}\" not implemented.")]
    UnsupportedPlugin { plugin: String },

    /// A required setting is absent from the share's configuration.
    #[error("[MissingRequiredSetting][{status_code}] \"{setting}\" is required. Check your configuration.")]
    MissingRequiredSetting {
        setting: String,
        status_code: &'static str,
    },

    /// A setting's value is outside its allowed set.
    #[error(
        "[InvalidSetting][{status_code}] Incorrect value \"{value}\" given in setting \
         \"{setting}\". Valid values: {valid:?}"
    )]
    InvalidSetting {
        setting: String,
        value: String,
        valid: Vec<String>,
        status_code: &'static str,
    },

    /// A quota string was neither "api" nor a parsable byte size.
    #[error("[MalformedQuota][076] Unable to parse quota value \"{value}\".")]
    MalformedQuota { value: String },

    /// The cache sink rejected or never acknowledged a write.
    #[error("[MemcachedConnectionError][400] Failed to connect to memcached.")]
    MemcachedConnection { debug: String },

    /// The requested index does not exist in the cache sink.
    #[error("[MemcachedEmptyIndex][404] Unable to get memcached index \"{index}\" contents.")]
    MemcachedIndex { index: String },

    // -- Warning-class conditions ------------------------------------------
    /// An optional setting was absent and its default applied.
    #[error("[MissingSetting][{status_code}] Unspecified \"{setting}\" setting. Using default value \"{default}\".")]
    MissingSettingWarning {
        setting: String,
        default: String,
        status_code: &'static str,
    },

    /// Quota was requested from the API but none is available there.
    #[error("[NoQuotaGiven][098] No quota obtained from API or configuration file. Using default of 1TB.")]
    QuotaWarning,

    /// Provider reports its bucket quota feature as disabled.
    #[error("[BucketQuotaDisabled][099] Bucket quota is disabled. Using default of 1TB.")]
    CephQuotaDisabledWarning,

    /// RFC4331 reported exactly zero bytes free: either no quota is
    /// configured on the endpoint or it is genuinely full.
    #[error("[ZeroQuota][097] Endpoint reported 0 bytes free. Either no quota is configured or the endpoint is full.")]
    DavZeroQuotaWarning { debug: String },
}

impl StatsError {
    /// Whether this condition is warning-class: recorded like an error but
    /// partial stats remain valid.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            StatsError::MissingSettingWarning { .. }
                | StatsError::QuotaWarning
                | StatsError::CephQuotaDisabledWarning
                | StatsError::DavZeroQuotaWarning { .. }
        )
    }

    /// Severity tag used as the first element of the status triplet.
    pub fn severity(&self) -> &'static str {
        if self.is_warning() {
            "[WARN]"
        } else {
            "[ERROR]"
        }
    }

    /// The full status string recorded on a share: `[SEVERITY][code][status] message`.
    pub fn status_message(&self) -> String {
        format!("{}{}", self.severity(), self)
    }

    /// Transport-level detail carried by this error, if any.
    pub fn debug_detail(&self) -> Option<&str> {
        match self {
            StatsError::Connection { debug, .. }
            | StatsError::ConnectionInvalidSchema { debug, .. }
            | StatsError::ConnectionDavCertPath { debug, .. }
            | StatsError::ConnectionS3Api { debug, .. }
            | StatsError::ConnectionAzureApi { debug, .. }
            | StatsError::AzureContainerNotFound { debug, .. }
            | StatsError::S3MissingBucketUsage { debug, .. }
            | StatsError::DavQuotaMethod { debug }
            | StatsError::MemcachedConnection { debug }
            | StatsError::DavZeroQuotaWarning { debug } => {
                if debug.is_empty() {
                    None
                } else {
                    Some(debug)
                }
            }
            _ => None,
        }
    }

    /// Line appended to a share's debug trail.
    pub fn debug_message(&self) -> String {
        match self.debug_detail() {
            Some(detail) => format!("{} Debug: {}", self.status_message(), detail),
            None => self.status_message(),
        }
    }
}
