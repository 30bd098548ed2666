//! Declarative validation of raw share settings.
//!
//! Each protocol contributes a rule table declaring which settings are
//! required, their defaults, their allowed values, and whether they are
//! boolean-coerced.  Rule tables are immutable statics constructed once;
//! validation is applied independently per share.

use std::collections::HashMap;

use crate::errors::StatsError;
use crate::share::SettingValue;

/// Validation rule for one setting.
#[derive(Debug, Clone, Copy)]
pub struct SettingRule {
    pub required: bool,
    /// Default applied when an optional setting is absent.
    pub default: Option<&'static str>,
    /// Allowed values, case-insensitive. Empty means unrestricted.
    pub valid: &'static [&'static str],
    /// Coerce `false`/`no` to false, anything else to true.
    pub boolean: bool,
    /// Tag used in error/warning status strings for this setting.
    pub status_code: &'static str,
}

impl SettingRule {
    pub const fn optional(default: &'static str, status_code: &'static str) -> Self {
        SettingRule {
            required: false,
            default: Some(default),
            valid: &[],
            boolean: false,
            status_code,
        }
    }

    pub const fn required(status_code: &'static str) -> Self {
        SettingRule {
            required: true,
            default: None,
            valid: &[],
            boolean: false,
            status_code,
        }
    }
}

/// Rules shared by every protocol.
pub const BASE_RULES: &[(&str, SettingRule)] = &[
    (
        "storagestats.quota",
        SettingRule::optional("api", "030"),
    ),
    (
        "ssl_check",
        SettingRule {
            required: false,
            default: Some("true"),
            valid: &["true", "false", "yes", "no"],
            boolean: true,
            status_code: "005",
        },
    ),
    ("conn_timeout", SettingRule::optional("10", "006")),
];

/// Outcome of validating one share's settings.
#[derive(Debug)]
pub struct ValidatedSettings {
    /// All raw settings carried through, with defaults filled in,
    /// booleans coerced, and the quota resolved to bytes when fixed.
    pub settings: HashMap<String, SettingValue>,
    /// Missing-optional-setting notes, in rule order.
    pub warnings: Vec<StatsError>,
}

/// Validate `raw` against the base rules plus `protocol_rules`.
///
/// A missing required setting or an out-of-set value is a hard per-share
/// error; the caller degrades the share and the batch continues.
pub fn validate_settings(
    raw: &HashMap<String, String>,
    protocol_rules: &[(&str, SettingRule)],
) -> Result<ValidatedSettings, StatsError> {
    let mut settings: HashMap<String, SettingValue> = raw
        .iter()
        .map(|(k, v)| (k.clone(), SettingValue::Str(v.clone())))
        .collect();
    let mut warnings = Vec::new();

    for (name, rule) in BASE_RULES.iter().chain(protocol_rules.iter()) {
        match raw.get(*name) {
            None => {
                if rule.required {
                    return Err(StatsError::MissingRequiredSetting {
                        setting: name.to_string(),
                        status_code: rule.status_code,
                    });
                }
                let default = rule.default.unwrap_or("");
                warnings.push(StatsError::MissingSettingWarning {
                    setting: name.to_string(),
                    default: default.to_string(),
                    status_code: rule.status_code,
                });
                settings.insert(name.to_string(), SettingValue::Str(default.to_string()));
            }
            Some(value) => {
                if !rule.valid.is_empty()
                    && !rule
                        .valid
                        .iter()
                        .any(|v| v.eq_ignore_ascii_case(value.trim()))
                {
                    return Err(StatsError::InvalidSetting {
                        setting: name.to_string(),
                        value: value.clone(),
                        valid: rule.valid.iter().map(|v| v.to_string()).collect(),
                        status_code: rule.status_code,
                    });
                }
            }
        }

        if rule.boolean {
            let coerced = match settings.get(*name) {
                Some(SettingValue::Str(s)) => {
                    Some(!matches!(s.to_lowercase().as_str(), "false" | "no"))
                }
                _ => None,
            };
            if let Some(value) = coerced {
                settings.insert(name.to_string(), SettingValue::Bool(value));
            }
        }
    }

    // Quota is special: the literal "api" means provider-reported quota,
    // anything else must parse as an absolute byte size.
    let quota = match settings.get("storagestats.quota") {
        Some(SettingValue::Str(q)) if !q.eq_ignore_ascii_case("api") => Some(q.clone()),
        _ => None,
    };
    if let Some(quota) = quota {
        let bytes = convert_size_to_bytes(&quota)?;
        settings.insert(
            "storagestats.quota".to_string(),
            SettingValue::Bytes(bytes),
        );
    }

    Ok(ValidatedSettings { settings, warnings })
}

/// Size suffixes, longest match first. Binary units are powers of 1024,
/// decimal units powers of 1000.
const SIZE_SUFFIXES: &[(&str, u64)] = &[
    ("kib", 1024),
    ("mib", 1024 * 1024),
    ("gib", 1024 * 1024 * 1024),
    ("tib", 1024u64.pow(4)),
    ("pib", 1024u64.pow(5)),
    ("kb", 1000),
    ("mb", 1_000_000),
    ("gb", 1_000_000_000),
    ("tb", 1000u64.pow(4)),
    ("pb", 1000u64.pow(5)),
    ("b", 1),
];

/// Convert a size string like `1TiB`, `2GB`, or `500` into bytes.
///
/// Malformed input fails rather than silently truncating.
pub fn convert_size_to_bytes(size: &str) -> Result<u64, StatsError> {
    let trimmed = size.trim();
    let lower = trimmed.to_lowercase();

    for (suffix, multiplier) in SIZE_SUFFIXES {
        if let Some(number) = lower.strip_suffix(suffix) {
            let number = number.trim();
            return number
                .parse::<u64>()
                .ok()
                .and_then(|n| n.checked_mul(*multiplier))
                .ok_or_else(|| StatsError::MalformedQuota {
                    value: size.to_string(),
                });
        }
    }

    trimmed
        .parse::<u64>()
        .map_err(|_| StatsError::MalformedQuota {
            value: size.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const TEST_RULES: &[(&str, SettingRule)] = &[
        ("proto.key", SettingRule::required("021")),
        (
            "proto.mode",
            SettingRule {
                required: false,
                default: Some("generic"),
                valid: &["generic", "admin"],
                boolean: false,
                status_code: "070",
            },
        ),
    ];

    #[test]
    fn missing_required_setting_is_an_error() {
        let err = validate_settings(&raw(&[]), TEST_RULES).unwrap_err();
        match err {
            StatsError::MissingRequiredSetting { setting, .. } => {
                assert_eq!(setting, "proto.key")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_optional_settings_fall_back_with_warnings() {
        let validated =
            validate_settings(&raw(&[("proto.key", "secret")]), TEST_RULES).unwrap();
        assert_eq!(
            validated.settings.get("proto.mode"),
            Some(&SettingValue::Str("generic".to_string()))
        );
        assert_eq!(
            validated.settings.get("conn_timeout"),
            Some(&SettingValue::Str("10".to_string()))
        );
        // One warning per absent optional setting.
        assert!(validated
            .warnings
            .iter()
            .any(|w| w.to_string().contains("proto.mode")));
    }

    #[test]
    fn out_of_set_value_is_an_error() {
        let err = validate_settings(
            &raw(&[("proto.key", "secret"), ("proto.mode", "bogus")]),
            TEST_RULES,
        )
        .unwrap_err();
        assert!(matches!(err, StatsError::InvalidSetting { .. }));
    }

    #[test]
    fn allowed_values_match_case_insensitively() {
        let validated = validate_settings(
            &raw(&[("proto.key", "secret"), ("proto.mode", "ADMIN")]),
            TEST_RULES,
        )
        .unwrap();
        assert_eq!(
            validated.settings.get("proto.mode"),
            Some(&SettingValue::Str("ADMIN".to_string()))
        );
    }

    #[test]
    fn booleans_are_coerced() {
        let validated = validate_settings(
            &raw(&[("proto.key", "k"), ("ssl_check", "No")]),
            TEST_RULES,
        )
        .unwrap();
        assert_eq!(
            validated.settings.get("ssl_check"),
            Some(&SettingValue::Bool(false))
        );

        let validated = validate_settings(
            &raw(&[("proto.key", "k"), ("ssl_check", "yes")]),
            TEST_RULES,
        )
        .unwrap();
        assert_eq!(
            validated.settings.get("ssl_check"),
            Some(&SettingValue::Bool(true))
        );
    }

    #[test]
    fn quota_resolves_to_bytes_unless_api() {
        let validated = validate_settings(
            &raw(&[("proto.key", "k"), ("storagestats.quota", "2GB")]),
            TEST_RULES,
        )
        .unwrap();
        assert_eq!(
            validated.settings.get("storagestats.quota"),
            Some(&SettingValue::Bytes(2_000_000_000))
        );

        let validated = validate_settings(
            &raw(&[("proto.key", "k"), ("storagestats.quota", "API")]),
            TEST_RULES,
        )
        .unwrap();
        assert_eq!(
            validated.settings.get("storagestats.quota"),
            Some(&SettingValue::Str("API".to_string()))
        );
    }

    #[test]
    fn malformed_quota_is_an_error() {
        let err = validate_settings(
            &raw(&[("proto.key", "k"), ("storagestats.quota", "1024x")]),
            TEST_RULES,
        )
        .unwrap_err();
        assert!(matches!(err, StatsError::MalformedQuota { .. }));
    }

    #[test]
    fn convert_size_suffix_table() {
        assert_eq!(convert_size_to_bytes("1TiB").unwrap(), 1024u64.pow(4));
        assert_eq!(convert_size_to_bytes("2GB").unwrap(), 2 * 1000u64.pow(3));
        assert_eq!(convert_size_to_bytes("500").unwrap(), 500);
        assert_eq!(convert_size_to_bytes("500b").unwrap(), 500);
        assert_eq!(convert_size_to_bytes("10kib").unwrap(), 10 * 1024);
        assert_eq!(convert_size_to_bytes("1pb").unwrap(), 1000u64.pow(5));
    }

    #[test]
    fn convert_size_longest_suffix_wins() {
        // "1kib" must match kib (1024), not the bare "b" suffix.
        assert_eq!(convert_size_to_bytes("1KiB").unwrap(), 1024);
        assert_eq!(convert_size_to_bytes("1KB").unwrap(), 1000);
    }

    #[test]
    fn convert_size_rejects_malformed_input() {
        assert!(convert_size_to_bytes("1024x").is_err());
        assert!(convert_size_to_bytes("").is_err());
        assert!(convert_size_to_bytes("tb").is_err());
    }
}
