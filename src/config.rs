//! Configuration discovery and parsing.
//!
//! Configuration is a line-oriented format shared with the federation
//! frontend.  A share-declaration line carries four whitespace-delimited
//! tokens after the `glb.locplugin[]` marker: plugin path, share ID,
//! concurrency (ignored), and URL.  Setting lines are `key: value` where
//! the key's second dot-segment targets either the most recently declared
//! share ID in the current file or the `*` wildcard for a global setting.
//! Globals back-fill every share that lacks a local value; local always
//! wins.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::ConfigError;

/// Marker for a share-declaration line.
const DECLARATION_MARKER: &str = "glb.locplugin[]";

/// Marker for a setting line.
const SETTING_MARKER: &str = "locplugin";

/// Well-known main configuration file of the federation frontend.
const MAIN_CONFIG_FILE: &str = "/etc/ugr/ugr.conf";

/// One share as declared in the configuration, before validation.
#[derive(Debug, Clone)]
pub struct RawShare {
    pub id: String,
    pub url: String,
    /// Filename component of the declared plugin path.
    pub plugin: String,
    pub plugin_settings: HashMap<String, String>,
}

/// Collect the configuration files to read: the well-known main config
/// if present, then any files or `*.conf` directory contents from the
/// caller-supplied paths. Zero readable sources is fatal.
pub fn get_conf_files(config_paths: &[PathBuf]) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();

    let main_config = Path::new(MAIN_CONFIG_FILE);
    if main_config.is_file() {
        files.push(main_config.to_path_buf());
    } else {
        warn!(
            "Main configuration file '{}' not found, skipping. This is normal \
             on hosts that do not run the federation frontend.",
            MAIN_CONFIG_FILE
        );
    }

    for element in config_paths {
        if element.is_dir() {
            let mut conf_files: Vec<PathBuf> = match fs::read_dir(element) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.is_file() && p.extension().map(|ext| ext == "conf").unwrap_or(false)
                    })
                    .collect(),
                Err(err) => {
                    warn!("Could not read directory '{}': {}", element.display(), err);
                    continue;
                }
            };
            conf_files.sort();
            files.extend(conf_files);
        } else if element.is_file() {
            files.push(element.clone());
        } else {
            warn!(
                "Element '{}' is an invalid directory or file name and will be ignored.",
                element.display()
            );
        }
    }

    if files.is_empty() {
        return Err(ConfigError::NoConfigFilesFound {
            paths: config_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        });
    }

    Ok(files)
}

/// Parse the given configuration files into raw share records, in
/// declaration order, with global settings back-filled.
pub fn parse_conf_files(config_files: &[PathBuf]) -> Result<Vec<RawShare>, ConfigError> {
    let mut shares: Vec<RawShare> = Vec::new();
    let mut global_settings: Vec<(String, String)> = Vec::new();

    for config_file in config_files {
        info!("Reading file '{}'", config_file.display());

        let contents = fs::read_to_string(config_file).map_err(|source| ConfigError::Io {
            path: config_file.display().to_string(),
            source,
        })?;

        // Setting lines reference the most recently declared share in the
        // same file scan; the context does not carry across files.
        let mut current_id: Option<String> = None;

        for (index, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            let line_number = index + 1;

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.contains(DECLARATION_MARKER) {
                current_id = parse_declaration_line(line, &mut shares, config_file, line_number);
            } else if line.contains(SETTING_MARKER) {
                parse_setting_line(
                    line,
                    current_id.as_deref(),
                    &mut shares,
                    &mut global_settings,
                    config_file,
                    line_number,
                )?;
            }
            // Any other line belongs to the frontend; ignore it.
        }
    }

    // Back-fill globals onto shares missing that key. Local settings
    // supersede global ones.
    for (setting, value) in &global_settings {
        for share in shares.iter_mut() {
            if !share.plugin_settings.contains_key(setting) {
                debug!(
                    "[{}]Applying global setting '{}': {}",
                    share.id, setting, value
                );
                share
                    .plugin_settings
                    .insert(setting.clone(), value.clone());
            }
        }
    }

    Ok(shares)
}

/// Handle one share-declaration line, returning the declared ID as the
/// new "current share" context. Malformed declarations are logged and
/// skipped without touching the context.
fn parse_declaration_line(
    line: &str,
    shares: &mut Vec<RawShare>,
    config_file: &Path,
    line_number: usize,
) -> Option<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let marker_pos = tokens.iter().position(|t| t.contains(DECLARATION_MARKER))?;
    let rest = &tokens[marker_pos + 1..];

    if rest.len() != 4 {
        warn!(
            "Malformed share declaration at {}:{}, expected 4 tokens after \
             the marker, found {}. Line ignored.",
            config_file.display(),
            line_number,
            rest.len()
        );
        return None;
    }

    let (plugin_path, id, _concurrency, url) = (rest[0], rest[1], rest[2], rest[3]);
    let plugin = plugin_path
        .rsplit('/')
        .next()
        .unwrap_or(plugin_path)
        .to_string();

    info!(
        "Found storage share '{}' using plugin '{}'. Reading configuration.",
        id, plugin
    );

    match shares.iter_mut().find(|s| s.id == id) {
        Some(existing) => {
            existing.url = url.to_string();
            existing.plugin = plugin;
        }
        None => shares.push(RawShare {
            id: id.to_string(),
            url: url.to_string(),
            plugin,
            plugin_settings: HashMap::new(),
        }),
    }

    Some(id.to_string())
}

/// Handle one setting line: either a `*` global or a setting for the
/// current share. A target ID that is not the current share is a fatal
/// parse error.
fn parse_setting_line(
    line: &str,
    current_id: Option<&str>,
    shares: &mut [RawShare],
    global_settings: &mut Vec<(String, String)>,
    config_file: &Path,
    line_number: usize,
) -> Result<(), ConfigError> {
    let (key, value) = match line.split_once(':') {
        Some((k, v)) => (k.trim(), v.trim()),
        None => return Ok(()),
    };

    let target_id = key.split('.').nth(1).unwrap_or_default();

    if target_id == "*" {
        let setting = key.split_once("*.").map(|(_, rest)| rest).unwrap_or(key);
        info!("Found global setting '{}': {}", key, value);
        match global_settings.iter_mut().find(|(s, _)| s == setting) {
            Some(entry) => entry.1 = value.to_string(),
            None => global_settings.push((setting.to_string(), value.to_string())),
        }
        return Ok(());
    }

    match current_id {
        Some(id) if id == target_id => {
            let prefix = format!("{id}.");
            let setting = key
                .split_once(prefix.as_str())
                .map(|(_, rest)| rest)
                .unwrap_or(key);
            debug!("[{}]Found local setting '{}'", id, setting);
            if let Some(share) = shares.iter_mut().find(|s| s.id == id) {
                share
                    .plugin_settings
                    .insert(setting.to_string(), value.to_string());
            }
            Ok(())
        }
        _ => Err(ConfigError::SettingIdMismatch {
            config_file: config_file.display().to_string(),
            line_number,
            line: key.to_string(),
        }),
    }
}
