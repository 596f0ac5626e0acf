use std::{env, fs, path::Path, time::Duration};

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "curation";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub alignment_database_url: String,
    pub review_database_url: String,
    /// JSON vocabulary snapshot. Without one every target renders as unknown.
    pub catalog_path: Option<String>,
    pub catalog_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            alignment_database_url: "sqlite://./data/alignments.db".into(),
            review_database_url: "sqlite://./data/review.db".into(),
            catalog_path: None,
            catalog_timeout_ms: 750,
        }
    }
}

impl Settings {
    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(DEFAULT_SETTINGS_FILE)
}

/// Layers defaults, the optional settings file, plain environment aliases and
/// `APP__*` variables, later layers winning.
pub fn load_settings_from(file: &str) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let settings = Config::builder()
        .set_default("server_bind", defaults.server_bind)?
        .set_default("alignment_database_url", defaults.alignment_database_url)?
        .set_default("review_database_url", defaults.review_database_url)?
        .set_default("catalog_timeout_ms", defaults.catalog_timeout_ms)?
        .add_source(File::with_name(file).required(false))
        .set_override_option("server_bind", legacy_alias("SERVER_BIND", "server_bind"))?
        .set_override_option(
            "alignment_database_url",
            legacy_alias("ALIGNMENT_DATABASE_URL", "alignment_database_url"),
        )?
        .set_override_option(
            "review_database_url",
            legacy_alias("REVIEW_DATABASE_URL", "review_database_url"),
        )?
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to load settings from '{file}'"))?;

    settings
        .try_deserialize()
        .context("invalid settings")
}

/// Plain variable that only applies when the matching `APP__*` one is unset.
fn legacy_alias(variable: &str, key: &str) -> Option<String> {
    let app_variable = format!("APP__{}", key.to_uppercase());
    if env::var_os(app_variable).is_some() {
        return None;
    }
    env::var(variable).ok()
}

pub fn prepare_database_url(raw_database_url: &str, fallback: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url, fallback);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str, fallback: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return fallback.to_string();
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if has_windows_drive(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn has_windows_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    if database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
