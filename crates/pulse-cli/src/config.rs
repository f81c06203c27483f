//! Configuration loading.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use pulse_client::ClientConfig;

/// Loads configuration, optionally from a specific file.
///
/// Later sources win: defaults, `<config dir>/pulse/config.toml`, the given
/// file, then `PULSE_*` environment variables (`__` separates nested keys,
/// e.g. `PULSE_BACKOFF__MAX_MS`).
#[expect(
    clippy::result_large_err,
    reason = "figment::Error is large but only returned at startup"
)]
pub fn load_from(config_path: Option<&Path>) -> Result<ClientConfig, figment::Error> {
    let mut figment = Figment::from(Serialized::defaults(ClientConfig {
        client_name: "pulse-cli".to_string(),
        ..ClientConfig::default()
    }));

    if let Some(config_dir) = dirs_config_path() {
        figment = figment.merge(Toml::file(config_dir.join("config.toml")));
    }

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("PULSE_").split("__"));

    figment.extract()
}

/// Returns the platform-specific config directory for pulse.
///
/// On Linux: `~/.config/pulse`
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("pulse"))
}
