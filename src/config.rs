//! Relay configuration: `~/.voice-relay/config.toml` plus environment
//! overrides.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{build_transcoder, opus_decoder_factory, TranscoderKind};
use crate::voice::{LinkSettings, LoggingObserver, SessionConfig, SessionDeps};

pub const DEFAULT_API_BASE: &str = "https://api.elevenlabs.io/v1/convai";

pub const ENV_API_KEY: &str = "ELEVENLABS_API_KEY";
pub const ENV_AGENT_ID: &str = "ELEVENLABS_AGENT_ID";
pub const ENV_API_BASE: &str = "VOICE_RELAY_API_BASE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Long-lived credential, exchanged for a signed URL per session.
    pub api_key: String,
    pub agent_id: String,
    pub api_base_url: String,
    pub handshake_timeout_secs: u64,
    /// Trailing silence that ends a speaking turn.
    pub silence_ms: u64,
    pub transcoder: TranscoderKind,
    pub ffmpeg_path: String,
    pub event_buffer: usize,
    /// Default tracing filter; `RUST_LOG` wins when set.
    pub log_filter: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            agent_id: String::new(),
            api_base_url: DEFAULT_API_BASE.to_string(),
            handshake_timeout_secs: 10,
            silence_ms: 500,
            transcoder: TranscoderKind::Native,
            ffmpeg_path: "ffmpeg".to_string(),
            event_buffer: 256,
            log_filter: "voice_relay=info".to_string(),
        }
    }
}

impl RelayConfig {
    /// `~/.voice-relay/config.toml`, if a home directory exists.
    pub fn default_path() -> Option<PathBuf> {
        directories::UserDirs::new()
            .map(|u| u.home_dir().join(".voice-relay").join("config.toml"))
    }

    /// Load from `explicit`, or the default path when it exists, then apply
    /// environment overrides. An explicit path must exist.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = get(ENV_API_KEY) {
            self.api_key = key;
        }
        if let Some(agent) = get(ENV_AGENT_ID) {
            self.agent_id = agent;
        }
        if let Some(base) = get(ENV_API_BASE) {
            self.api_base_url = base;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("api_key is not set (config file or {ENV_API_KEY})");
        }
        if self.agent_id.trim().is_empty() {
            anyhow::bail!("agent_id is not set (config file or {ENV_AGENT_ID})");
        }
        if self.silence_ms == 0 {
            anyhow::bail!("silence_ms must be greater than zero");
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            anyhow::bail!("api_base_url must be an http(s) URL: {}", self.api_base_url);
        }
        Ok(())
    }

    /// Copy with the credential redacted, for display.
    pub fn masked(&self) -> Self {
        let visible: String = self.api_key.chars().take(4).collect();
        let api_key = if self.api_key.is_empty() {
            String::new()
        } else if self.api_key.chars().count() <= 8 {
            "****".to_string()
        } else {
            format!("{visible}****")
        };
        Self {
            api_key,
            ..self.clone()
        }
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            api_base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            agent_id: self.agent_id.clone(),
            event_buffer: self.event_buffer,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            link: self.link_settings(),
            silence: Duration::from_millis(self.silence_ms),
        }
    }

    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.handshake_timeout_secs))
            .build()
            .context("Failed to build HTTP client")
    }

    /// Collaborators for sessions built from this config.
    pub fn session_deps(&self) -> anyhow::Result<SessionDeps> {
        Ok(SessionDeps {
            transcoder: build_transcoder(self.transcoder, &self.ffmpeg_path),
            decoder_factory: opus_decoder_factory(),
            observer: Arc::new(LoggingObserver),
            http: self.http_client()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE);
        assert_eq!(config.silence_ms, 500);
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.transcoder, TranscoderKind::Native);
        assert_eq!(config.event_buffer, 256);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "api_key = \"sk_test_123456\"\nagent_id = \"agent-1\"\ntranscoder = \"ffmpeg\"\nsilence_ms = 750"
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.agent_id, "agent-1");
        assert_eq!(config.transcoder, TranscoderKind::Ffmpeg);
        assert_eq!(config.silence_ms, 750);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert!(config.validate().is_ok());
        assert_eq!(config.session_config().silence, Duration::from_millis(750));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = RelayConfig::load(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn invalid_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "silence_ms = \"soon\"").unwrap();
        assert!(RelayConfig::from_file(&path).is_err());
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_API_KEY, "env-key"),
            (ENV_AGENT_ID, "env-agent"),
            (ENV_API_BASE, "  "),
        ]
        .into_iter()
        .collect();
        let mut config = RelayConfig {
            api_key: "file-key".into(),
            ..RelayConfig::default()
        };
        config.apply_env_overrides(|name| env.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.api_key, "env-key");
        assert_eq!(config.agent_id, "env-agent");
        assert_eq!(config.api_base_url, DEFAULT_API_BASE);
    }

    #[test]
    fn validation_rejects_zero_silence() {
        let config = RelayConfig {
            api_key: "k".into(),
            agent_id: "a".into(),
            silence_ms: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("silence_ms"));
    }

    #[test]
    fn masked_hides_credential() {
        let config = RelayConfig {
            api_key: "sk_live_abcdefghijkl".into(),
            ..RelayConfig::default()
        };
        let masked = config.masked();
        assert_eq!(masked.api_key, "sk_l****");
        assert_eq!(RelayConfig::default().masked().api_key, "");
        let short = RelayConfig {
            api_key: "abc".into(),
            ..RelayConfig::default()
        };
        assert_eq!(short.masked().api_key, "****");
    }

    #[test]
    fn link_settings_carry_credentials() {
        let config = RelayConfig {
            api_key: "k".into(),
            agent_id: "a".into(),
            ..RelayConfig::default()
        };
        let link = config.link_settings();
        assert_eq!(link.api_key, "k");
        assert_eq!(link.agent_id, "a");
        assert_eq!(link.event_buffer, 256);
    }
}
