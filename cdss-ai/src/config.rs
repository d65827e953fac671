//! Configuration resolution for cdss-ai
//!
//! Turns the bootstrap TOML plus command-line overrides into the settings the
//! HTTP client, the push listener and the orchestrators are built from.
//!
//! **Priority:** CLI → ENV → TOML → compiled default

use cdss_common::config::{self, PushConfig, TomlConfig};
use std::time::Duration;
use tracing::info;

use crate::client::{HttpInferenceApi, SubmitMode};
use crate::error::InferenceResult;
use crate::services::{OrchestratorSettings, PollSettings};

/// Command-line overrides
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    /// Force the push channel off regardless of config
    pub disable_push: bool,
    pub mode: Option<SubmitMode>,
}

/// Fully resolved client settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub push: PushConfig,
    pub orchestrator: OrchestratorSettings,
}

impl ClientSettings {
    pub fn resolve(toml_config: &TomlConfig, overrides: &Overrides) -> Self {
        let base_url = config::resolve_api_base_url(overrides.base_url.as_deref(), toml_config);
        let token = config::resolve_api_token(toml_config);

        let mut push = toml_config.push.clone();
        if overrides.disable_push {
            push.enabled = false;
        }

        let settings = Self {
            base_url,
            token,
            request_timeout: Duration::from_secs(toml_config.request_timeout_secs.max(1)),
            push,
            orchestrator: OrchestratorSettings {
                poll: PollSettings::from(&toml_config.polling),
                label_channels: toml_config.volume.label_channels.clone(),
                mode: overrides.mode.unwrap_or_default(),
            },
        };

        info!(
            base_url = %settings.base_url,
            authenticated = settings.token.is_some(),
            push_enabled = settings.push.enabled,
            max_attempts = settings.orchestrator.poll.max_attempts,
            "Client settings resolved"
        );
        settings
    }

    /// HTTP backend built from these settings
    pub fn http_api(&self) -> InferenceResult<HttpInferenceApi> {
        HttpInferenceApi::builder(self.base_url.clone())
            .token(self.token.clone())
            .timeout(self.request_timeout)
            .build()
    }
}
