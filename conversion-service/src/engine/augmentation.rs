//! External augmentation (LLM post-processing) capability.
//!
//! Providers form a closed set. The registry is resolved once at startup
//! from configuration: an unknown provider name, or a provider missing the
//! settings it needs, is a startup error rather than a silently disabled
//! feature.

use std::fmt;
use std::str::FromStr;

use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::config::AugmentationConfig;
use crate::error::{ServiceError, ServiceResult};

/// Supported augmentation backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AugmentationProvider {
    Gemini,
    OpenAi,
    Anthropic,
    Ollama,
}

impl AugmentationProvider {
    /// Engine-side service implementing this provider
    pub fn service_path(&self) -> &'static str {
        match self {
            AugmentationProvider::Gemini => "marker.services.gemini.GoogleGeminiService",
            AugmentationProvider::OpenAi => "marker.services.openai.OpenAIService",
            AugmentationProvider::Anthropic => "marker.services.claude.ClaudeService",
            AugmentationProvider::Ollama => "marker.services.ollama.OllamaService",
        }
    }
}

/// A resolved provider with everything the engine needs to use it
#[derive(Clone)]
pub struct AugmentationService {
    pub provider: AugmentationProvider,
    /// Extra command-line arguments for the engine
    pub args: Vec<String>,
    /// Extra environment for the engine process
    pub env: Vec<(String, String)>,
}

impl fmt::Debug for AugmentationService {
    // Arguments and environment carry API keys
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AugmentationService")
            .field("provider", &self.provider)
            .field("service", &self.provider.service_path())
            .finish_non_exhaustive()
    }
}

/// Augmentation capability as configured for this process
#[derive(Debug, Clone, Default)]
pub struct AugmentationRegistry {
    active: Option<AugmentationService>,
}

fn require_key(
    provider: AugmentationProvider,
    name: &str,
    value: &Option<String>,
) -> ServiceResult<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Config {
            message: format!("augmentation provider '{provider}' requires augmentation.{name}"),
        })
}

impl AugmentationRegistry {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build the capability from configuration, failing on bad settings
    pub fn resolve(config: &AugmentationConfig) -> ServiceResult<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let provider = AugmentationProvider::from_str(config.provider.trim()).map_err(|_| {
            let known: Vec<String> = AugmentationProvider::iter().map(|p| p.to_string()).collect();
            ServiceError::Config {
                message: format!(
                    "unknown augmentation provider '{}'; expected one of: {}",
                    config.provider,
                    known.join(", ")
                ),
            }
        })?;

        let mut args = vec![
            "--use_llm".to_string(),
            "--llm_service".to_string(),
            provider.service_path().to_string(),
        ];
        let mut env = Vec::new();

        match provider {
            AugmentationProvider::Gemini => {
                let key = require_key(provider, "google_api_key", &config.google_api_key)?;
                env.push(("GOOGLE_API_KEY".to_string(), key.clone()));
                args.extend(["--gemini_api_key".to_string(), key]);
            }
            AugmentationProvider::OpenAi => {
                let key = require_key(provider, "openai_api_key", &config.openai_api_key)?;
                args.extend(["--openai_api_key".to_string(), key]);
            }
            AugmentationProvider::Anthropic => {
                let key = require_key(provider, "anthropic_api_key", &config.anthropic_api_key)?;
                args.extend(["--claude_api_key".to_string(), key]);
            }
            AugmentationProvider::Ollama => {
                args.extend([
                    "--ollama_base_url".to_string(),
                    config.ollama_base_url.clone(),
                    "--ollama_model".to_string(),
                    config.ollama_model.clone(),
                ]);
            }
        }

        Ok(Self {
            active: Some(AugmentationService {
                provider,
                args,
                env,
            }),
        })
    }

    pub fn active(&self) -> Option<&AugmentationService> {
        self.active.as_ref()
    }

    /// Service for a request, honoring the per-job opt-in
    pub fn for_request(&self, requested: bool) -> Option<&AugmentationService> {
        if requested { self.active() } else { None }
    }

    /// Short label for health output and startup logging
    pub fn describe(&self) -> String {
        match &self.active {
            Some(service) => service.provider.to_string(),
            None => "disabled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> AugmentationConfig {
        AugmentationConfig {
            enabled: true,
            provider: provider.to_string(),
            ..AugmentationConfig::default()
        }
    }

    #[test]
    fn test_disabled_by_default() {
        let registry = AugmentationRegistry::resolve(&AugmentationConfig::default()).unwrap();
        assert!(registry.active().is_none());
        assert!(registry.for_request(true).is_none());
        assert_eq!(registry.describe(), "disabled");
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(AugmentationProvider::from_str("OpenAI").unwrap(), AugmentationProvider::OpenAi);
        assert_eq!(AugmentationProvider::OpenAi.to_string(), "openai");
        assert!(AugmentationProvider::from_str("mistral").is_err());
    }

    #[test]
    fn test_unknown_provider_fails() {
        let err = AugmentationRegistry::resolve(&config("mistral")).unwrap_err();
        assert!(err.to_string().contains("unknown augmentation provider"));
    }

    #[test]
    fn test_missing_key_fails() {
        let err = AugmentationRegistry::resolve(&config("gemini")).unwrap_err();
        assert!(err.to_string().contains("google_api_key"));

        let mut blank = config("anthropic");
        blank.anthropic_api_key = Some("  ".to_string());
        assert!(AugmentationRegistry::resolve(&blank).is_err());
    }

    #[test]
    fn test_gemini_resolves_with_key() {
        let mut gemini = config("gemini");
        gemini.google_api_key = Some("secret".to_string());
        let registry = AugmentationRegistry::resolve(&gemini).unwrap();

        let service = registry.for_request(true).unwrap();
        assert_eq!(service.provider, AugmentationProvider::Gemini);
        assert!(service.args.contains(&"--use_llm".to_string()));
        assert_eq!(service.env, vec![("GOOGLE_API_KEY".to_string(), "secret".to_string())]);
        assert!(registry.for_request(false).is_none());
        assert!(!format!("{service:?}").contains("secret"));
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let registry = AugmentationRegistry::resolve(&config("ollama")).unwrap();
        let service = registry.active().unwrap();
        assert!(service.args.contains(&"qwen3:4b".to_string()));
        assert_eq!(registry.describe(), "ollama");
    }
}
