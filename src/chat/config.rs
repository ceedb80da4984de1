// config.rs — effective provider config: request overrides over stored settings
use crate::chat::provider::ProviderAdapter;
use crate::settings::{SettingsMap, API_KEYS, MODELS, TEMPERATURES};
use serde_json::Value;

/// Trim, drop everything outside printable ASCII, trim again. Keys and model
/// names pasted from web pages routinely carry zero-width or full-width
/// characters that make the HTTP header invalid.
pub fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| matches!(c, ' '..='~'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Per-request values that win over stored settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub api_key:     Option<String>,
    pub model:       Option<String>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub api_key:     Option<String>,
    pub model:       String,
    /// Omitted from the request body when None.
    pub temperature: Option<f64>,
}

fn non_empty(raw: &str) -> Option<String> {
    Some(sanitize(raw)).filter(|s| !s.is_empty())
}

fn stored_str(stored: &SettingsMap, key: &str, provider: &str) -> Option<String> {
    stored.get(key)?.get(provider)?.as_str().and_then(non_empty)
}

fn stored_temperature(stored: &SettingsMap, provider: &str) -> Option<f64> {
    match stored.get(TEMPERATURES)?.get(provider)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|t: &f64| t.is_finite())
}

/// Resolve `override > stored > built-in default` for one provider.
///
/// `stored` holds the `apiKeys`, `models` and `temperatures` maps as read from
/// the settings store.
pub fn resolve(stored: &SettingsMap, provider: &dyn ProviderAdapter, overrides: &ConfigOverrides) -> EffectiveConfig {
    let id = provider.id();

    let api_key = overrides
        .api_key
        .as_deref()
        .and_then(non_empty)
        .or_else(|| stored_str(stored, API_KEYS, id));

    let model = overrides
        .model
        .as_deref()
        .and_then(non_empty)
        .or_else(|| stored_str(stored, MODELS, id))
        .unwrap_or_else(|| provider.default_model().to_string());

    let temperature = overrides
        .temperature
        .filter(|t| t.is_finite())
        .or_else(|| stored_temperature(stored, id));

    EffectiveConfig { api_key, model, temperature }
}
