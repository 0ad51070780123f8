//! Configuration traits shared by every pattern config

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::result::ResilienceResult;

/// Common behaviour of pattern configurations
///
/// Configs are plain serde values sourced by an external loader; the engine
/// only validates them. Validation errors name the offending field as a
/// dotted path (`retry.multiplier`).
pub trait ResilienceConfig:
    Send + Sync + Serialize + DeserializeOwned + Clone + PartialEq + 'static
{
    /// Section name used as the field-path prefix in validation errors
    const SECTION: &'static str;

    /// Validate configuration
    fn validate(&self) -> ResilienceResult<()>;

    /// Get default configuration
    fn default_config() -> Self
    where
        Self: Sized;
}

/// Dotted field path inside a config section
pub(crate) fn field<C: ResilienceConfig>(name: &str) -> String {
    format!("{}.{name}", C::SECTION)
}
