use serde::{Deserialize, Serialize};

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsCliConfig {
    pub binary: String,
    pub kubectl_binary: String,
    pub region: String,
    pub profile: Option<String>,
    /// Seconds `kubectl delete namespace` may wait for finalizers
    pub namespace_delete_timeout_secs: u64,
}

impl Default for AwsCliConfig {
    fn default() -> Self {
        Self {
            binary: "aws".to_string(),
            kubectl_binary: "kubectl".to_string(),
            region: DEFAULT_REGION.to_string(),
            profile: None,
            namespace_delete_timeout_secs: 300,
        }
    }
}

impl AwsCliConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.binary.is_empty() {
            return Err("AWS CLI binary cannot be empty".to_string());
        }

        if self.kubectl_binary.is_empty() {
            return Err("kubectl binary cannot be empty".to_string());
        }

        if self.region.is_empty() {
            return Err("Region cannot be empty".to_string());
        }

        if let Some(profile) = &self.profile {
            if profile.trim().is_empty() {
                return Err("Profile cannot be blank when set".to_string());
            }
        }

        if self.namespace_delete_timeout_secs == 0 {
            return Err("Namespace delete timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AwsCliConfig::default();
        assert_eq!(config.binary, "aws");
        assert_eq!(config.region, "us-east-1");
        assert!(config.profile.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = AwsCliConfig::new()
            .with_binary("/usr/local/bin/aws")
            .with_region("eu-west-2")
            .with_profile("demos");

        assert_eq!(config.binary, "/usr/local/bin/aws");
        assert_eq!(config.region, "eu-west-2");
        assert_eq!(config.profile.as_deref(), Some("demos"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AwsCliConfig::default();

        config.binary = "".to_string();
        assert!(config.validate().is_err());

        config.binary = "aws".to_string();
        config.region = "".to_string();
        assert!(config.validate().is_err());

        config.region = "us-east-1".to_string();
        config.profile = Some("  ".to_string());
        assert!(config.validate().is_err());

        config.profile = None;
        config.namespace_delete_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
