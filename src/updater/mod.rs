//! Update checking.
//!
//! A [`Provider`] answers "is there a newer release than the running
//! version, and where do I get it". The default provider polls the GitHub
//! Releases API.

mod github;

pub use github::GithubReleaseProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Result of an update check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub has_update: bool,
    pub latest_version: String,
    pub release_notes: String,
    pub download_url: String,
    pub release_page_url: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn check(
        &self,
        current_version: &str,
        os_name: &str,
        arch_name: &str,
    ) -> Result<UpdateCheck>;
}

pub struct Service {
    provider: Box<dyn Provider>,
}

impl Service {
    pub fn new(provider: Box<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn with_default_provider() -> Self {
        Self::new(Box::new(GithubReleaseProvider::new()))
    }

    /// Check for an update against the running platform.
    pub async fn check(&self, current_version: &str) -> Result<UpdateCheck> {
        self.provider
            .check(current_version, std::env::consts::OS, std::env::consts::ARCH)
            .await
            .map_err(|err| Error::network(err.reason()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(UpdateCheck);

    #[async_trait]
    impl Provider for FixedProvider {
        async fn check(&self, _: &str, _: &str, _: &str) -> Result<UpdateCheck> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_service_delegates_to_provider() {
        let service = Service::new(Box::new(FixedProvider(UpdateCheck {
            has_update: true,
            latest_version: "v1.2.3".to_string(),
            ..Default::default()
        })));
        let result = service.check("v1.0.0").await.expect("check");
        assert!(result.has_update);
        assert_eq!(result.latest_version, "v1.2.3");
    }

    #[test]
    fn test_update_check_json_is_camel_case() {
        let check = UpdateCheck {
            has_update: true,
            latest_version: "v2".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&check).expect("serialize");
        assert!(json.contains("\"hasUpdate\""));
        assert!(json.contains("\"releasePageUrl\""));
    }
}
