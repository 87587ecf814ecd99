use std::env;

pub const DEFAULT_INFERENCE_API_URL: &str = "https://detect.roboflow.com";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("incomplete inference configuration, missing: {}", .0.join(", "))]
    MissingValues(Vec<String>),
}

/// Connection settings for the remote vision-inference service.
///
/// Read once per background run from the process environment. The background
/// task re-reads its own copy instead of borrowing the caller's so a
/// misconfigured worker fails on its own terms.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub api_url: String,
    pub api_key: String,
    pub workspace: String,
    pub project: String,
    pub workflow_id: String,
    pub timeout_secs: u64,
}

impl RemoteConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env::var("INFERENCE_API_URL")
                .unwrap_or_else(|_| DEFAULT_INFERENCE_API_URL.to_string()),
            api_key: env::var("INFERENCE_API_KEY").unwrap_or_default(),
            workspace: env::var("INFERENCE_WORKSPACE").unwrap_or_default(),
            project: env::var("INFERENCE_PROJECT").unwrap_or_default(),
            workflow_id: env::var("INFERENCE_WORKFLOW_ID").unwrap_or_default(),
            timeout_secs: env::var("INFERENCE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Names of the required fields that are empty. All five must be present
    /// before any photo is sent to the service.
    pub fn missing_fields(&self) -> Vec<String> {
        let required = [
            ("api_url", &self.api_url),
            ("api_key", &self.api_key),
            ("workspace", &self.workspace),
            ("project", &self.project),
            ("workflow_id", &self.workflow_id),
        ];
        required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingValues(missing))
        }
    }
}

/// Process-level settings for the HTTP server and local stores.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub asset_root: String,
    pub database_path: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8081),
            asset_root: env::var("PUBLIC_ASSET_ROOT").unwrap_or_else(|_| "static".to_string()),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/classification.db".to_string()),
        }
    }
}
