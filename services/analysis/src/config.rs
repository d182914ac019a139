use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the analysis service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Document store (SODA REST) configuration
    pub document_store: DocumentStoreConfig,
    /// Credential resolution configuration
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Object store configuration
    pub object_store: ObjectStoreConfig,
    /// Vision analysis configuration
    pub analysis: AnalysisConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Document store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentStoreConfig {
    /// ORDS root URL, e.g. `https://host/ords/`
    pub base_url: String,
    /// Schema segment of the SODA path (lowercase)
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Collection holding analysis documents
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retry attempts for transient network failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum retry delay in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Credential sources, tried in order: vault secret, operator config, static fallback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    /// Secret reference holding the store username
    pub username_secret_ref: Option<String>,
    /// Secret reference holding the store password
    pub password_secret_ref: Option<String>,
    /// Operator-supplied username
    pub username: Option<String>,
    /// Operator-supplied password
    pub password: Option<String>,
    /// Development-only fallback credential
    #[serde(default)]
    pub static_fallback: StaticFallbackConfig,
}

/// Development-only credential. Never enable in production.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticFallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fallback_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Object store configuration (S3-compatible)
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Bucket holding uploaded images
    pub bucket: String,
    /// Region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (S3-compatible stores, MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    /// Force path-style access
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Vision analysis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Analyze-image endpoint
    pub endpoint_url: String,
    /// Compartment passed along with analysis requests
    pub compartment_id: Option<String>,
    /// Object storage namespace used in image references
    #[serde(default)]
    pub namespace: String,
    /// Analysis timeout in seconds
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum detected objects per image
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Send image bytes inline instead of an object storage reference
    #[serde(default)]
    pub inline_image_bytes: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Concurrent lookups when listing the gallery
    #[serde(default = "default_list_concurrency")]
    pub list_concurrency: usize,
}

// Default value functions
fn default_service_name() -> String {
    "analysis-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_schema() -> String {
    "admin".to_string()
}

fn default_collection() -> String {
    "IMAGE_ANALYSIS".to_string()
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}

fn default_fallback_username() -> String {
    "ADMIN".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_analysis_timeout_secs() -> u64 {
    30
}

fn default_max_results() -> u32 {
    10
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_list_concurrency() -> usize {
    8
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "analysis-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/analysis").required(false))
            .add_source(config::File::with_name("/etc/analysis/analysis").required(false))
            // ANALYSIS__DOCUMENT_STORE__BASE_URL -> document_store.base_url
            .add_source(
                config::Environment::with_prefix("ANALYSIS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.object_store.presigned_url_expiry_secs)
    }

    /// Get analysis timeout as Duration
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis.timeout_secs)
    }
}

impl DocumentStoreConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// SODA endpoint for this store: `{base}/{schema}/soda/latest`
    pub fn soda_url(&self) -> String {
        format!(
            "{}/{}/soda/latest",
            self.base_url.trim_end_matches('/'),
            self.schema.trim_matches('/')
        )
    }

    /// Config pointing at a base URL with every other field defaulted
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            schema: default_schema(),
            collection: default_collection(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StaticFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: default_fallback_username(),
            password: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            list_concurrency: default_list_concurrency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_request_timeout_secs(), 5);
        assert_eq!(default_analysis_timeout_secs(), 30);
        assert_eq!(default_collection(), "IMAGE_ANALYSIS");
        assert!(!StaticFallbackConfig::default().enabled);
    }

    #[test]
    fn test_soda_url_trims_slashes() {
        let config = DocumentStoreConfig::with_base_url("https://db.example.com/ords/");
        assert_eq!(
            config.soda_url(),
            "https://db.example.com/ords/admin/soda/latest"
        );

        let config = DocumentStoreConfig::with_base_url("http://localhost:8181/ords");
        assert_eq!(config.soda_url(), "http://localhost:8181/ords/admin/soda/latest");
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let raw = serde_json::json!({
            "document_store": { "base_url": "http://localhost/ords/" },
            "object_store": { "bucket": "images" },
            "analysis": { "endpoint_url": "http://vision.local/analyzeImage" }
        });

        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(config.service.name, "analysis-service");
        assert_eq!(config.document_store.max_retries, 3);
        assert_eq!(config.analysis.max_results, 10);
        assert_eq!(config.api.port, 8080);
        assert!(config.credentials.password_secret_ref.is_none());
        assert_eq!(config.analysis_timeout(), Duration::from_secs(30));
    }
}
