use std::time::Duration;

use queue_agent_core::runtime::RuntimeKind;

/// Longest long-poll wait the queue accepts.
const MAX_WAIT_TIME_SECS: u64 = 20;

/// Errors from loading [`WorkerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("Unsupported runtime type '{0}'")]
    UnsupportedRuntime(String),
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Region override for the AWS clients. `None` uses the SDK chain.
    pub region: Option<String>,
    pub queue_url: String,
    pub topic_arn: String,
    pub bucket: String,
    pub runtime_kind: RuntimeKind,
    /// Name reported in every notification.
    pub runtime_name: String,
    /// Backend address as `host:port`.
    pub api_base_url: String,
    /// Publish a `running` notification before invoking the runtime.
    pub callback_when_running: bool,
    /// Verbosity for the worker's own crates.
    pub log_level: tracing::Level,
    pub tracing_enabled: bool,
    /// Long-poll wait per receive.
    pub wait_time: Duration,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                     | Default          |
    /// |-----------------------------|------------------|
    /// | `AWS_DEFAULT_REGION`        | SDK default      |
    /// | `SQS_QUEUE_URL`             | required         |
    /// | `SNS_TOPIC_ARN`             | required         |
    /// | `S3_BUCKET`                 | required         |
    /// | `RUNTIME_TYPE`              | required         |
    /// | `RUNTIME_NAME`              | `""`             |
    /// | `API_BASE_URL`              | `localhost:8080` |
    /// | `EXP_CALLBACK_WHEN_RUNNING` | `false`          |
    /// | `LOGLEVEL`                  | `INFO`           |
    /// | `DISABLE_XRAY`              | `false`          |
    /// | `SQS_WAIT_TIME_SECONDS`     | `20`             |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let queue_url = required("SQS_QUEUE_URL")?;
        let topic_arn = required("SNS_TOPIC_ARN")?;
        let bucket = required("S3_BUCKET")?;

        let runtime_type = required("RUNTIME_TYPE")?;
        let runtime_kind: RuntimeKind = runtime_type.parse().map_err(|_| ConfigError::Invalid {
            name: "RUNTIME_TYPE",
            value: runtime_type.clone(),
        })?;
        if runtime_kind != RuntimeKind::ComfyUI {
            return Err(ConfigError::UnsupportedRuntime(runtime_kind.to_string()));
        }

        let log_level = match lookup("LOGLEVEL").filter(|v| !v.trim().is_empty()) {
            Some(v) => parse_log_level(&v).ok_or(ConfigError::Invalid {
                name: "LOGLEVEL",
                value: v.clone(),
            })?,
            None => tracing::Level::INFO,
        };

        let wait_secs = match lookup("SQS_WAIT_TIME_SECONDS") {
            Some(v) => v.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                name: "SQS_WAIT_TIME_SECONDS",
                value: v.clone(),
            })?,
            None => MAX_WAIT_TIME_SECS,
        };

        Ok(Self {
            region: lookup("AWS_DEFAULT_REGION").filter(|v| !v.is_empty()),
            queue_url,
            topic_arn,
            bucket,
            runtime_kind,
            runtime_name: lookup("RUNTIME_NAME").unwrap_or_default(),
            api_base_url: lookup("API_BASE_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "localhost:8080".into()),
            callback_when_running: flag(lookup("EXP_CALLBACK_WHEN_RUNNING")),
            log_level,
            tracing_enabled: !flag(lookup("DISABLE_XRAY")),
            wait_time: Duration::from_secs(wait_secs.min(MAX_WAIT_TIME_SECS)),
        })
    }

    /// Name of the per-message trace span.
    pub fn segment_name(&self) -> String {
        format!("{}-queue-agent", self.runtime_name)
    }

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> String {
        format!("queue_agent={}", self.log_level.to_string().to_lowercase())
    }

    /// Log the effective configuration once at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            region = self.region.as_deref().unwrap_or("<sdk default>"),
            queue_url = %self.queue_url,
            topic_arn = %self.topic_arn,
            bucket = %self.bucket,
            runtime_type = %self.runtime_kind,
            runtime_name = %self.runtime_name,
            api_base_url = %self.api_base_url,
            callback_when_running = self.callback_when_running,
            tracing = if self.tracing_enabled { "Enabled" } else { "Disabled" },
            wait_secs = self.wait_time.as_secs(),
            "Effective configuration",
        );
    }
}

/// Accepts `tracing` level names and the `WARNING`, `CRITICAL` and
/// `FATAL` spellings used by existing deployments.
fn parse_log_level(raw: &str) -> Option<tracing::Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "error" | "critical" | "fatal" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

/// `true` only for a case-insensitive `"true"`.
fn flag(value: Option<String>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}
