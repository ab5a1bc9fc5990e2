use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    clients::bus::QueueTopology,
    models::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,
    #[serde(default = "default_email_queue_name")]
    pub email_queue_name: String,
    #[serde(default = "default_push_queue_name")]
    pub push_queue_name: String,
    #[serde(default = "default_failed_queue_name")]
    pub failed_queue_name: String,
    #[serde(default = "default_dead_letter_routing_key")]
    pub dead_letter_routing_key: String,
    #[serde(default = "default_one_u16")]
    pub prefetch_count: u16,
    #[serde(default = "default_one_usize")]
    pub worker_concurrency: usize,

    pub redis_url: String,
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default = "default_status_ttl")]
    pub status_ttl_seconds: u64,

    #[serde(default)]
    pub database_url: Option<String>,

    pub user_service_url: String,
    pub template_service_url: String,

    pub fcm_project_id: String,
    #[serde(default = "default_fcm_base_url")]
    pub fcm_base_url: String,
    #[serde(default)]
    pub fcm_access_token: Option<String>,

    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    pub smtp_from: String,

    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub circuit_breaker_timeout_seconds: u64,
    #[serde(default = "default_success_threshold")]
    pub circuit_breaker_success_threshold: u32,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub lookup_retry_attempts: u32,
    #[serde(default = "default_lookup_retry_delay")]
    pub lookup_retry_delay_ms: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: i64,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_log_json")]
    pub log_json: bool,
}

fn default_exchange_name() -> String {
    "notifications.direct".to_string()
}

fn default_email_queue_name() -> String {
    "email.queue".to_string()
}

fn default_push_queue_name() -> String {
    "push.queue".to_string()
}

fn default_failed_queue_name() -> String {
    "failed.queue".to_string()
}

fn default_dead_letter_routing_key() -> String {
    "failed".to_string()
}

fn default_one_u16() -> u16 {
    1
}

fn default_one_usize() -> usize {
    1
}

fn default_idempotency_ttl() -> u64 {
    3600
}

fn default_status_ttl() -> u64 {
    86_400
}

fn default_fcm_base_url() -> String {
    "https://fcm.googleapis.com".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    30
}

fn default_success_threshold() -> u32 {
    2
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay() -> u64 {
    1000
}

fn default_max_retry_delay() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> u64 {
    2
}

fn default_lookup_retry_delay() -> u64 {
    100
}

fn default_http_timeout() -> u64 {
    10
}

fn default_rate_limit_max() -> i64 {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_server_port() -> u16 {
    3000
}

fn default_log_json() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))
    }

    /// Parses an explicit set of variables instead of the process environment.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars.into_iter().map(|(k, v)| (k.into(), v.into()));

        envy::from_iter::<_, Self>(vars)
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn lookup_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.lookup_retry_attempts,
            initial_delay_ms: self.lookup_retry_delay_ms,
            max_delay_ms: self.lookup_retry_delay_ms * 10,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            timeout_seconds: self.circuit_breaker_timeout_seconds,
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }

    pub fn topology(&self) -> QueueTopology {
        QueueTopology {
            exchange: self.exchange_name.clone(),
            email_queue: self.email_queue_name.clone(),
            push_queue: self.push_queue_name.clone(),
            dead_letter_queue: self.failed_queue_name.clone(),
            dead_letter_routing_key: self.dead_letter_routing_key.clone(),
        }
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_seconds)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}
