//! Consumer-side + database configuration, following
//! `identity-auth/src/config.rs`'s `from_env` shape.

use std::env;

/// Database connection settings for the outbox/inbox repository (§6.1).
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub schema: String,
    pub max_connections: u32,
    pub statement_timeout_ms: u64,
}

impl DbConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string()).parse()?,
            name: env::var("DB_NAME")?,
            user: env::var("DB_USER")?,
            password: env::var("DB_PASS")?,
            schema: env::var("DB_SCHEMA").unwrap_or_else(|_| "public".to_string()),
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            statement_timeout_ms: env::var("DB_STATEMENT_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
        })
    }

    pub fn connection_uri(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Scalar-or-sequence backoff configuration as read from the environment
/// (§4.2.4, §6.1 `backoff`).
#[derive(Debug, Clone)]
pub enum BackoffSetting {
    Scalar(f64),
    Sequence(Vec<f64>),
}

impl BackoffSetting {
    fn from_env_var(raw: &str) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(rest) = raw.strip_prefix('[') {
            let rest = rest.trim_end_matches(']');
            let steps = rest
                .split(',')
                .map(|s| s.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(BackoffSetting::Sequence(steps))
        } else {
            Ok(BackoffSetting::Scalar(raw.trim().parse::<f64>()?))
        }
    }

    /// Convert to the millisecond-based policy the retry machinery uses.
    /// §4.2.4 gives `backoff` in seconds.
    pub fn into_policy(self) -> event_bus::BackoffPolicy {
        match self {
            BackoffSetting::Scalar(secs) => event_bus::BackoffPolicy::Scalar(secs * 1000.0),
            BackoffSetting::Sequence(steps) => {
                event_bus::BackoffPolicy::Sequence(steps.iter().map(|s| s * 1000.0).collect())
            }
        }
    }
}

/// Consumer runtime behavior (§6.1 "Consumer behavior").
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub project: String,
    pub service_name: String,
    pub tries: u32,
    pub backoff: BackoffSetting,
    pub prefetch: u16,
    pub handler_timeout_sec: u64,
    pub max_jobs_per_connection: Option<u64>,
    pub inbox_lock_stale_threshold_sec: i64,
    pub outage_sleep_sec: u64,
    pub statsd_sample_ok: f64,
    pub statsd_sample_payload: f64,
    pub pod_name: Option<String>,
}

impl ConsumerConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let backoff_raw = env::var("BACKOFF").unwrap_or_else(|_| "1".to_string());

        Ok(Self {
            project: env::var("PROJECT_NAME")?,
            service_name: env::var("SERVICE_NAME")?,
            tries: env::var("TRIES").unwrap_or_else(|_| "3".to_string()).parse()?,
            backoff: BackoffSetting::from_env_var(&backoff_raw)?,
            prefetch: env::var("PREFETCH").unwrap_or_else(|_| "1".to_string()).parse()?,
            handler_timeout_sec: env::var("HANDLER_TIMEOUT_SEC")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            max_jobs_per_connection: env::var("MAX_JOBS_PER_CONNECTION")
                .ok()
                .map(|v| v.parse())
                .transpose()?,
            inbox_lock_stale_threshold_sec: env::var("INBOX_LOCK_STALE_THRESHOLD_SEC")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            outage_sleep_sec: env::var("OUTAGE_SLEEP_SEC")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            statsd_sample_ok: env::var("STATSD_SAMPLE_OK")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()?,
            statsd_sample_payload: env::var("STATSD_SAMPLE_PAYLOAD")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()?,
            pod_name: env::var("POD_NAME").ok(),
        })
    }

    /// Worker identity: orchestrator pod name if present, else `host:pid`
    /// (§4.2.3).
    pub fn worker_identity(&self) -> String {
        if let Some(pod) = &self.pod_name {
            return pod.clone();
        }
        let host = env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
        format!("{host}:{}", std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_backoff_parses_plain_number() {
        let setting = BackoffSetting::from_env_var("5").unwrap();
        assert!(matches!(setting, BackoffSetting::Scalar(s) if s == 5.0));
    }

    #[test]
    fn sequence_backoff_parses_bracketed_list() {
        let setting = BackoffSetting::from_env_var("[1, 2, 4]").unwrap();
        match setting {
            BackoffSetting::Sequence(steps) => assert_eq!(steps, vec![1.0, 2.0, 4.0]),
            _ => panic!("expected sequence"),
        }
    }

    #[test]
    fn worker_identity_prefers_pod_name() {
        let mut cfg_base = ConsumerConfig {
            project: "acme".into(),
            service_name: "orders".into(),
            tries: 3,
            backoff: BackoffSetting::Scalar(1.0),
            prefetch: 1,
            handler_timeout_sec: 300,
            max_jobs_per_connection: None,
            inbox_lock_stale_threshold_sec: 300,
            outage_sleep_sec: 30,
            statsd_sample_ok: 1.0,
            statsd_sample_payload: 1.0,
            pod_name: Some("orders-7f8b-abc".to_string()),
        };
        assert_eq!(cfg_base.worker_identity(), "orders-7f8b-abc");
        cfg_base.pod_name = None;
        assert!(cfg_base.worker_identity().contains(':'));
    }
}
