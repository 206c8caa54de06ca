//! Environment-variable configuration, per spec.md §6. This deployment
//! scopes configuration to env vars only — no file loader, no CLI flags
//! (those are explicitly out of scope per spec.md §1).

use std::env;

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v != "false",
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub node_env: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            node_env: env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),
        }
    }

    pub fn is_production(&self) -> bool {
        self.node_env == "production"
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub sweep_interval_ms: u64,
    pub firestore_enabled: bool,
    pub firestore_ttl_secs: u64,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("CACHE_ENABLED", true),
            sweep_interval_ms: env_u64("CACHE_SWEEP_INTERVAL_MS", 300_000),
            firestore_enabled: env_flag("FIRESTORE_CACHE_ENABLED", false),
            firestore_ttl_secs: env_u64("FIRESTORE_CACHE_TTL", 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl ClassificationConfig {
    pub fn from_env() -> Self {
        let host_port = env::var("CLASSIFICATION_SERVER_HOST")
            .unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("CLASSIFICATION_SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        Self {
            enabled: env_flag("USE_CLASSIFICATION_SERVICE", false),
            host: host_port,
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Top-level configuration assembled once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub classification: ClassificationConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            cache: CacheConfig::from_env(),
            classification: ClassificationConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn server_config_defaults_port_8080() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("PORT");
        let cfg = ServerConfig::from_env();
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn cache_enabled_unless_explicitly_false() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("CACHE_ENABLED");
        assert!(CacheConfig::from_env().enabled);
        env::set_var("CACHE_ENABLED", "false");
        assert!(!CacheConfig::from_env().enabled);
        env::remove_var("CACHE_ENABLED");
    }

    #[test]
    fn classification_base_url_combines_host_and_port() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("CLASSIFICATION_SERVER_HOST", "example.internal");
        env::set_var("CLASSIFICATION_SERVER_PORT", "9090");
        let cfg = ClassificationConfig::from_env();
        assert_eq!(cfg.base_url(), "http://example.internal:9090");
        env::remove_var("CLASSIFICATION_SERVER_HOST");
        env::remove_var("CLASSIFICATION_SERVER_PORT");
    }
}
