use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;

#[allow(unused_variables)]
fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub call: CallConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Worker bits baked into generated snowflake ids. Keep unique per
    /// instance when several hubs share one database.
    #[serde(default = "default_worker_id")]
    pub worker_id: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            worker_id: default_worker_id(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/palaver.db?mode=rwc".into(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            jwt_expiry_seconds: default_jwt_expiry(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CallConfig {
    /// Seconds an unanswered call rings before both sides get a timeout.
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: default_ring_timeout(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_worker_id() -> u16 {
    1
}
fn default_max_connections() -> u32 {
    20
}
fn default_jwt_expiry() -> u64 {
    86_400
}
fn default_ring_timeout() -> u64 {
    60
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.contains("replace_with")
        || normalized.starts_with("example")
        || normalized == "devkey"
        || normalized == "devsecret"
        || normalized == "secret"
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Palaver Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
# Worker bits baked into generated ids. Keep unique per instance
# when several hubs share one database.
worker_id = {worker_id}

[database]
url = "{db_url}"
max_connections = {max_connections}

[auth]
jwt_secret = "{jwt_secret}"
jwt_expiry_seconds = {jwt_expiry}

[call]
# Seconds an unanswered call rings before both sides get a timeout.
ring_timeout_secs = {ring_timeout}
"#,
        bind_address = config.server.bind_address,
        worker_id = config.server.worker_id,
        db_url = config.database.url,
        max_connections = config.database.max_connections,
        jwt_secret = config.auth.jwt_secret,
        jwt_expiry = config.auth.jwt_expiry_seconds,
        ring_timeout = config.call.ring_timeout_secs,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let config = Config::default();

            // Ensure parent directory exists
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            let _ = harden_secret_file_permissions(path);
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        let _ = harden_secret_file_permissions(path);

        // Environment variable overrides
        if let Ok(value) = std::env::var("PALAVER_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("PALAVER_WORKER_ID") {
            if let Ok(parsed) = value.parse::<u16>() {
                config.server.worker_id = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_DATABASE_URL") {
            config.database.url = value;
        }
        if let Ok(value) = std::env::var("PALAVER_DATABASE_MAX_CONNECTIONS") {
            if let Ok(parsed) = value.parse::<u32>() {
                config.database.max_connections = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("PALAVER_JWT_EXPIRY_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.auth.jwt_expiry_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_RING_TIMEOUT_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.call.ring_timeout_secs = parsed.max(5);
            }
        }

        validate_secret_configuration(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_carry_a_usable_secret() {
        let config = Config::default();
        assert!(config.auth.jwt_secret.len() >= 32);
        assert_eq!(config.call.ring_timeout_secs, 60);
    }

    #[test]
    fn first_run_writes_a_reloadable_config_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("palaver-test.toml");
        let config_path = config_path.to_str().expect("config path utf8");
        let first = Config::load(config_path).expect("generate config");
        let second = Config::load(config_path).expect("reload config");
        assert_eq!(first.auth.jwt_secret, second.auth.jwt_secret);
        assert_eq!(first.server.bind_address, second.server.bind_address);
    }

    #[test]
    fn placeholder_secret_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("palaver-test.toml");
        std::fs::write(
            &config_path,
            concat!(
                "[server]\nbind_address = \"127.0.0.1:8080\"\n\n",
                "[database]\nurl = \"sqlite::memory:\"\n\n",
                "[auth]\njwt_secret = \"change_me\"\n",
            ),
        )
        .expect("write config");
        assert!(Config::load(config_path.to_str().expect("config path utf8")).is_err());
    }
}
