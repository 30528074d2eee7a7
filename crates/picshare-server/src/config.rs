use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

use crate::auth::AuthKeys;

// Journal tunables (JOURNAL_SEGMENT_BYTES, JOURNAL_BATCH_MAX_BYTES,
// JOURNAL_BATCH_MAX_MS) are read by the storage crate directly.
pub struct Config {
    pub port: u16,
    pub data_dir: Option<String>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub auth: AuthKeys,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("PORT", 8080),
            data_dir: env::var("DATA_DIR").ok(),
            tls_cert_path: env::var("TLS_CERT_PATH").ok(),
            tls_key_path: env::var("TLS_KEY_PATH").ok(),
            auth: AuthKeys::from_env(),
        }
    }
}

fn try_load<T: FromStr + Display>(key: &str, default: T) -> T
where
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid {key} value: {e}; using default {default}");
                default
            }
        },
        Err(_) => {
            info!("{key} not set, using default {default}");
            default
        }
    }
}
