use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_COMMAND_PREFIX: &str = "/admin";

/// Typed process configuration.
///
/// Built once at startup and passed explicitly into the adapters and the
/// fleet manager. Nothing reads the environment after `load()`.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub data_dir: PathBuf,
    pub bots_file: PathBuf,
    pub context_dir: PathBuf,

    // Completion provider
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub completion_max_tokens: u32,
    pub completion_temperature: f32,
    pub completion_timeout: Duration,

    // Session lifecycle
    pub connect_timeout: Duration,
    pub stop_grace_period: Duration,
    pub reload_interval: Option<Duration>,
    pub admin_command_prefix: String,

    // Telegram
    pub telegram_poll_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let openai_api_key = env_str("OPENAI_API_KEY")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("OPENAI_API_KEY environment variable is required".to_string())
            })?;

        let data_dir = env_path("DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        let mut cfg = Self::with_defaults(data_dir, openai_api_key);

        if let Some(p) = env_path("BOTS_FILE") {
            cfg.bots_file = p;
        }
        if let Some(p) = env_path("CONTEXT_DIR") {
            cfg.context_dir = p;
        }
        if let Some(url) = env_str("OPENAI_BASE_URL").and_then(non_empty) {
            cfg.openai_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = env_str("OPENAI_MODEL").and_then(non_empty) {
            cfg.openai_model = model;
        }
        if let Some(n) = env_u32("COMPLETION_MAX_TOKENS") {
            cfg.completion_max_tokens = n.max(1);
        }
        if let Some(t) = env_f32("COMPLETION_TEMPERATURE") {
            cfg.completion_temperature = t.clamp(0.0, 2.0);
        }
        if let Some(ms) = env_u64("COMPLETION_TIMEOUT_MS") {
            cfg.completion_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_u64("CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_u64("STOP_GRACE_PERIOD_MS") {
            cfg.stop_grace_period = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("RELOAD_INTERVAL_SECS") {
            cfg.reload_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(prefix) = env_str("ADMIN_COMMAND_PREFIX").and_then(non_empty) {
            cfg.admin_command_prefix = prefix.trim().to_string();
        }
        if let Some(secs) = env_u64("TELEGRAM_POLL_TIMEOUT_SECS") {
            cfg.telegram_poll_timeout = Duration::from_secs(secs);
        }

        fs::create_dir_all(&cfg.data_dir)?;
        fs::create_dir_all(&cfg.context_dir)?;

        Ok(cfg)
    }

    /// Defaults rooted at `data_dir`, with no environment lookups.
    pub fn with_defaults(data_dir: PathBuf, openai_api_key: String) -> Self {
        Self {
            bots_file: data_dir.join("bots.json"),
            context_dir: data_dir.join("contexts"),
            data_dir,
            openai_api_key,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            completion_max_tokens: 300,
            completion_temperature: 0.2,
            completion_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            stop_grace_period: Duration::from_secs(5),
            reload_interval: Some(Duration::from_secs(30)),
            admin_command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            telegram_poll_timeout: Duration::from_secs(10),
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let Some((key, val)) = parse_dotenv_line(raw) else {
            continue;
        };
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv_line(raw: &str) -> Option<(String, String)> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (k, v) = line.split_once('=')?;
    let key = k.trim().trim_start_matches("export ").trim();
    if key.is_empty() {
        return None;
    }

    let mut val = v.trim().to_string();
    // Strip optional surrounding quotes.
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        val = val[1..val.len() - 1].to_string();
    }

    Some((key.to_string(), val))
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_f32(key: &str) -> Option<f32> {
    env_str(key)
        .and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_rooted_at_data_dir() {
        let cfg = Config::with_defaults(PathBuf::from("/srv/fleet"), "k".to_string());
        assert_eq!(cfg.bots_file, PathBuf::from("/srv/fleet/bots.json"));
        assert_eq!(cfg.context_dir, PathBuf::from("/srv/fleet/contexts"));
        assert_eq!(cfg.admin_command_prefix, "/admin");
        assert!(cfg.completion_temperature < 0.5);
    }

    #[test]
    fn dotenv_lines_parse_quotes_and_comments() {
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("   "), None);
        assert_eq!(parse_dotenv_line("=value"), None);
        assert_eq!(
            parse_dotenv_line("OPENAI_MODEL=\"gpt-4o\""),
            Some(("OPENAI_MODEL".to_string(), "gpt-4o".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("export DATA_DIR='/var/lib/fleet'"),
            Some(("DATA_DIR".to_string(), "/var/lib/fleet".to_string()))
        );
    }
}
