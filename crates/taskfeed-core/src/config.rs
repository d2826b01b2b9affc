use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::ChannelId, errors::Error, ingest::ForwardPolicy, Result};

/// Discord caps `limit` on the channel-messages endpoint at 100.
pub const MAX_PAGE_SIZE: u32 = 100;

const DEFAULT_DATABASE_PATH: &str = "discord_messages.db";
const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Typed configuration, built once at startup and handed to each component.
#[derive(Clone, Debug)]
pub struct Config {
    // Source
    pub discord_token: String,
    pub channel_id: ChannelId,
    pub discord_api_base: String,
    pub http_timeout: Duration,

    // Store
    pub database_path: PathBuf,

    // Ingestion window
    pub lookback: Duration,
    pub page_size: u32,
    pub page_delay: Duration,
    pub forward_policy: ForwardPolicy,
    pub use_watermark: bool,
    pub run_timeout: Option<Duration>,

    // Analysis
    pub tasks_dir: PathBuf,
    pub opencode_context_dir: PathBuf,
    pub opencode_path: PathBuf,
    pub opencode_timeout: Option<Duration>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let discord_token = env_str("DISCORD_TOKEN").and_then(non_empty);
        let channel_id = env_str("DISCORD_CHANNEL_ID").and_then(non_empty);

        let Some(discord_token) = discord_token else {
            return Err(Error::Config(
                "DISCORD_TOKEN environment variable is required".to_string(),
            ));
        };
        let Some(channel_id) = channel_id else {
            return Err(Error::Config(
                "DISCORD_CHANNEL_ID environment variable is required".to_string(),
            ));
        };

        let discord_api_base = env_str("DISCORD_API_BASE")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let http_timeout = Duration::from_secs(env_u64("HTTP_TIMEOUT_SECS").unwrap_or(30));

        let database_path = database_path_from_env();

        let lookback = Duration::from_secs(env_u64("INGEST_LOOKBACK_SECS").unwrap_or(3600));
        let page_size = clamp_page_size(env_u32("INGEST_PAGE_SIZE").unwrap_or(MAX_PAGE_SIZE));
        let page_delay = Duration::from_millis(env_u64("INGEST_PAGE_DELAY_MS").unwrap_or(100));
        let forward_policy = match env_str("INGEST_FORWARD") {
            Some(raw) => parse_forward_policy(&raw)?,
            None => ForwardPolicy::All,
        };
        let use_watermark = env_bool("INGEST_USE_WATERMARK").unwrap_or(false);
        let run_timeout = env_u64("INGEST_RUN_TIMEOUT_SECS")
            .filter(|s| *s > 0)
            .map(Duration::from_secs);

        // Task data root defaults to $HOME/Taylors (where the task files live).
        let home = home_dir();
        let tasks_dir = env_path("TASKS_DIR")
            .or_else(|| home.as_ref().map(|h| h.join("Taylors")))
            .ok_or_else(|| Error::Config("TASKS_DIR or HOME must be set".to_string()))?;
        let opencode_context_dir =
            env_path("OPENCODE_CONTEXT_DIR").unwrap_or_else(|| tasks_dir.join(".opencode"));
        let opencode_path = env_path("OPENCODE_PATH")
            .or_else(|| which_in_path("opencode"))
            .or_else(|| home.as_ref().map(|h| h.join(".opencode/bin/opencode")))
            .unwrap_or_else(|| PathBuf::from("opencode"));
        let opencode_timeout = match env_u64("OPENCODE_TIMEOUT_SECS").unwrap_or(600) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            discord_token,
            channel_id: ChannelId(channel_id.trim().to_string()),
            discord_api_base,
            http_timeout,
            database_path,
            lookback,
            page_size,
            page_delay,
            forward_policy,
            use_watermark,
            run_timeout,
            tasks_dir,
            opencode_context_dir,
            opencode_path,
            opencode_timeout,
        })
    }
}

/// Store location only; used by the read-only subcommands that need no credentials.
pub fn load_database_path() -> PathBuf {
    load_dotenv_if_present(Path::new(".env"));
    database_path_from_env()
}

fn database_path_from_env() -> PathBuf {
    env_path("DATABASE_PATH")
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH))
}

pub(crate) fn clamp_page_size(requested: u32) -> u32 {
    requested.clamp(1, MAX_PAGE_SIZE)
}

pub(crate) fn parse_forward_policy(raw: &str) -> Result<ForwardPolicy> {
    match raw.trim().to_lowercase().as_str() {
        "" | "all" => Ok(ForwardPolicy::All),
        "new" | "new_only" | "inserted" => Ok(ForwardPolicy::NewOnly),
        other => Err(Error::Config(format!(
            "INGEST_FORWARD must be `all` or `new`, got `{other}`"
        ))),
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
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
