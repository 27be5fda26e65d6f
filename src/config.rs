use std::path::PathBuf;

pub const ENV_LOG: &str = "SCHOOLTOOLD_LOG";
pub const ENV_LOG_FORMAT: &str = "SCHOOLTOOLD_LOG_FORMAT";
pub const ENV_WORKSPACE: &str = "SCHOOLTOOLD_WORKSPACE";
pub const ENV_CSV_CHARSET: &str = "SCHOOLTOOLD_CSV_CHARSET";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Process-level settings, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub log_filter: Option<String>,
    pub log_format: LogFormat,
    pub workspace: Option<PathBuf>,
    pub csv_charset: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            log_filter: non_empty(ENV_LOG),
            // Unknown formats fall back to compact rather than refusing to start.
            log_format: non_empty(ENV_LOG_FORMAT)
                .and_then(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            workspace: non_empty(ENV_WORKSPACE).map(PathBuf::from),
            csv_charset: non_empty(ENV_CSV_CHARSET).map(|v| v.trim().to_string()),
        }
    }
}
