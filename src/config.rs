use std::collections::HashMap;

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // resolution events get pushed here when set, nothing is ever read back
    #[clap(long, env)]
    pub redis_url: Option<String>,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,

    // per hop request timeout
    #[clap(long, env, default_value = "15")]
    pub request_timeout_secs: u64,

    // bodies past this are truncated, embed pages are never anywhere near it
    #[clap(long, env, default_value = "4194304")]
    pub max_body_bytes: usize,

    // wall clock budget for one sandboxed decoder run
    #[clap(long, env, default_value = "3000")]
    pub sandbox_timeout_ms: u64,

    #[clap(long, env, default_value = "64")]
    pub sandbox_memory_limit_mb: usize,

    // extra attempts for a hop that timed out or got a 5xx
    #[clap(long, env, default_value = "1")]
    pub hop_retries: u32,

    #[clap(
        long,
        env,
        default_value = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:144.0) Gecko/20100101 Firefox/144.0"
    )]
    pub user_agent: String,

    // headless browser service used as the last decode strategy, off when unset
    #[clap(long, env)]
    pub browser_service_url: Option<String>,

    // cdn host overrides like --placeholder v1=media1.example, repeatable or comma seperated
    #[clap(long = "placeholder", env = "PLACEHOLDERS", value_delimiter = ',')]
    pub placeholders: Vec<String>,
}

impl AppConfig {
    /// `vN=host` pairs as `{vN}` tokens, malformed entries are skipped
    pub fn placeholder_overrides(&self) -> HashMap<String, String> {
        self.placeholders
            .iter()
            .filter_map(|entry| {
                let (name, value) = entry.split_once('=')?;
                let (name, value) = (name.trim().trim_matches(|c| c == '{' || c == '}'), value.trim());
                let numbered = name
                    .strip_prefix('v')
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
                if !numbered || value.is_empty() {
                    return None;
                }
                Some((format!("{{{}}}", name), value.to_string()))
            })
            .collect()
    }
}

impl Default for AppConfig {
    // defaults aren't really needed here but it's here as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            cors_origin: "*".to_string(),
            redis_url: None,
            sentry_dsn: None,
            request_timeout_secs: 15,
            max_body_bytes: 4 * 1024 * 1024,
            sandbox_timeout_ms: 3000,
            sandbox_memory_limit_mb: 64,
            hop_retries: 1,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:144.0) Gecko/20100101 Firefox/144.0".to_string(),
            browser_service_url: None,
            placeholders: Vec::new(),
        }
    }
}
