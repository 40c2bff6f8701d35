use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use console::style;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "apikit.toml";
pub const DEFAULT_PORT: u16 = 33333;

/// Project configuration, loaded once at startup and threaded explicitly
/// into every component that needs it.
///
/// URL fields are derived from `app` + `port` unless the file overrides
/// them. The session fields (`mongodb_url`, `mongodb_db`, `redis_url`,
/// `token`) are populated by `start` and persisted so the db maintenance
/// verbs can reuse them.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: String,
    pub port: u16,
    pub docker_image: String,
    pub token: String,
    pub api_url: String,
    pub admin_url: String,
    pub autoupdate: bool,
    pub mongodb_url: Option<String>,
    pub mongodb_db: Option<String>,
    pub redis_url: Option<String>,
    path: PathBuf,
}

/// On-disk shape: an `[apikit]` section of flat keys, every one optional.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    apikit: RawConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawConfig {
    app: Option<String>,
    port: Option<u16>,
    docker_image: Option<String>,
    token: Option<String>,
    api_url: Option<String>,
    admin_url: Option<String>,
    autoupdate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mongodb_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mongodb_db: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redis_url: Option<String>,
}

/// Walk up from `start_dir` until a `.git` directory marks the repository
/// root; its directory name is the default app name.
pub fn find_repo_root(start_dir: &Path) -> Option<String> {
    let mut dir = start_dir.to_path_buf();
    loop {
        if dir.join(".git").is_dir() {
            return dir.file_name().map(|n| n.to_string_lossy().into_owned());
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn default_app_name(dir: &Path) -> String {
    find_repo_root(dir)
        .or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string())
}

impl Config {
    /// Load `apikit.toml` from `dir`. A missing file or missing keys fall
    /// back to defaults; corrupt contents produce defaults plus a
    /// diagnostic instead of aborting.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str::<ConfigFile>(&text) {
                Ok(file) => file.apikit,
                Err(e) => {
                    eprintln!("{}", style(format!("{CONFIG_FILE}: {e}")).red());
                    RawConfig::default()
                }
            },
            Err(_) => RawConfig::default(),
        };

        let app = raw.app.unwrap_or_else(|| default_app_name(dir));
        let port = raw.port.unwrap_or(DEFAULT_PORT);
        let api_url = raw
            .api_url
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        let admin_url = raw
            .admin_url
            .unwrap_or_else(|| format!("http://localhost:9001/auth/signin?api={api_url}"));

        Self {
            docker_image: raw.docker_image.unwrap_or_else(|| format!("{app}:dev")),
            token: raw.token.unwrap_or_default(),
            autoupdate: raw.autoupdate.unwrap_or(true),
            mongodb_url: raw.mongodb_url,
            mongodb_db: raw.mongodb_db,
            redis_url: raw.redis_url,
            app,
            port,
            api_url,
            admin_url,
            path,
        }
    }

    /// Change the API port and re-derive the dependent URLs.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
        self.api_url = format!("http://localhost:{port}");
        self.admin_url = format!("http://localhost:9001/auth/signin?api={}", self.api_url);
    }

    /// Persist back to the file this config was loaded from.
    pub fn save(&self) -> Result<()> {
        let file = ConfigFile {
            apikit: RawConfig {
                app: Some(self.app.clone()),
                port: Some(self.port),
                docker_image: Some(self.docker_image.clone()),
                token: Some(self.token.clone()),
                api_url: Some(self.api_url.clone()),
                admin_url: Some(self.admin_url.clone()),
                autoupdate: Some(self.autoupdate),
                mongodb_url: self.mongodb_url.clone(),
                mongodb_db: self.mongodb_db.clone(),
                redis_url: self.redis_url.clone(),
            },
        };
        let text = toml::to_string_pretty(&file)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}
