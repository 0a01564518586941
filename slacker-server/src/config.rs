//! Process configuration read from the environment, including routing of
//! organisations to tenants and repositories to channels.

use anyhow::{bail, Context, Result};
use slacker_core::message::DEFAULT_PREFIX;
use slacker_core::RepoRef;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_SPRINKLER_URL: &str = "wss://hook.g.robot-army.dev/ws";
pub const DEFAULT_TENANT: &str = "default";

#[derive(Clone)]
pub struct Config {
    pub slack_token: String,
    pub github_token: String,
    /// Websocket endpoint of the event feed.
    pub sprinkler_url: String,
    /// One gzip snapshot per tenant is kept here.
    pub data_dir: PathBuf,
    pub port: u16,
    pub routing: Routing,
    /// Tracking login -> chat user id. Logins without an entry are never
    /// sent direct messages.
    pub users: HashMap<String, String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let slack_token = get("SLACK_BOT_TOKEN")
            .filter(|s| !s.trim().is_empty())
            .context("SLACK_BOT_TOKEN environment variable is required")?;

        let github_token = get("GITHUB_TOKEN")
            .filter(|s| !s.trim().is_empty())
            .context("GITHUB_TOKEN environment variable is required")?;

        let sprinkler_url =
            get("SPRINKLER_URL").unwrap_or_else(|| DEFAULT_SPRINKLER_URL.to_string());

        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./slacker-data"));

        let port = get("PORT")
            .unwrap_or_else(|| "9119".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let default_tenant =
            get("SLACKER_DEFAULT_TENANT").unwrap_or_else(|| DEFAULT_TENANT.to_string());

        let tenants = parse_pairs("SLACKER_TENANTS", &get("SLACKER_TENANTS").unwrap_or_default())?
            .into_iter()
            .collect();

        let mut channels = HashMap::new();
        for (target, ids) in parse_pairs("SLACKER_CHANNELS", &get("SLACKER_CHANNELS").unwrap_or_default())? {
            validate_channel_target(&target)?;
            let ids: Vec<String> = ids
                .split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            channels.insert(target, ids);
        }

        let users = parse_pairs("SLACKER_USERS", &get("SLACKER_USERS").unwrap_or_default())?
            .into_iter()
            .collect();

        let prefix = get("SLACKER_PREFIX")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        Ok(Config {
            slack_token,
            github_token,
            sprinkler_url,
            data_dir,
            port,
            routing: Routing {
                default_tenant,
                tenants,
                channels,
                prefix,
            },
            users,
        })
    }
}

/// Where events from a repository go: which tenant owns them and which
/// channels announce them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub default_tenant: String,
    /// Organisation -> tenant.
    pub tenants: HashMap<String, String>,
    /// `org/repo` or `org/*` -> channel ids.
    pub channels: HashMap<String, Vec<String>>,
    pub prefix: String,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            default_tenant: DEFAULT_TENANT.to_string(),
            tenants: HashMap::new(),
            channels: HashMap::new(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl Routing {
    pub fn tenant_for(&self, owner: &str) -> String {
        self.tenants
            .get(owner)
            .cloned()
            .unwrap_or_else(|| self.default_tenant.clone())
    }

    /// An exact repository entry wins over the organisation wildcard.
    pub fn channels_for(&self, repo: &RepoRef) -> &[String] {
        self.channels
            .get(&repo.to_string())
            .or_else(|| self.channels.get(&format!("{}/*", repo.owner)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn validate_channel_target(target: &str) -> Result<()> {
    match target.split_once('/') {
        Some((owner, "*")) if !owner.is_empty() && !owner.contains('/') => Ok(()),
        _ => RepoRef::parse(target)
            .map(|_| ())
            .with_context(|| format!("SLACKER_CHANNELS target {:?} must be org/repo or org/*", target)),
    }
}

/// Parse `key=value,key=value`. Blank entries are skipped.
fn parse_pairs(name: &str, value: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((key, val)) = entry.split_once('=') else {
            bail!("{} entry {:?} must look like key=value", name, entry);
        };
        let (key, val) = (key.trim(), val.trim());
        if key.is_empty() || val.is_empty() {
            bail!("{} entry {:?} has an empty key or value", name, entry);
        }
        pairs.push((key.to_string(), val.to_string()));
    }
    Ok(pairs)
}
