use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_watched_branch")]
    pub watched_branch: String,
    #[serde(
        default = "default_targets",
        deserialize_with = "deserialize_targets"
    )]
    pub targets: Vec<RestartTarget>,
    #[serde(default = "default_parallel_restarts")]
    pub parallel_restarts: u8,
    /// Maximum accepted webhook body, in bytes.
    #[serde(default = "default_payload_limit")]
    pub payload_limit: usize,
}

/// One deployed site instance: the OS user it runs as and its working copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RestartTarget {
    pub user: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetParseError {
    #[error("target `{0}` must have format <user>:<path>")]
    MissingSeparator(String),
    #[error("target `{0}` has an empty user")]
    EmptyUser(String),
    #[error("target `{0}` must use an absolute path")]
    RelativePath(String),
}

impl FromStr for RestartTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, path) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| TargetParseError::MissingSeparator(s.to_string()))?;
        if user.is_empty() {
            return Err(TargetParseError::EmptyUser(s.to_string()));
        }
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            return Err(TargetParseError::RelativePath(s.to_string()));
        }
        Ok(Self {
            user: user.to_string(),
            path,
        })
    }
}

impl fmt::Display for RestartTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.path.display())
    }
}

fn default_bind() -> String {
    "0.0.0.0:9999".into()
}

fn default_watched_branch() -> String {
    "refs/heads/master".into()
}

fn default_targets() -> Vec<RestartTarget> {
    vec![
        RestartTarget {
            user: "site".into(),
            path: "/home/site/ref_site".into(),
        },
        RestartTarget {
            user: "qa".into(),
            path: "/home/qa/site".into(),
        },
    ]
}

fn default_parallel_restarts() -> u8 {
    2
}

// GitHub caps webhook payloads at 25 MiB.
fn default_payload_limit() -> usize {
    25 * 1024 * 1024
}

fn deserialize_targets<'de, D>(de: D) -> Result<Vec<RestartTarget>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(de)?
        .iter()
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .collect()
}
