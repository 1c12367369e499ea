use serde::{Deserialize, Deserializer};

/// Files with this suffix are restart-loop scripts.
pub const SCRIPT_SUFFIX: &str = ".sh";

/// The part of GitHub's push payload we care about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default, deserialize_with = "null_as_default")]
    pub reference: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Commit {
    #[serde(default, deserialize_with = "null_as_default")]
    pub modified: Vec<String>,
}

// GitHub sends `null` for some fields that are otherwise lists or strings.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Option::unwrap_or_default)
}

impl PushEvent {
    pub fn is_on(&self, reference: &str) -> bool {
        self.reference == reference
    }

    /// Whether any pushed commit modified a shell script.
    pub fn script_updated(&self) -> bool {
        let script = self
            .commits
            .iter()
            .flat_map(|commit| &commit.modified)
            .find(|path| path.ends_with(SCRIPT_SUFFIX));

        match script {
            Some(path) => {
                tracing::info!(path = path.as_str(), "Script {} was updated", path);
                true
            }
            None => {
                tracing::info!(
                    "Scripts not updated in {} commit(s)",
                    self.commits.len()
                );
                false
            }
        }
    }
}
