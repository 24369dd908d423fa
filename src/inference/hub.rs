use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

/// Where a model's files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A Hugging Face model repo, downloaded into the local hub cache.
    Hub { repo: String, revision: String },
    /// A directory that already holds the snapshot files.
    Local(PathBuf),
}

impl ModelSource {
    /// Resolve `files` to local paths, in order. Blocking: call from a
    /// blocking thread when inside the runtime.
    pub fn resolve(&self, files: &[&str]) -> Result<Vec<PathBuf>> {
        match self {
            ModelSource::Local(dir) => files
                .iter()
                .map(|file| {
                    let path = dir.join(file);
                    if path.exists() {
                        Ok(path)
                    } else {
                        Err(anyhow!("{file} not found under {}", dir.display()))
                    }
                })
                .collect(),
            ModelSource::Hub { repo, revision } => {
                let api = Api::new().context("failed to initialize the Hugging Face hub client")?;
                let handle = api.repo(Repo::with_revision(
                    repo.clone(),
                    RepoType::Model,
                    revision.clone(),
                ));
                files
                    .iter()
                    .map(|file| {
                        info!(repo = %repo, revision = %revision, file, "resolving model file");
                        handle
                            .get(file)
                            .with_context(|| format!("failed to fetch {file} from {repo}@{revision}"))
                    })
                    .collect()
            }
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Hub { repo, revision } if revision == "main" => f.write_str(repo),
            ModelSource::Hub { repo, revision } => write!(f, "{repo}@{revision}"),
            ModelSource::Local(dir) => write!(f, "{}", dir.display()),
        }
    }
}
