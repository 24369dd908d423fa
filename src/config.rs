use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::inference::device::DevicePreference;
use crate::inference::hub::ModelSource;
use crate::inference::ModelFamily;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_CLIP_REPO: &str = "laion/CLIP-ViT-B-32-laion2B-s34B-b79K";
pub const DEFAULT_CLIP_REVISION: &str = "main";
pub const DEFAULT_DINOV2_REPO: &str = "facebook/dinov2-large";
pub const DEFAULT_DINOV2_REVISION: &str = "main";

/// Service configuration, read from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub auth_token: Option<String>,
    pub families: Vec<ModelFamily>,
    pub device: DevicePreference,
    pub clip: ModelSource,
    pub dinov2: ModelSource,
    pub fetch_timeout: Option<Duration>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = var("EMBED_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .trim()
            .parse::<SocketAddr>()
            .context("EMBED_BIND_ADDR must be a socket address like 0.0.0.0:3000")?;

        let families = match var("EMBED_MODELS") {
            Some(raw) => parse_families(&raw)?,
            None => vec![ModelFamily::Clip, ModelFamily::Dinov2],
        };

        let device = match var("EMBED_DEVICE") {
            Some(raw) => raw.parse()?,
            None => DevicePreference::Auto,
        };

        let fetch_timeout = match var("IMAGE_FETCH_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid IMAGE_FETCH_TIMEOUT_SECS '{raw}'"))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => Some(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)),
        };

        let clip = model_source(
            var("CLIP_SNAPSHOT_DIR"),
            var("CLIP_REPO"),
            var("CLIP_REVISION"),
            DEFAULT_CLIP_REPO,
            DEFAULT_CLIP_REVISION,
        );
        let dinov2 = model_source(
            var("DINOV2_SNAPSHOT_DIR"),
            var("DINOV2_REPO"),
            var("DINOV2_REVISION"),
            DEFAULT_DINOV2_REPO,
            DEFAULT_DINOV2_REVISION,
        );

        Ok(Self {
            bind_addr,
            auth_token: var("AUTH_TOKEN"),
            families,
            device,
            clip,
            dinov2,
            fetch_timeout,
        })
    }

    pub fn source_for(&self, family: ModelFamily) -> &ModelSource {
        match family {
            ModelFamily::Clip => &self.clip,
            ModelFamily::Dinov2 => &self.dinov2,
        }
    }
}

fn parse_families(raw: &str) -> Result<Vec<ModelFamily>> {
    let mut families = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let family: ModelFamily = part.parse()?;
        if !families.contains(&family) {
            families.push(family);
        }
    }
    if families.is_empty() {
        bail!("EMBED_MODELS must name at least one of: clip, dinov2");
    }
    Ok(families)
}

fn model_source(
    snapshot: Option<String>,
    repo: Option<String>,
    revision: Option<String>,
    default_repo: &str,
    default_revision: &str,
) -> ModelSource {
    match snapshot {
        Some(dir) => ModelSource::Local(PathBuf::from(dir)),
        None => ModelSource::Hub {
            repo: repo.unwrap_or_else(|| default_repo.to_string()),
            revision: revision.unwrap_or_else(|| default_revision.to_string()),
        },
    }
}

impl std::str::FromStr for ModelFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clip" => Ok(ModelFamily::Clip),
            "dinov2" | "dino" => Ok(ModelFamily::Dinov2),
            other => Err(anyhow!("unknown model family '{other}' (expected clip or dinov2)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServiceConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_load_both_families_from_hub() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.families, vec![ModelFamily::Clip, ModelFamily::Dinov2]);
        assert_eq!(config.device, DevicePreference::Auto);
        assert!(config.auth_token.is_none());
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(30)));
        match &config.clip {
            ModelSource::Hub { repo, revision } => {
                assert_eq!(repo, "laion/CLIP-ViT-B-32-laion2B-s34B-b79K");
                assert_eq!(revision, "main");
            }
            other => panic!("unexpected clip source {other:?}"),
        }
    }

    #[test]
    fn openai_clip_is_selectable() {
        let config = config_from(&[
            ("CLIP_REPO", "openai/clip-vit-base-patch32"),
            ("CLIP_REVISION", "refs/pr/15"),
        ])
        .unwrap();
        assert_eq!(
            config.clip,
            ModelSource::Hub {
                repo: "openai/clip-vit-base-patch32".into(),
                revision: "refs/pr/15".into(),
            }
        );
    }

    #[test]
    fn snapshot_dir_overrides_hub() {
        let config = config_from(&[
            ("DINOV2_SNAPSHOT_DIR", "/models/dinov2"),
            ("DINOV2_REPO", "facebook/dinov2-small"),
        ])
        .unwrap();
        assert_eq!(
            config.source_for(ModelFamily::Dinov2),
            &ModelSource::Local(PathBuf::from("/models/dinov2"))
        );
    }

    #[test]
    fn families_are_deduplicated_in_order() {
        let config = config_from(&[("EMBED_MODELS", "dinov2, clip,DINOV2")]).unwrap();
        assert_eq!(config.families, vec![ModelFamily::Dinov2, ModelFamily::Clip]);
    }

    #[test]
    fn rejects_unknown_family_and_empty_list() {
        assert!(config_from(&[("EMBED_MODELS", "clip,siglip")]).is_err());
        assert!(config_from(&[("EMBED_MODELS", " , ")]).is_err());
    }

    #[test]
    fn zero_timeout_disables_fetch_timeout() {
        let config = config_from(&[("IMAGE_FETCH_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.fetch_timeout, None);
        assert!(config_from(&[("IMAGE_FETCH_TIMEOUT_SECS", "soon")]).is_err());
    }

    #[test]
    fn blank_auth_token_counts_as_unset() {
        let config = config_from(&[("AUTH_TOKEN", "  ")]).unwrap();
        assert!(config.auth_token.is_none());
        let config = config_from(&[("AUTH_TOKEN", "s3cret")]).unwrap();
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn bad_bind_addr_is_an_error() {
        assert!(config_from(&[("EMBED_BIND_ADDR", "localhost")]).is_err());
    }
}
