//! Blueprint scripts and their metadata block.
//!
//! A blueprint is a shell script that installs and runs one workload. It may
//! carry a metadata block:
//!
//! ```text
//! ### AIKORE-METADATA-START ###
//! # aikore.venv_type = conda
//! # aikore.venv_path = ./env
//! ### AIKORE-METADATA-END ###
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use crate::error::{InstanceError, Result};

const METADATA_START: &str = "### AIKORE-METADATA-START ###";
const METADATA_END: &str = "### AIKORE-METADATA-END ###";
const DEFAULT_VENV_PATH: &str = "./env";

/// Name of the per-instance copy of the blueprint.
pub const LAUNCH_SCRIPT: &str = "launch.sh";

/// Parses the metadata block. Keys keep their `aikore.` prefix.
pub fn parse_metadata(script: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut inside = false;
    for line in script.lines() {
        let line = line.trim();
        if line == METADATA_START {
            inside = true;
            continue;
        }
        if line == METADATA_END {
            break;
        }
        if !inside || !line.starts_with('#') {
            continue;
        }
        let cleaned = line.trim_start_matches('#').trim();
        if let Some((k, v)) = cleaned.split_once('=') {
            let k = k.trim();
            if k.starts_with("aikore.") {
                out.insert(k.to_string(), v.trim().to_string());
            }
        }
    }
    out
}

/// Interpreter environment to activate in an instance shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Conda { env_path: String },
    Venv { env_path: String },
}

impl Activation {
    pub fn from_metadata(meta: &BTreeMap<String, String>) -> Self {
        let env_path = meta
            .get("aikore.venv_path")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_VENV_PATH.to_string());
        match meta.get("aikore.venv_type").map(|v| v.to_ascii_lowercase()) {
            Some(t) if t == "conda" => Activation::Conda { env_path },
            _ => Activation::Venv { env_path },
        }
    }

    pub fn env_path(&self) -> &str {
        match self {
            Activation::Conda { env_path } | Activation::Venv { env_path } => env_path,
        }
    }

    /// Shell line that activates the environment from the instance directory.
    pub fn shell_command(&self, conda_root: &Path) -> String {
        match self {
            Activation::Conda { env_path } => format!(
                "source {}/etc/profile.d/conda.sh && conda activate {}",
                conda_root.display(),
                env_path
            ),
            Activation::Venv { env_path } => format!("source {env_path}/bin/activate"),
        }
    }

    /// Whether the environment exists under `instance_dir`.
    ///
    /// Conda environments are resolved by conda itself and always count as present.
    pub fn is_present(&self, instance_dir: &Path) -> bool {
        match self {
            Activation::Conda { .. } => true,
            Activation::Venv { env_path } => {
                instance_dir.join(env_path).join("bin").join("activate").is_file()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlueprintCatalog {
    stock_dir: PathBuf,
    custom_dir: PathBuf,
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

impl BlueprintCatalog {
    pub fn new(stock_dir: impl Into<PathBuf>, custom_dir: impl Into<PathBuf>) -> Self {
        Self {
            stock_dir: stock_dir.into(),
            custom_dir: custom_dir.into(),
        }
    }

    /// Path of a blueprint, preferring the custom directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let searched = vec![self.custom_dir.clone(), self.stock_dir.clone()];
        if !is_plain_file_name(name) {
            return Err(InstanceError::BlueprintNotFound {
                name: name.to_string(),
                searched,
            });
        }
        searched
            .iter()
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| InstanceError::BlueprintNotFound {
                name: name.to_string(),
                searched,
            })
    }

    /// Sorted, de-duplicated `*.sh` names from both directories.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for dir in [&self.stock_dir, &self.custom_dir] {
            let mut rd = match tokio::fs::read_dir(dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = rd.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if name.ends_with(".sh") && entry.file_type().await?.is_file() {
                    names.insert(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Metadata of a blueprint. A missing blueprint yields an empty map.
    pub async fn metadata(&self, name: &str) -> BTreeMap<String, String> {
        let Ok(path) = self.resolve(name) else {
            return BTreeMap::new();
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => parse_metadata(&s),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read blueprint");
                BTreeMap::new()
            }
        }
    }

    pub async fn activation(&self, name: &str) -> Activation {
        Activation::from_metadata(&self.metadata(name).await)
    }

    /// Copies the blueprint to `<instance_dir>/launch.sh` unless a copy already
    /// exists, so local edits to the launch script survive restarts.
    pub async fn materialize(&self, name: &str, instance_dir: &Path) -> Result<PathBuf> {
        let dest = instance_dir.join(LAUNCH_SCRIPT);
        if tokio::fs::try_exists(&dest).await? {
            return Ok(dest);
        }
        let src = self.resolve(name)?;
        tokio::fs::create_dir_all(instance_dir).await?;
        tokio::fs::copy(&src, &dest).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&dest).await?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            tokio::fs::set_permissions(&dest, perms).await?;
        }
        tracing::info!(blueprint = name, dest = %dest.display(), "launch script materialized");
        Ok(dest)
    }
}
