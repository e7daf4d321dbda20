//! Reverse-proxy rules for running instances.
//!
//! One nginx `location` snippet per instance lives in the routing directory,
//! which the proxy includes. The agent never reloads the proxy itself; it
//! asks a privileged watcher to do so through a [`ReloadRequester`].

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use aikore_instance::LaunchMode;
use async_trait::async_trait;

use crate::error::{InstanceError, Result};

/// Public URL prefix of an instance.
pub fn public_path(slug: &str) -> String {
    format!("/app/{slug}/")
}

/// Prefix under which the desktop bridge of a persistent instance is served.
pub fn desktop_path(slug: &str) -> String {
    format!("/app/{slug}/desktop/")
}

/// Entry URL of the browser desktop client, relative to the host root.
pub fn desktop_entry_url(slug: &str) -> String {
    format!(
        "/app/{slug}/desktop/vnc.html?autoconnect=true&resize=remote&reconnect=true&path=app/{slug}/desktop/websockify"
    )
}

const PROXY_HEADERS: &str = "        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection \"upgrade\";
        proxy_set_header Host $host;
        proxy_read_timeout 86400;
";

/// Renders the rule for one instance. `target_port` is the application port in
/// direct mode and the bridge port in persistent mode.
pub fn render(slug: &str, mode: LaunchMode, target_port: u16) -> String {
    match mode {
        LaunchMode::Direct => format!(
            "# managed by aikore: {slug}\nlocation {path} {{\n        proxy_pass http://127.0.0.1:{target_port}/;\n{PROXY_HEADERS}}}\n",
            path = public_path(slug),
        ),
        LaunchMode::Persistent => format!(
            "# managed by aikore: {slug}\nlocation = {root} {{\n        return 302 {entry};\n}}\n\nlocation {desktop} {{\n        proxy_pass http://127.0.0.1:{target_port}/;\n{PROXY_HEADERS}}}\n",
            root = public_path(slug),
            entry = desktop_entry_url(slug),
            desktop = desktop_path(slug),
        ),
    }
}

#[derive(Debug, Clone)]
pub struct RoutingConfigWriter {
    dir: PathBuf,
}

impl RoutingConfigWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn rule_path(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{slug}.conf"))
    }

    /// Writes (or overwrites) the rule file for `slug`.
    pub async fn write(&self, slug: &str, mode: LaunchMode, target_port: u16) -> Result<PathBuf> {
        if slug.is_empty() {
            return Err(InstanceError::Configuration(
                "instance name has no routable characters".to_string(),
            ));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.rule_path(slug);
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, render(slug, mode, target_port)).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(slug, port = target_port, path = %path.display(), "routing rule written");
        Ok(path)
    }

    /// Deletes the rule file. Returns whether a file was removed.
    pub async fn remove(&self, slug: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.rule_path(slug)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
pub trait ReloadRequester: Send + Sync {
    async fn request_reload(&self) -> Result<()>;
}

/// Touches a sentinel file watched by the privileged proxy reloader.
#[derive(Debug, Clone)]
pub struct SentinelReload {
    path: PathBuf,
}

impl SentinelReload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReloadRequester for SentinelReload {
    async fn request_reload(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(InstanceError::Reload)?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(InstanceError::Reload)?
            .into_std()
            .await;
        file.set_modified(SystemTime::now())
            .map_err(InstanceError::Reload)?;
        tracing::debug!(path = %self.path.display(), "proxy reload requested");
        Ok(())
    }
}
