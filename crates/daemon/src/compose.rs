//! Compose launcher
//!
//! Brings the containers of one compose definition up or down as a unit by
//! invoking the external compose tool, and classifies the outcome.

use crate::config::ComposeConfig;
use crate::runtime::{ContainerSummary, RuntimeClient, COMPOSE_WORKING_DIR_LABEL};
use async_trait::async_trait;
use cyberlab_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Successful `up`
#[derive(Debug, Clone, Default)]
pub struct ComposeUp {
    /// Containers labelled with the definition's working directory
    pub container_ids: Vec<String>,
    pub output: String,
}

/// Launcher seam used by the lifecycle controller
#[async_trait]
pub trait ComposeLauncher: Send + Sync {
    /// Bring the definition's containers up (detached)
    async fn up(&self, definition: &Path) -> Result<ComposeUp>;

    /// Tear the definition's containers down
    async fn down(&self, definition: &Path) -> Result<()>;
}

/// Launcher backed by `docker compose` / `docker-compose`
pub struct ComposeCli {
    config: ComposeConfig,
    runtime: Arc<dyn RuntimeClient>,
}

impl ComposeCli {
    pub fn new(config: ComposeConfig, runtime: Arc<dyn RuntimeClient>) -> Self {
        Self { config, runtime }
    }

    /// Split a definition path into (directory, file name)
    fn locate(definition: &Path) -> Result<(PathBuf, String)> {
        if !definition.is_file() {
            return Err(Error::DefinitionNotFound(definition.to_path_buf()));
        }
        let dir = match definition.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file = definition
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| Error::DefinitionNotFound(definition.to_path_buf()))?;
        Ok((dir, file))
    }

    fn build_args(&self, file: &str, verb: &[&str]) -> Vec<String> {
        let mut args = self.config.args.clone();
        args.extend(["-f".to_string(), file.to_string()]);
        args.extend(verb.iter().map(|v| v.to_string()));
        args
    }

    /// Spawn the compose tool in `dir` and wait for it to exit
    async fn invoke(&self, dir: &Path, args: &[String]) -> Result<Output> {
        debug!("compose: (in {:?}) {} {}", dir, self.config.program, args.join(" "));

        let mut cmd = Command::new(&self.config.program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let result = match self.config.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), cmd.output())
                .await
                .map_err(|_| Error::Timeout { seconds: secs })?,
            None => cmd.output().await,
        };

        result.map_err(|e| Error::ComposeSpawn {
            program: self.config.program.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ComposeLauncher for ComposeCli {
    async fn up(&self, definition: &Path) -> Result<ComposeUp> {
        let (dir, file) = Self::locate(definition)?;
        let args = self.build_args(&file, &["up", "-d"]);

        let output = self.invoke(&dir, &args).await?;
        if !output.status.success() {
            return Err(Error::ComposeExit {
                code: output.status.code(),
                output: diagnostic_text(&output),
            });
        }

        let containers = self.runtime.list_containers(false).await?;
        let container_ids = project_containers(&containers, &working_dir_forms(&dir));
        if container_ids.is_empty() {
            warn!("compose up for {:?} succeeded but no labelled containers were found", definition);
        }

        info!("compose up {:?}: {} containers", definition, container_ids.len());
        Ok(ComposeUp {
            container_ids,
            output: diagnostic_text(&output),
        })
    }

    async fn down(&self, definition: &Path) -> Result<()> {
        let (dir, file) = Self::locate(definition)?;
        let args = self.build_args(&file, &["down"]);

        let output = self.invoke(&dir, &args).await?;
        if !output.status.success() {
            return Err(Error::ComposeExit {
                code: output.status.code(),
                output: diagnostic_text(&output),
            });
        }

        info!("compose down {:?}", definition);
        Ok(())
    }
}

/// Ids of containers whose compose working-dir label matches one of `dirs`
pub fn project_containers(containers: &[ContainerSummary], dirs: &[String]) -> Vec<String> {
    containers
        .iter()
        .filter(|c| {
            c.labels
                .get(COMPOSE_WORKING_DIR_LABEL)
                .map_or(false, |wd| dirs.iter().any(|d| d.trim_end_matches('/') == wd.trim_end_matches('/')))
        })
        .map(|c| c.id.clone())
        .collect()
}

/// Candidate spellings of `dir` that compose may have stamped on containers
pub fn working_dir_forms(dir: &Path) -> Vec<String> {
    let mut forms = Vec::new();
    if let Ok(canonical) = dir.canonicalize() {
        forms.push(canonical.to_string_lossy().to_string());
    }
    if dir.is_absolute() {
        forms.push(dir.to_string_lossy().to_string());
    } else if let Ok(cwd) = std::env::current_dir() {
        forms.push(cwd.join(dir).to_string_lossy().to_string());
    }
    forms.dedup();
    forms
}

/// Compose reports progress on stderr; prefer it, fall back to stdout.
fn diagnostic_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return stderr.trim().to_string();
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
