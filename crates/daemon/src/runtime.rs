//! Container runtime client
//!
//! Uniform access to the container engine through its CLI. Every fault the
//! engine can produce (binary missing, daemon down, unknown container) comes
//! back as an [`Error`] value; nothing here panics or orchestrates.

use async_trait::async_trait;
use cyberlab_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::{Command, Output};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Label compose stamps on every container with its project directory
pub const COMPOSE_WORKING_DIR_LABEL: &str = "com.docker.compose.project.working_dir";

/// Container runtime flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Detect available container runtime
    pub fn detect() -> Option<Self> {
        if Command::new("docker").arg("--version").output().is_ok() {
            return Some(Self::Docker);
        }
        if Command::new("podman").arg("--version").output().is_ok() {
            return Some(Self::Podman);
        }
        None
    }

    /// Get the CLI command name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// One row of a container listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Container state as reported by inspect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    /// `running`, `exited`, `restarting`, `paused`, `dead`, `created`
    pub status: String,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Inspected container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

/// Result of a bulk prune
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub containers: String,
    pub networks: String,
    pub volumes: String,
}

/// One `stats --no-stream` sample, as the engine formats it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu_percent: String,
    pub memory_usage: String,
    pub memory_percent: String,
    pub net_io: String,
    pub block_io: String,
    pub pids: String,
}

/// Operations the lifecycle controller needs from a container engine
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Whether the engine answers at all
    async fn is_available(&self) -> bool;

    /// Engine-wide information, `None` when unreachable
    async fn system_info(&self) -> Option<serde_json::Value>;

    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerSummary>>;

    /// `Ok(None)` when the container does not exist
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerDetail>>;

    async fn start(&self, container_id: &str) -> Result<()>;

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<()>;

    async fn remove(&self, container_id: &str, force: bool) -> Result<()>;

    /// Combined stdout/stderr tail, timestamped
    async fn logs(&self, container_id: &str, tail_lines: usize) -> Result<String>;

    /// Single resource usage sample
    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats>;

    /// Create a network, returning the engine's id for it
    async fn create_network(&self, name: &str, driver: &str) -> Result<String>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Create a named volume, returning its name
    async fn create_volume(&self, name: &str) -> Result<String>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Remove stopped containers, unused networks and unused volumes
    async fn prune_unused(&self) -> Result<PruneReport>;
}

/// Runtime client backed by the docker/podman CLI
pub struct CliRuntime {
    binary: Option<String>,
    command_timeout: Duration,
}

impl CliRuntime {
    pub fn new(binary: Option<String>, command_timeout: Duration) -> Self {
        let binary = binary.or_else(|| RuntimeKind::detect().map(|k| k.command().to_string()));
        if binary.is_none() {
            warn!("No container runtime found on PATH");
        }
        Self {
            binary,
            command_timeout,
        }
    }

    fn binary(&self) -> Result<&str> {
        self.binary
            .as_deref()
            .ok_or_else(|| Error::RuntimeUnavailable("No container runtime available".to_string()))
    }

    /// Run a runtime command, returning raw output regardless of exit status
    async fn exec(&self, args: &[&str]) -> Result<Output> {
        let binary = self.binary()?;
        debug!("runtime: {} {}", binary, args.join(" "));

        let mut cmd = AsyncCommand::new(binary);
        cmd.args(args).kill_on_drop(true);

        match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::RuntimeUnavailable(format!("{}: {}", binary, e))),
            Err(_) => Err(Error::Timeout {
                seconds: self.command_timeout.as_secs(),
            }),
        }
    }

    /// Run a runtime command that must succeed, returning stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl RuntimeClient for CliRuntime {
    async fn is_available(&self) -> bool {
        match self.run(&["version", "--format", "{{.Server.Version}}"]).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Container runtime is not running: {}", e);
                false
            }
        }
    }

    async fn system_info(&self) -> Option<serde_json::Value> {
        let stdout = self.run(&["info", "--format", "{{json .}}"]).await.ok()?;
        serde_json::from_str(stdout.trim()).ok()
    }

    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps", "--no-trunc", "--format", "{{json .}}"];
        if include_stopped {
            args.push("--all");
        }
        let stdout = self.run(&args).await?;
        Ok(parse_ps_lines(&stdout))
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerDetail>> {
        let output = self.exec(&["container", "inspect", container_id]).await?;
        if !output.status.success() {
            return match classify_failure(&String::from_utf8_lossy(&output.stderr)) {
                Error::NotFound { .. } => Ok(None),
                other => Err(other),
            };
        }
        parse_inspect(&output.stdout)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.run(&["start", container_id]).await.map(|_| ())
    }

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        self.run(&["stop", "--time", &secs, container_id]).await.map(|_| ())
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(container_id);
        self.run(&args).await.map(|_| ())
    }

    async fn logs(&self, container_id: &str, tail_lines: usize) -> Result<String> {
        let tail = tail_lines.to_string();
        let output = self
            .exec(&["logs", "--tail", &tail, "--timestamps", container_id])
            .await?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        // Container stderr is forwarded on the CLI's stderr.
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats> {
        let output = self
            .exec(&["stats", "--no-stream", "--format", "{{json .}}", container_id])
            .await?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        parse_stats(&String::from_utf8_lossy(&output.stdout))
    }

    async fn create_network(&self, name: &str, driver: &str) -> Result<String> {
        let stdout = self.run(&["network", "create", "--driver", driver, name]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.run(&["network", "rm", name]).await.map(|_| ())
    }

    async fn create_volume(&self, name: &str) -> Result<String> {
        let stdout = self.run(&["volume", "create", name]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "rm", name]).await.map(|_| ())
    }

    async fn prune_unused(&self) -> Result<PruneReport> {
        Ok(PruneReport {
            containers: self.run(&["container", "prune", "--force"]).await?,
            networks: self.run(&["network", "prune", "--force"]).await?,
            volumes: self.run(&["volume", "prune", "--force"]).await?,
        })
    }
}

/// Map CLI stderr to a structured error
fn classify_failure(stderr: &str) -> Error {
    let message = stderr.trim().to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        Error::NotFound {
            kind: "container".to_string(),
            id: message,
        }
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("cannot connect to podman")
    {
        Error::RuntimeUnavailable(message)
    } else {
        Error::Runtime(message)
    }
}

// Internal JSON parsing structs (Docker/Podman output)
#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct PsJson {
    #[serde(alias = "Id")]
    ID: Option<String>,
    Names: Option<NamesJson>,
    Image: Option<String>,
    State: Option<String>,
    Status: Option<String>,
    Labels: Option<LabelsJson>,
}

/// Docker joins names with commas, podman emits an array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NamesJson {
    Joined(String),
    List(Vec<String>),
}

/// Docker renders labels as `k1=v1,k2=v2`, podman as an object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelsJson {
    Joined(String),
    Map(HashMap<String, String>),
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct StatsJson {
    #[serde(default)]
    CPUPerc: String,
    #[serde(default)]
    MemUsage: String,
    #[serde(default)]
    MemPerc: String,
    #[serde(default)]
    NetIO: String,
    #[serde(default)]
    BlockIO: String,
    #[serde(default, alias = "PIDS")]
    PIDs: String,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct InspectJson {
    Id: String,
    Name: Option<String>,
    State: InspectStateJson,
    Config: Option<InspectConfigJson>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct InspectStateJson {
    Status: String,
    ExitCode: Option<i64>,
    StartedAt: Option<String>,
    FinishedAt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct InspectConfigJson {
    Image: Option<String>,
    Labels: Option<HashMap<String, String>>,
}

fn parse_ps_lines(stdout: &str) -> Vec<ContainerSummary> {
    let mut containers = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PsJson>(line) {
            Ok(c) => containers.push(ContainerSummary {
                id: c.ID.unwrap_or_default(),
                names: match c.Names {
                    Some(NamesJson::Joined(joined)) => joined
                        .split(',')
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect(),
                    Some(NamesJson::List(names)) => names,
                    None => Vec::new(),
                },
                image: c.Image.unwrap_or_default(),
                state: c.State.unwrap_or_default(),
                status: c.Status.unwrap_or_default(),
                labels: match c.Labels {
                    Some(LabelsJson::Joined(joined)) => parse_label_list(&joined),
                    Some(LabelsJson::Map(labels)) => labels,
                    None => HashMap::new(),
                },
            }),
            Err(e) => debug!("Skipping unparseable ps line: {}", e),
        }
    }
    containers
}

/// `ps` renders labels as `k1=v1,k2=v2`
fn parse_label_list(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

fn parse_stats(stdout: &str) -> Result<ContainerStats> {
    let line = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let raw: StatsJson = serde_json::from_str(line)?;
    Ok(ContainerStats {
        cpu_percent: raw.CPUPerc,
        memory_usage: raw.MemUsage,
        memory_percent: raw.MemPerc,
        net_io: raw.NetIO,
        block_io: raw.BlockIO,
        pids: raw.PIDs,
    })
}

fn parse_inspect(stdout: &[u8]) -> Result<Option<ContainerDetail>> {
    let mut items: Vec<InspectJson> = serde_json::from_slice(stdout)?;
    if items.is_empty() {
        return Ok(None);
    }
    let item = items.swap_remove(0);
    let config = item.Config;
    Ok(Some(ContainerDetail {
        id: item.Id,
        name: item.Name.unwrap_or_default().trim_start_matches('/').to_string(),
        image: config.as_ref().and_then(|c| c.Image.clone()).unwrap_or_default(),
        labels: config.and_then(|c| c.Labels).unwrap_or_default(),
        state: ContainerState {
            status: item.State.Status,
            exit_code: item.State.ExitCode,
            started_at: item.State.StartedAt,
            finished_at: item.State.FinishedAt,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_lines() {
        let stdout = concat!(
            r#"{"ID":"abc123","Names":"scada-hmi-1","Image":"nodered/node-red","State":"running","Status":"Up 2 minutes","Labels":"com.docker.compose.project=scada,com.docker.compose.project.working_dir=/srv/labs/scada"}"#,
            "\n\n",
            "not json\n",
            r#"{"ID":"def456","Names":"plc-1","Image":"openplc","State":"exited","Status":"Exited (1)","Labels":""}"#,
        );
        let containers = parse_ps_lines(stdout);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].names, vec!["scada-hmi-1".to_string()]);
        assert_eq!(
            containers[0].labels.get(COMPOSE_WORKING_DIR_LABEL).map(String::as_str),
            Some("/srv/labs/scada")
        );
        assert!(containers[1].labels.is_empty());
    }

    #[test]
    fn test_parse_ps_lines_podman() {
        let stdout = concat!(
            r#"{"Id":"abc123","Names":["scada-hmi-1"],"Image":"docker.io/nodered/node-red:latest","State":"running","Status":"Up 2 minutes","Labels":{"com.docker.compose.project":"scada","com.docker.compose.project.working_dir":"/srv/labs/scada"}}"#,
            "\n",
            r#"{"Id":"def456","Names":["plc-1","plc"],"Image":"openplc","State":"exited","Status":"Exited (1)","Labels":null}"#,
        );
        let containers = parse_ps_lines(stdout);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].id, "abc123");
        assert_eq!(containers[0].names, vec!["scada-hmi-1".to_string()]);
        assert_eq!(
            containers[0].labels.get(COMPOSE_WORKING_DIR_LABEL).map(String::as_str),
            Some("/srv/labs/scada")
        );
        assert_eq!(containers[1].names.len(), 2);
        assert!(containers[1].labels.is_empty());
    }

    #[test]
    fn test_parse_stats() {
        let stdout = r#"{"BlockIO":"0B / 4.1kB","CPUPerc":"1.25%","Container":"abc123","ID":"abc123","MemPerc":"0.62%","MemUsage":"48.3MiB / 7.6GiB","Name":"scada-hmi-1","NetIO":"1.2kB / 0B","PIDs":"11"}"#;
        let stats = parse_stats(stdout).unwrap();
        assert_eq!(stats.cpu_percent, "1.25%");
        assert_eq!(stats.memory_usage, "48.3MiB / 7.6GiB");
        assert_eq!(stats.pids, "11");

        assert!(parse_stats("").is_err());
    }

    #[test]
    fn test_parse_inspect() {
        let stdout = br#"[{"Id":"abc123","Name":"/plc-1","State":{"Status":"exited","Running":false,"ExitCode":137,"StartedAt":"2024-01-01T00:00:00Z","FinishedAt":"2024-01-01T01:00:00Z"},"Config":{"Image":"openplc","Labels":{"a":"b"}}}]"#;
        let detail = parse_inspect(stdout).unwrap().unwrap();
        assert_eq!(detail.name, "plc-1");
        assert_eq!(detail.state.exit_code, Some(137));
        assert!(!detail.state.is_running());
        assert_eq!(detail.labels.get("a").map(String::as_str), Some("b"));

        assert!(parse_inspect(b"[]").unwrap().is_none());
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("Error: No such container: abc"),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            classify_failure("Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"),
            Error::RuntimeUnavailable(_)
        ));
        assert!(matches!(classify_failure("permission denied"), Error::Runtime(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runtime = CliRuntime::new(
            Some("cyberlab-no-such-runtime-binary".to_string()),
            Duration::from_secs(5),
        );
        assert!(!runtime.is_available().await);
        assert!(matches!(
            runtime.list_containers(true).await,
            Err(Error::RuntimeUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_network_and_volume_commands() {
        // `echo` stands in for the engine and hands back its arguments.
        let runtime = CliRuntime::new(Some("echo".to_string()), Duration::from_secs(5));
        assert_eq!(
            runtime.create_network("lab-net", "bridge").await.unwrap(),
            "network create --driver bridge lab-net"
        );
        assert_eq!(runtime.create_volume("lab-data").await.unwrap(), "volume create lab-data");
        runtime.remove_network("lab-net").await.unwrap();
        runtime.remove_volume("lab-data").await.unwrap();
        assert!(matches!(
            runtime.container_stats("abc").await,
            Err(Error::Serialization(_))
        ));
    }
}
