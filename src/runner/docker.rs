//! [`ContainerRunner`] backed by the `docker` CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Command;

use super::progress::parse_pull_line;
use super::{
    ContainerInfo, ContainerOutput, ContainerRunner, LogSink, OutputStream, WaitCondition,
};
use crate::bus::LogPayload;
use crate::error::{AppError, ErrorKind, Result};
use crate::instance::Instance;
use crate::paths::DataPaths;
use crate::service::{DockerMethod, InstallMethod, ServiceDescriptor};

const CONTAINER_PREFIX: &str = "VERTEX_CT_";
const IMAGE_PREFIX: &str = "vertex_image_";
const DOCKER_HUB_URL: &str = "https://hub.docker.com";
const MAX_TAG_PAGES: usize = 5;
const REMOVAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct DockerRunner {
    docker_bin: String,
    paths: DataPaths,
    client: Client,
    hub_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    next: Option<String>,
    results: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl DockerRunner {
    pub fn new(docker_bin: impl Into<String>, paths: DataPaths) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("vertex")
            .build()?;
        Ok(Self {
            docker_bin: docker_bin.into(),
            paths,
            client,
            hub_url: DOCKER_HUB_URL.to_string(),
        })
    }

    /// Point the tag lookup at another registry API (mirror or test server).
    pub fn with_hub_url(mut self, url: impl Into<String>) -> Self {
        self.hub_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn container_name(instance_id: &str) -> String {
        format!("{}{}", CONTAINER_PREFIX, instance_id)
    }

    pub fn image_name(instance_id: &str) -> String {
        format!("{}{}", IMAGE_PREFIX, instance_id)
    }

    fn docker_method<'a>(&self, service: &'a ServiceDescriptor) -> Result<&'a DockerMethod> {
        service.methods.docker.as_ref().ok_or_else(|| {
            AppError::install_method_unsupported(&service.id, InstallMethod::Docker.as_str())
        })
    }

    /// Image the instance runs: the declared image at the selected tag, or the locally built one.
    fn image_ref(&self, instance: &Instance) -> Result<String> {
        let docker = self.docker_method(&instance.service)?;
        Ok(match &docker.image {
            Some(image) => match &instance.settings.version {
                Some(tag) => format!("{}:{}", split_tag(image).0, tag),
                None => image.clone(),
            },
            None => Self::image_name(&instance.id),
        })
    }

    fn create_args(&self, instance: &Instance) -> Result<Vec<String>> {
        let docker = self.docker_method(&instance.service)?;
        let instance_dir = self.paths.instance_dir(&instance.id);

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            Self::container_name(&instance.id),
        ];

        let mut env: BTreeMap<&str, &str> = instance
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (container_var, instance_var) in &docker.environment {
            if let Some(value) = instance.env.get(instance_var) {
                env.insert(container_var.as_str(), value.as_str());
            }
        }
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (container_port, env_name) in &docker.ports {
            let host_port = instance
                .env
                .get(env_name)
                .map(String::as_str)
                .unwrap_or(container_port);
            args.push("-p".to_string());
            args.push(format!("{}:{}", host_port, container_port));
        }

        for (host, container) in &docker.volumes {
            let host_path = Path::new(host);
            let host_path = if host_path.is_absolute() {
                host_path.to_path_buf()
            } else {
                instance_dir.join(host_path)
            };
            args.push("-v".to_string());
            args.push(format!("{}:{}", host_path.display(), container));
        }

        args.push(self.image_ref(instance)?);
        if let Some(command) = &docker.command {
            args.extend(command.split_whitespace().map(str::to_string));
        }
        Ok(args)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a docker command to completion. `subject` names the container or
    /// image, and is used to report a missing container.
    async fn exec(&self, subject: &str, args: &[&str]) -> Result<String> {
        let output = self.command().args(args).output().await.map_err(|e| {
            AppError::runner(format!("Failed to run {}: {}", self.docker_bin, e))
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_container(&stderr) {
            return Err(AppError::container_not_found(subject));
        }
        Err(AppError::runner(format!(
            "docker {} failed for {}: {}",
            args.first().copied().unwrap_or_default(),
            subject,
            stderr
        )))
    }

    /// Run a docker command, forwarding every output line to `sink`.
    async fn exec_streamed(
        &self,
        args: &[&str],
        sink: &LogSink,
        parse_stdout: fn(&str) -> LogPayload,
    ) -> Result<()> {
        let mut child = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::runner(format!("Failed to run {}: {}", self.docker_bin, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::runner("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::runner("Failed to capture stderr"))?;

        let stdout_task = tokio::spawn(forward_lines(stdout, sink.clone(), parse_stdout));
        let stderr_task = tokio::spawn(forward_lines(stderr, sink.clone(), |line| {
            LogPayload::Stderr(line.to_string())
        }));

        let status = child
            .wait()
            .await
            .map_err(|e| AppError::runner(format!("Failed to wait for docker: {}", e)))?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(AppError::runner(format!(
                "docker {} exited with {}",
                args.first().copied().unwrap_or_default(),
                status
            )));
        }
        Ok(())
    }

    async fn image_id(&self, image: &str) -> Result<String> {
        self.exec(image, &["image", "inspect", "--format", "{{.Id}}", image])
            .await
    }

    async fn inspect(&self, name: &str) -> Result<InspectEntry> {
        let raw = self.exec(name, &["inspect", name]).await?;
        let mut entries: Vec<InspectEntry> = serde_json::from_str(&raw)?;
        if entries.is_empty() {
            return Err(AppError::container_not_found(name));
        }
        Ok(entries.swap_remove(0))
    }

    async fn remove_container_if_exists(&self, name: &str) -> Result<()> {
        match self.exec(name, &["rm", "-f", name]).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ContainerNotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_next_exit(&self, name: &str) -> Result<()> {
        let filter = format!("container={}", name);
        let mut child = self
            .command()
            .args(["events", "--filter", &filter, "--filter", "event=die"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::runner(format!("Failed to run {}: {}", self.docker_bin, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::runner("Failed to capture stdout"))?;
        let mut lines = BufReader::new(stdout).lines();
        let first = lines.next_line().await;
        let _ = child.kill().await;

        match first {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(AppError::runner(format!(
                "docker events ended before {} exited",
                name
            ))),
            Err(e) => Err(AppError::runner(e.to_string())),
        }
    }

    async fn hub_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut url = Some(format!(
            "{}/v2/repositories/{}/tags?page_size=100",
            self.hub_url, repository
        ));
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let Some(current) = url.take() else {
                break;
            };
            let resp = self
                .client
                .get(&current)
                .send()
                .await
                .map_err(|e| AppError::network_with_url(&current, e.to_string()))?;
            if !resp.status().is_success() {
                return Err(AppError::network_with_url(
                    &current,
                    resp.status().to_string(),
                ));
            }
            let page: TagsPage = resp
                .json()
                .await
                .map_err(|e| AppError::network_with_url(&current, e.to_string()))?;
            tags.extend(page.results.into_iter().map(|t| t.name));
            url = page.next;
        }

        Ok(tags)
    }
}

async fn forward_lines<R>(reader: R, sink: LogSink, parse: fn(&str) -> LogPayload)
where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if sink.send(parse(&line)).is_err() {
            break;
        }
    }
}

fn stdout_line(line: &str) -> LogPayload {
    LogPayload::Stdout(line.to_string())
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// `registry:5000/team/app:1.2` → (`registry:5000/team/app`, `Some("1.2")`).
fn split_tag(image: &str) -> (&str, Option<&str>) {
    let image = image.split_once('@').map(|(name, _)| name).unwrap_or(image);
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (
            &image[..name_start + i],
            Some(&image[name_start + i + 1..]),
        ),
        None => (image, None),
    }
}

/// Docker Hub repository path, or `None` for images hosted elsewhere.
fn hub_repository(image: &str) -> Option<String> {
    let (name, _) = split_tag(image);
    let mut parts = name.splitn(2, '/');
    let first = parts.next()?;
    match parts.next() {
        None => Some(format!("library/{}", first)),
        Some(rest) if first == "docker.io" => hub_repository(rest),
        Some(_) if first.contains(['.', ':']) || first == "localhost" => None,
        Some(_) => Some(name.to_string()),
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn install(
        &self,
        instance_id: &str,
        service: &ServiceDescriptor,
        sink: LogSink,
    ) -> Result<()> {
        let docker = self.docker_method(service)?;

        if let Some(image) = &docker.image {
            log::info!("Pulling image {} for instance {}", image, instance_id);
            return self
                .exec_streamed(&["pull", image], &sink, parse_pull_line)
                .await;
        }

        let Some(dockerfile) = &docker.dockerfile else {
            return Err(AppError::config(format!(
                "Service {} declares neither an image nor a dockerfile",
                service.id
            )));
        };

        let instance_dir = self.paths.instance_dir(instance_id);
        let context = docker
            .context
            .as_deref()
            .map(|c| instance_dir.join(c))
            .unwrap_or_else(|| instance_dir.clone());
        let dockerfile = instance_dir.join(dockerfile);
        let tag = Self::image_name(instance_id);
        let dockerfile = dockerfile.to_string_lossy();
        let context = context.to_string_lossy();

        log::info!("Building image {} for instance {}", tag, instance_id);
        self.exec_streamed(
            &["build", "-t", &tag, "-f", &dockerfile, &context],
            &sink,
            stdout_line,
        )
        .await
    }

    async fn start(&self, instance: &Instance) -> Result<ContainerOutput> {
        let name = Self::container_name(&instance.id);
        let args = self.create_args(instance)?;

        // Recreate so the container picks up the current environment.
        self.remove_container_if_exists(&name).await?;
        for (host, _) in &self.docker_method(&instance.service)?.volumes {
            let path = self.paths.instance_dir(&instance.id).join(host);
            if let Err(e) = std::fs::create_dir_all(&path) {
                log::warn!("Failed to create volume dir {:?}: {}", path, e);
            }
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec(&name, &args).await?;
        self.exec(&name, &["start", &name]).await?;

        let mut logs = self
            .command()
            .args(["logs", "-f", &name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::runner(format!("Failed to follow logs: {}", e)))?;

        let stdout = logs.stdout.take();
        let stderr = logs.stderr.take();
        tokio::spawn(async move {
            let _ = logs.wait().await;
        });

        log::info!("Container {} started", name);
        Ok(ContainerOutput {
            stdout: stdout.map(|s| Box::pin(s) as OutputStream),
            stderr: stderr.map(|s| Box::pin(s) as OutputStream),
        })
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        let name = Self::container_name(&instance.id);
        self.exec(&name, &["stop", &name]).await?;
        log::info!("Container {} stopped", name);
        Ok(())
    }

    async fn delete(&self, instance: &Instance) -> Result<()> {
        let name = Self::container_name(&instance.id);
        let result = self.exec(&name, &["rm", &name]).await;

        let built = self
            .docker_method(&instance.service)
            .map(|d| d.image.is_none())
            .unwrap_or(false);
        if built {
            let image = Self::image_name(&instance.id);
            if let Err(e) = self.exec(&image, &["rmi", &image]).await {
                log::warn!("Failed to remove image {}: {}", image, e);
            }
        }

        result.map(|_| ())
    }

    async fn info(&self, instance: &Instance) -> Result<ContainerInfo> {
        let entry = self.inspect(&Self::container_name(&instance.id)).await?;
        Ok(ContainerInfo {
            id: entry.id,
            name: entry.name.trim_start_matches('/').to_string(),
            image: entry.config.image,
            status: entry.state.status,
            running: entry.state.running,
            exit_code: entry.state.exit_code,
            started_at: entry.state.started_at,
        })
    }

    async fn wait_condition(&self, instance: &Instance, condition: WaitCondition) -> Result<()> {
        let name = Self::container_name(&instance.id);
        match condition {
            WaitCondition::NotRunning => match self.exec(&name, &["wait", &name]).await {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == ErrorKind::ContainerNotFound => Ok(()),
                Err(e) => Err(e),
            },
            WaitCondition::NextExit => self.wait_next_exit(&name).await,
            WaitCondition::Removed => loop {
                match self.inspect(&name).await {
                    Ok(_) => tokio::time::sleep(REMOVAL_POLL_INTERVAL).await,
                    Err(e) if e.kind() == ErrorKind::ContainerNotFound => return Ok(()),
                    Err(e) => return Err(e),
                }
            },
        }
    }

    async fn check_for_updates(&self, instance: &Instance) -> Result<bool> {
        let docker = self.docker_method(&instance.service)?;
        if docker.image.is_none() {
            return Ok(false);
        }

        let image = self.image_ref(instance)?;
        let before = self.image_id(&image).await.ok();
        self.exec(&image, &["pull", "-q", &image]).await?;
        let after = self.image_id(&image).await?;

        let outdated = before.as_deref() != Some(after.as_str());
        if outdated {
            log::info!("Newer image available for instance {}: {}", instance.id, image);
        }
        Ok(outdated)
    }

    async fn get_all_versions(&self, instance: &Instance) -> Result<Vec<String>> {
        let docker = self.docker_method(&instance.service)?;
        let Some(image) = &docker.image else {
            return Ok(Vec::new());
        };
        let Some(repository) = hub_repository(image) else {
            log::debug!("Image {} is not hosted on Docker Hub, no versions listed", image);
            return Ok(Vec::new());
        };
        self.hub_tags(&repository).await
    }
}
