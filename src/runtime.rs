//! Container runtime interface.
//!
//! The deployer and the health reconciler only ever talk to this trait.
//! The shipped implementation wraps the `docker` CLI; tests substitute an
//! in-memory fake.

use crate::error::{MeshError, Result};
use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub network: String,
    /// `key=value` label pairs.
    pub labels: Vec<(String, String)>,
    /// `(host_port, container_port)` mappings.
    pub ports: Vec<(u16, u16)>,
    /// `(host_path_or_volume, container_path)` binds.
    pub volumes: Vec<(String, String)>,
}

/// Operations the mesh core needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates the network if it does not exist yet; returns its id or name.
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> bool;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Creates and starts a container, returning its id.
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String>;

    async fn stop_container(&self, name_or_id: &str) -> Result<()>;

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()>;

    async fn restart_container(&self, name_or_id: &str) -> Result<()>;
}

/// Runtime backed by the local `docker` command-line client.
#[derive(Debug, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        debug!("docker {}", args.join(" "));

        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("failed to run docker: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeshError::RuntimeFailure(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }

        Ok(output)
    }
}

/// Builds the `docker run` argument list for a container spec.
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if !spec.network.is_empty() {
        args.push("--network".to_string());
        args.push(spec.network.clone());
    }

    for env in &spec.env {
        args.push("-e".to_string());
        args.push(env.clone());
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }

    for (host, container) in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{host}:{container}"));
    }

    for (host, container) in &spec.volumes {
        args.push("-v".to_string());
        args.push(format!("{host}:{container}"));
    }

    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_network(&self, name: &str) -> Result<String> {
        let inspect = Command::new("docker")
            .args(["network", "inspect", name])
            .output()
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("failed to run docker: {e}")))?;

        if inspect.status.success() {
            info!(network = %name, "network already exists");
            return Ok(name.to_string());
        }

        let output = self
            .docker(&[
                "network".to_string(),
                "create".to_string(),
                "--driver".to_string(),
                "bridge".to_string(),
                name.to_string(),
            ])
            .await?;

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(network = %name, id = %id, "network created");

        Ok(id)
    }

    async fn image_exists(&self, image: &str) -> bool {
        Command::new("docker")
            .args(["image", "inspect", image])
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "pulling image");
        self.docker(&["pull".to_string(), image.to_string()]).await?;
        info!(image = %image, "image pulled");

        Ok(())
    }

    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String> {
        info!(name = %spec.name, image = %spec.image, "creating container");

        let output = self.docker(&run_args(&spec)).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        info!(name = %spec.name, id = %id, "container started");
        Ok(id)
    }

    async fn stop_container(&self, name_or_id: &str) -> Result<()> {
        info!(container = %name_or_id, "stopping container");
        self.docker(&["stop".to_string(), name_or_id.to_string()])
            .await?;

        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()> {
        info!(container = %name_or_id, "removing container");

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name_or_id.to_string());

        self.docker(&args).await?;
        Ok(())
    }

    async fn restart_container(&self, name_or_id: &str) -> Result<()> {
        info!(container = %name_or_id, "restarting container");
        self.docker(&["restart".to_string(), name_or_id.to_string()])
            .await?;

        Ok(())
    }
}
