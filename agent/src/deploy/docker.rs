//! Docker operations: compose build/restart and single containers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::deploy::command::{CommandRunner, CommandSpec};
use crate::errors::AgentError;

/// The compose project built from the checkout
#[derive(Clone)]
pub struct ComposeStack {
    runner: Arc<dyn CommandRunner>,
    project_dir: PathBuf,
    compose_file: Option<String>,
    build_timeout: Duration,
    restart_timeout: Duration,
}

impl ComposeStack {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        project_dir: impl Into<PathBuf>,
        compose_file: Option<String>,
        build_timeout: Duration,
        restart_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            project_dir: project_dir.into(),
            compose_file,
            build_timeout,
            restart_timeout,
        }
    }

    fn compose(&self, args: &[&str], timeout: Duration) -> CommandSpec {
        let mut full = vec!["compose".to_string()];
        if let Some(file) = &self.compose_file {
            full.push("-f".to_string());
            full.push(file.clone());
        }
        full.extend(args.iter().map(|a| a.to_string()));

        CommandSpec::new("docker", full)
            .current_dir(&self.project_dir)
            .timeout(timeout)
    }

    /// Rebuild the application images from source
    pub async fn build(&self) -> Result<(), AgentError> {
        info!("Building images in {}", self.project_dir.display());
        self.runner
            .run_checked(&self.compose(&["build"], self.build_timeout))
            .await?;
        Ok(())
    }

    /// Recreate the containers from the freshly built images
    pub async fn restart(&self) -> Result<(), AgentError> {
        info!("Restarting containers in {}", self.project_dir.display());
        self.runner
            .run_checked(&self.compose(
                &["up", "-d", "--remove-orphans"],
                self.restart_timeout,
            ))
            .await?;
        Ok(())
    }
}

/// Plain `docker` container operations
#[derive(Clone)]
pub struct Containers {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Containers {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Start a detached container, replacing any container with the same name
    pub async fn run(&self, name: &str, image: &str, labels: &[(&str, &str)]) -> Result<(), AgentError> {
        self.remove(name).await?;

        debug!("Pulling image: {}", image);
        let pull = CommandSpec::new("docker", ["pull", image]).timeout(self.timeout);
        if let Err(e) = self.runner.run_checked(&pull).await {
            // Locally built images have nothing to pull
            debug!("docker pull {} failed, using local image: {}", image, e);
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--restart".into(),
            "unless-stopped".into(),
        ];
        for (key, value) in labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.into());

        info!("Starting container {} from {}", name, image);
        self.runner
            .run_checked(&CommandSpec::new("docker", args).timeout(self.timeout))
            .await?;
        Ok(())
    }

    /// Force-remove a container; a missing container is not an error
    pub async fn remove(&self, name: &str) -> Result<(), AgentError> {
        debug!("Removing container: {}", name);
        let output = self
            .runner
            .run(&CommandSpec::new("docker", ["rm", "-f", name]).timeout(self.timeout))
            .await?;
        if !output.success() && !output.stderr.contains("No such container") {
            return Err(AgentError::CommandError(format!(
                "docker rm -f {} failed: {}",
                name,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}
