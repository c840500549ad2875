//! Docker API wrapper using the bollard crate.
//!
//! Only the calls a stage worker needs: make sure the image is present,
//! create and start the container, wait for its exit, read its output and
//! tear it down.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use crate::error::WorkerError;
use crate::execution::resources::StageLimits;

/// Container definition for one worker.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// `None` keeps the image's default command.
    pub cmd: Option<Vec<String>>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub limits: StageLimits,
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            limits: StageLimits::default(),
            labels: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: StageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cmd(mut self, cmd: Option<Vec<String>>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Replaces the environment with the given pairs.
    pub fn with_env<'a>(mut self, env: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        self.env = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn host_config(&self) -> HostConfig {
        HostConfig {
            memory: Some(self.limits.memory_bytes()),
            cpu_period: Some(self.limits.cpu_period()),
            cpu_quota: Some(self.limits.cpu_quota()),
            pids_limit: Some(self.limits.max_processes),
            ..Default::default()
        }
    }

    /// Translates into the bollard create body.
    fn to_bollard(&self) -> Config<String> {
        Config {
            image: Some(self.image.clone()),
            cmd: self.cmd.clone(),
            env: (!self.env.is_empty()).then(|| self.env.clone()),
            labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
            host_config: Some(self.host_config()),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }
}

/// Docker client wrapper for worker containers.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Runtime` if the daemon socket cannot be opened.
    pub fn new() -> Result<Self, WorkerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| WorkerError::Runtime(format!("connecting to Docker: {e}")))?;
        Ok(Self { docker })
    }

    /// Pulls `image` unless it is already present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<(), WorkerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling worker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| WorkerError::StartFailed {
                image: image.to_string(),
                reason: format!("pull failed: {e}"),
            })?;
        }
        Ok(())
    }

    /// Creates a container and returns its id.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, WorkerError> {
        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config.to_bollard())
            .await
            .map_err(|e| WorkerError::StartFailed {
                image: config.image.clone(),
                reason: format!("create failed: {e}"),
            })?;

        debug!(container_id = %response.id, name = %config.name, "Created worker container");
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), WorkerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| WorkerError::Runtime(format!("starting {id}: {e}")))
    }

    /// Blocks until the container is no longer running and returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, WorkerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(WorkerError::Runtime(format!("waiting on {id}: {e}"))),
            None => self.exit_code(id).await,
        }
    }

    /// Exit code recorded by the daemon for a stopped container.
    async fn exit_code(&self, id: &str) -> Result<i64, WorkerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| WorkerError::Runtime(format!("inspecting {id}: {e}")))?;

        let state = info.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            return Err(WorkerError::Runtime(format!(
                "{id} still running after wait returned"
            )));
        }
        Ok(state.exit_code.unwrap_or(-1))
    }

    /// Combined stdout and stderr of the container.
    pub async fn read_logs(&self, id: &str) -> Result<String, WorkerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut frames = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message },
                ) => output.push_str(&String::from_utf8_lossy(&message)),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => return Err(WorkerError::Runtime(format!("reading logs of {id}: {e}"))),
            }
        }
        Ok(output)
    }

    /// Sends SIGTERM, then SIGKILL once `grace` has passed.
    pub async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), WorkerError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| WorkerError::Runtime(format!("stopping {id}: {e}")))
    }

    /// Force-removes the container and its anonymous volumes.
    ///
    /// A container the daemon no longer knows about counts as removed.
    pub async fn remove_container(&self, id: &str) -> Result<(), WorkerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %id, "Container already gone");
                Ok(())
            }
            Err(e) => Err(WorkerError::Runtime(format!("removing {id}: {e}"))),
        }
    }
}
