//! Launchers
//!
//! The orchestrator treats a service's launch descriptor as opaque and hands
//! it to a [`Launcher`]. [`RuntimeLauncher`] runs host processes directly and
//! drives containers through a docker-compatible CLI.

use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::config::{LaunchDescriptor, ServiceSpec};
use crate::error::{Error, Result};

/// Brings services up and down
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the service. Returns once the runtime has accepted it; readiness
    /// is the health monitor's concern.
    async fn launch(&self, service: &ServiceSpec) -> Result<()>;

    /// Stop a previously launched service
    async fn stop(&self, service: &ServiceSpec) -> Result<()>;
}

/// Host processes plus a container runtime CLI (`docker`, `podman`, ...)
pub struct RuntimeLauncher {
    runtime: String,
    children: DashMap<String, Child>,
}

impl RuntimeLauncher {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            children: DashMap::new(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Arguments of `<runtime> run` for an image
    pub fn run_args(service: &ServiceSpec, image: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            service.name.clone(),
        ];
        for port in &service.ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        for (key, value) in &service.environment {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.to_string());
        args
    }

    /// Image tag used for services built from a context
    pub fn build_tag(service: &ServiceSpec) -> String {
        format!("{}:latest", service.name)
    }

    async fn runtime_command(&self, service: &ServiceSpec, args: &[String]) -> Result<()> {
        debug!("{} {}", self.runtime, args.join(" "));
        let output = Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Launch {
                service: service.name.clone(),
                reason: format!("cannot run {}: {}", self.runtime, e),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Launch {
                service: service.name.clone(),
                reason: format!(
                    "{} {} exited with {}: {}",
                    self.runtime,
                    args.first().map(String::as_str).unwrap_or_default(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    fn spawn_process(&self, service: &ServiceSpec, argv: &[String]) -> Result<()> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::Launch {
            service: service.name.clone(),
            reason: "empty command".to_string(),
        })?;

        let child = Command::new(program)
            .args(args)
            .envs(&service.environment)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Launch {
                service: service.name.clone(),
                reason: format!("cannot spawn {}: {}", program, e),
            })?;

        info!("Spawned {} (pid {:?})", service.name, child.id());
        if let Some(mut previous) = self.children.insert(service.name.clone(), child) {
            warn!("{} was already running; killing previous process", service.name);
            let _ = previous.start_kill();
        }
        Ok(())
    }
}

#[async_trait]
impl Launcher for RuntimeLauncher {
    #[instrument(skip(self, service), fields(service = %service.name))]
    async fn launch(&self, service: &ServiceSpec) -> Result<()> {
        match &service.launch {
            LaunchDescriptor::Builtin => {
                debug!("{} is built in; nothing to launch", service.name);
                Ok(())
            }
            LaunchDescriptor::Command(argv) => self.spawn_process(service, argv),
            LaunchDescriptor::Image(image) => {
                self.runtime_command(service, &Self::run_args(service, image))
                    .await?;
                info!("Started container {} from {}", service.name, image);
                Ok(())
            }
            LaunchDescriptor::Build(context) => {
                let tag = Self::build_tag(service);
                let build = vec![
                    "build".to_string(),
                    "-t".to_string(),
                    tag.clone(),
                    context.clone(),
                ];
                self.runtime_command(service, &build).await?;
                self.runtime_command(service, &Self::run_args(service, &tag))
                    .await?;
                info!("Built and started container {} from {}", service.name, context);
                Ok(())
            }
        }
    }

    #[instrument(skip(self, service), fields(service = %service.name))]
    async fn stop(&self, service: &ServiceSpec) -> Result<()> {
        match &service.launch {
            LaunchDescriptor::Builtin => Ok(()),
            LaunchDescriptor::Command(_) => {
                if let Some((_, mut child)) = self.children.remove(&service.name) {
                    child.kill().await.map_err(|e| Error::Launch {
                        service: service.name.clone(),
                        reason: format!("cannot kill process: {}", e),
                    })?;
                    info!("Stopped process {}", service.name);
                }
                Ok(())
            }
            LaunchDescriptor::Image(_) | LaunchDescriptor::Build(_) => {
                let args = vec!["rm".to_string(), "-f".to_string(), service.name.clone()];
                self.runtime_command(service, &args).await?;
                info!("Removed container {}", service.name);
                Ok(())
            }
        }
    }
}
