use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use uuid::Uuid;

use super::executor::{run_to_completion, ExecSpec, ProcessExecutor, ProcessOutcome};
use super::CommandError;

const CONTAINER_WORKDIR: &str = "/workspace";
const DOCKER_MISSING_HINT: &str = "Docker not found. Install Docker (e.g. Docker Desktop from https://docker.com) and ensure it is running.";

/// Which image runs which program, and how to reach the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI, normally `docker`.
    pub binary: String,
    /// Image for programs without an entry in `images`.
    pub default_image: String,
    pub images: HashMap<String, String>,
    /// Images that must run as root to write into the bind mount (JVM caches).
    pub run_as_root_images: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let images = [
            ("python", "python:3.12-slim"),
            ("python3", "python:3.12-slim"),
            ("pip", "python:3.12-slim"),
            ("pip3", "python:3.12-slim"),
            ("pytest", "python:3.12-slim"),
            ("ruff", "python:3.12-slim"),
            ("black", "python:3.12-slim"),
            ("mypy", "python:3.12-slim"),
            ("django-admin", "python:3.12-slim"),
            ("node", "node:20"),
            ("npm", "node:20"),
            ("npx", "node:20"),
            ("yarn", "node:20"),
            ("pnpm", "node:20"),
            ("bun", "oven/bun:1"),
            ("java", "eclipse-temurin:21-jdk"),
            ("javac", "eclipse-temurin:21-jdk"),
            ("mvn", "maven:3.9-eclipse-temurin-21"),
            ("mvnw", "maven:3.9-eclipse-temurin-21"),
            ("gradle", "gradle:8-jdk21"),
            ("gradlew", "gradle:8-jdk21"),
            ("kotlinc", "eclipse-temurin:21-jdk"),
            ("kotlin", "eclipse-temurin:21-jdk"),
            ("scala", "eclipse-temurin:21-jdk"),
            ("scalac", "eclipse-temurin:21-jdk"),
            ("sbt", "eclipse-temurin:21-jdk"),
            ("go", "golang:1.22"),
            ("cargo", "rust:1"),
            ("rustc", "rust:1"),
            ("dotnet", "mcr.microsoft.com/dotnet/sdk:8.0"),
            ("ruby", "ruby:3.2"),
            ("gem", "ruby:3.2"),
            ("bundle", "ruby:3.2"),
            ("php", "php:8.2-cli"),
            ("composer", "composer:2"),
            ("swift", "swift:5.9"),
            ("swiftc", "swift:5.9"),
            ("gcc", "gcc:13"),
            ("g++", "gcc:13"),
            ("make", "gcc:13"),
            ("cmake", "kitware/cmake:latest"),
            ("perl", "perl:5.38"),
            ("lua", "lua:5.4"),
            ("Rscript", "r-base:4.4"),
            ("ghc", "haskell:9"),
            ("cabal", "haskell:9"),
            ("elixir", "elixir:1.15"),
            ("mix", "elixir:1.15"),
        ]
        .into_iter()
        .map(|(program, image)| (program.to_string(), image.to_string()))
        .collect();

        Self {
            binary: "docker".into(),
            default_image: "alpine:3.19".into(),
            images,
            run_as_root_images: vec![
                "maven:3.9-eclipse-temurin-21".into(),
                "eclipse-temurin:21-jdk".into(),
                "gradle:8-jdk21".into(),
            ],
        }
    }
}

impl ContainerConfig {
    pub fn image_for(&self, program: &str) -> &str {
        self.images
            .get(program)
            .map(String::as_str)
            .unwrap_or(&self.default_image)
    }
}

/// Runs each command in a throwaway container with only the workspace root
/// bind-mounted.
#[derive(Debug, Clone, Default)]
pub struct ContainerExecutor {
    config: ContainerConfig,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    fn run_args(&self, spec: &ExecSpec, name: &str) -> Vec<String> {
        let image = self.config.image_for(&spec.program);
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
            "-v".into(),
            format!("{}:{CONTAINER_WORKDIR}", spec.workspace_root.display()),
            "-w".into(),
            container_cwd(&spec.workspace_root, &spec.cwd),
            "-e".into(),
            format!("HOME={CONTAINER_WORKDIR}"),
            "-e".into(),
            format!("NPM_CONFIG_CACHE={CONTAINER_WORKDIR}/.npm-cache"),
            "-e".into(),
            format!(
                "MAVEN_OPTS=-Dmaven.repo.local={CONTAINER_WORKDIR}/.m2/repository -Duser.home={CONTAINER_WORKDIR}"
            ),
        ];
        if !self.config.run_as_root_images.iter().any(|i| i == image) {
            if let Some(user) = host_user() {
                args.push("-u".into());
                args.push(user);
            }
        }
        args.push(image.to_string());
        args.push(spec.program.clone());
        args.extend(spec.args.iter().cloned());
        args
    }

    async fn remove_container(&self, name: &str) {
        let mut command = Command::new(&self.config.binary);
        command.args(["rm", "-f", name]);
        if let Err(error) = run_to_completion(command, Duration::from_secs(30), 4096).await {
            tracing::warn!(container = name, "failed to remove timed out container: {error}");
        }
    }
}

#[async_trait]
impl ProcessExecutor for ContainerExecutor {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn execute(&self, spec: &ExecSpec) -> Result<ProcessOutcome, CommandError> {
        let name = format!("pdd-{}", Uuid::new_v4().simple());
        let mut command = Command::new(&self.config.binary);
        command
            .args(self.run_args(spec, &name))
            .current_dir(&spec.workspace_root);

        tracing::debug!(
            container = %name,
            image = self.config.image_for(&spec.program),
            program = %spec.program,
            "starting container"
        );
        match run_to_completion(command, spec.timeout, spec.max_output_bytes).await {
            Ok(outcome) => {
                if outcome.timed_out {
                    // Killing the CLI client leaves the container running.
                    self.remove_container(&name).await;
                }
                Ok(outcome)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(ProcessOutcome::not_found(DOCKER_MISSING_HINT))
            }
            Err(source) => Err(CommandError::Spawn {
                program: self.config.binary.clone(),
                source,
            }),
        }
    }
}

fn container_cwd(root: &Path, cwd: &Path) -> String {
    let relative = cwd
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    if relative.is_empty() {
        CONTAINER_WORKDIR.to_string()
    } else {
        format!("{CONTAINER_WORKDIR}/{relative}")
    }
}

#[cfg(unix)]
fn host_user() -> Option<String> {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(format!("{uid}:{gid}"))
}

#[cfg(not(unix))]
fn host_user() -> Option<String> {
    None
}
