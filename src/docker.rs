use std::path::Path;

use anyhow::Result;
use console::style;

use crate::config::Config;
use crate::shell::{split_command_line, RunOpts, Runner, ShellError, ShellOutput};

/// Options for `docker run` against the app image.
#[derive(Debug, Clone)]
pub struct DockerRunOpts {
    pub interactive: bool,
    pub capture_output: bool,
    pub detached: bool,
    /// `-p HOST:CONTAINER`
    pub port_mapping: Option<(u16, u16)>,
    pub host_network: bool,
    pub container_name: Option<String>,
    /// Injected as `-e KEY=VALUE` pairs.
    pub env: Vec<(String, String)>,
    /// Build the app image first when it is missing and a Dockerfile exists.
    pub auto_build: bool,
}

impl Default for DockerRunOpts {
    fn default() -> Self {
        Self {
            interactive: false,
            capture_output: false,
            detached: false,
            port_mapping: None,
            host_network: false,
            container_name: None,
            env: Vec::new(),
            auto_build: true,
        }
    }
}

pub async fn image_exists<R: Runner>(runner: &R, image: &str) -> bool {
    let argv: Vec<String> = ["docker", "image", "inspect", image]
        .map(String::from)
        .to_vec();
    matches!(runner.run_argv(&argv, &RunOpts::capture()).await, Ok(out) if !out.error)
}

/// `docker build` the app image from the Dockerfile in `cwd`.
pub async fn build_image<R: Runner>(
    runner: &R,
    cwd: &Path,
    image: &str,
    no_cache: bool,
) -> Result<()> {
    if !cwd.join("Dockerfile").is_file() {
        anyhow::bail!("Dockerfile is required to build {image}");
    }

    let mut argv: Vec<String> = ["docker", "build"].map(String::from).to_vec();
    if no_cache {
        argv.push("--no-cache".into());
    }
    argv.extend(["-f", "Dockerfile", ".", "-t", image].map(String::from));

    // Build output streams straight to the terminal; no timeout applies.
    let opts = RunOpts {
        cwd: Some(cwd.to_path_buf()),
        raise_on_error: true,
        ..RunOpts::default()
    };
    runner.run_argv(&argv, &opts).await?;
    Ok(())
}

/// Run `container_cmd` inside the app container.
///
/// The `./apps` source tree is always mounted into the container, and the
/// network mode decides how the container reaches host-mapped services:
/// `--network host` puts it on the loopback, otherwise the Docker host
/// alias is wired in with `--add-host`.
pub async fn docker_run<R: Runner>(
    runner: &R,
    config: &Config,
    cwd: &Path,
    opts: &DockerRunOpts,
    container_cmd: &str,
) -> Result<ShellOutput> {
    let image = &config.docker_image;

    if opts.auto_build && !image_exists(runner, image).await {
        if cwd.join("Dockerfile").is_file() {
            println!("{}", style(format!("Building Docker image {image}")).yellow());
            build_image(runner, cwd, image, false).await?;
        } else {
            anyhow::bail!("Dockerfile is required to build {image}");
        }
    }

    let mut argv: Vec<String> = ["docker", "run"].map(String::from).to_vec();
    if opts.detached {
        argv.push("-d".into());
    }
    if let Some(name) = &opts.container_name {
        argv.push("--name".into());
        argv.push(name.clone());
    }
    argv.push("-v".into());
    argv.push("./apps:/app/apps".into());
    for (key, value) in &opts.env {
        argv.push("-e".into());
        argv.push(format!("{key}={value}"));
    }
    if opts.host_network {
        argv.push("--network".into());
        argv.push("host".into());
    } else {
        argv.push("--add-host=host.docker.internal:host-gateway".into());
    }
    if let Some((host, container)) = opts.port_mapping {
        argv.push("-p".into());
        argv.push(format!("{host}:{container}"));
    }
    if opts.interactive {
        argv.push("-it".into());
    }
    argv.push(image.clone());
    argv.extend(
        split_command_line(container_cmd).ok_or_else(|| ShellError::Parse {
            cmd: container_cmd.to_string(),
        })?,
    );

    let run_opts = RunOpts {
        cwd: Some(cwd.to_path_buf()),
        capture_output: opts.capture_output,
        ..RunOpts::default()
    };
    Ok(runner.run_argv(&argv, &run_opts).await?)
}
