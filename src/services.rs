use std::future::Future;
use std::path::Path;

use anyhow::Result;

use crate::ports::{find_free_port, SERVICE_PORT_END, SERVICE_PORT_START};
use crate::registry::ContainerRegistry;
use crate::shell::{RunOpts, Runner};
use crate::util::random_hex;

pub const MONGODB_IMAGE: &str = "mongo:8.0.4-noble";
pub const REDIS_IMAGE: &str = "redis:8.0-M02-alpine3.20";

/// `{app}_{scope}_{service}_{suffix}`, unique per session.
pub fn service_name(app: &str, scope: &str, service: &str) -> String {
    format!("{app}_{scope}_{service}_{}", random_hex(8))
}

fn launch_opts() -> RunOpts {
    RunOpts {
        raise_on_error: true,
        ..RunOpts::capture()
    }
}

/// Start a detached MongoDB container on a free host port and return its
/// connection URL. The name is registered for cleanup before the URL is
/// handed out; if registration fails the container is stopped again so
/// nothing runs untracked.
pub async fn run_mongodb<R: Runner>(
    runner: &R,
    registry: &ContainerRegistry,
    name: &str,
    storage: Option<&Path>,
    host_network: bool,
) -> Result<String> {
    let port = find_free_port(SERVICE_PORT_START, SERVICE_PORT_END, true)?;

    let mut argv: Vec<String> = ["docker", "run", "-d"].map(String::from).to_vec();
    if let Some(folder) = storage {
        argv.push("-v".into());
        argv.push(format!("{}:/data/db", folder.display()));
    }
    argv.extend([
        "-p".into(),
        format!("{port}:27017"),
        "--name".into(),
        name.to_string(),
        MONGODB_IMAGE.into(),
        "mongod".into(),
        "--bind_ip_all".into(),
    ]);
    runner.run_argv(&argv, &launch_opts()).await?;

    if let Err(e) = registry.record(name) {
        stop_container(runner, name).await;
        return Err(anyhow::Error::new(e).context("failed to record container for cleanup"));
    }

    // The API container reaches a host-mapped port via the Docker host
    // alias; under host networking the service sits on the loopback.
    if host_network {
        Ok("mongodb://localhost:27017".to_string())
    } else {
        Ok(format!("mongodb://host.docker.internal:{port}"))
    }
}

/// Start a detached Redis container on a free host port. Same registration
/// and URL rules as [`run_mongodb`].
pub async fn run_redis<R: Runner>(
    runner: &R,
    registry: &ContainerRegistry,
    name: &str,
    host_network: bool,
) -> Result<String> {
    let port = find_free_port(SERVICE_PORT_START, SERVICE_PORT_END, true)?;

    let argv: Vec<String> = vec![
        "docker".into(),
        "run".into(),
        "-d".into(),
        "-p".into(),
        format!("{port}:6379"),
        "--name".into(),
        name.to_string(),
        REDIS_IMAGE.into(),
    ];
    runner.run_argv(&argv, &launch_opts()).await?;

    if let Err(e) = registry.record(name) {
        stop_container(runner, name).await;
        return Err(anyhow::Error::new(e).context("failed to record container for cleanup"));
    }

    if host_network {
        Ok("redis://localhost:6379/0".to_string())
    } else {
        Ok(format!("redis://host.docker.internal:{port}/0"))
    }
}

/// Graceful stop with a 3s grace period before Docker kills the container.
/// Best-effort: stopping an already-gone container is not an error.
pub async fn stop_container<R: Runner>(runner: &R, name: &str) {
    let argv: Vec<String> = ["docker", "stop", "-t", "3", name].map(String::from).to_vec();
    match runner.run_argv(&argv, &RunOpts::capture()).await {
        Ok(out) if out.error => {
            tracing::warn!(container = name, code = out.code, "docker stop exited non-zero");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(container = name, error = %e, "failed to stop container"),
    }
}

/// Scoped MongoDB: provision, run the body with the connection URL, stop the
/// container on every exit path of the body.
pub async fn with_mongodb<R, F, Fut, T>(
    runner: &R,
    registry: &ContainerRegistry,
    name: &str,
    storage: Option<&Path>,
    host_network: bool,
    body: F,
) -> Result<T>
where
    R: Runner,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let url = run_mongodb(runner, registry, name, storage, host_network).await?;
    let result = body(url).await;
    stop_container(runner, name).await;
    result
}

/// Scoped Redis, same release discipline as [`with_mongodb`].
pub async fn with_redis<R, F, Fut, T>(
    runner: &R,
    registry: &ContainerRegistry,
    name: &str,
    host_network: bool,
    body: F,
) -> Result<T>
where
    R: Runner,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let url = run_redis(runner, registry, name, host_network).await?;
    let result = body(url).await;
    stop_container(runner, name).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::SpyRunner;

    fn scratch_registry() -> ContainerRegistry {
        ContainerRegistry::for_app(&format!("svc_test_{}", random_hex(8)))
    }

    #[tokio::test]
    async fn run_mongodb_registers_before_returning_url() {
        let runner = SpyRunner::default();
        let registry = scratch_registry();

        let url = run_mongodb(&runner, &registry, "app_tests_mongodb_ab12", None, false)
            .await
            .unwrap();

        assert!(url.starts_with("mongodb://host.docker.internal:"));
        assert_eq!(registry.running(), vec!["app_tests_mongodb_ab12"]);
        registry.clear();
    }

    #[tokio::test]
    async fn host_network_urls_use_loopback() {
        let runner = SpyRunner::default();
        let registry = scratch_registry();

        let mongo = run_mongodb(&runner, &registry, "m", None, true).await.unwrap();
        let redis = run_redis(&runner, &registry, "r", true).await.unwrap();

        assert_eq!(mongo, "mongodb://localhost:27017");
        assert_eq!(redis, "redis://localhost:6379/0");
        registry.clear();
    }

    #[tokio::test]
    async fn storage_mount_is_passed_through() {
        let runner = SpyRunner::default();
        let registry = scratch_registry();

        run_mongodb(&runner, &registry, "m", Some(Path::new(".db")), false)
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls[0].contains("-v .db:/data/db"));
        registry.clear();
    }

    #[tokio::test]
    async fn failing_body_still_stops_the_container() {
        let runner = SpyRunner::default();
        let registry = scratch_registry();

        let result: Result<()> = with_mongodb(&runner, &registry, "m", None, false, |_url| async {
            anyhow::bail!("body blew up")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(runner.count_starting_with("docker run"), 1);
        assert_eq!(runner.count_starting_with("docker stop"), 1);
        registry.clear();
    }

    #[tokio::test]
    async fn nested_scopes_tear_down_in_reverse_order() {
        let runner = SpyRunner::default();
        let registry = scratch_registry();

        let result: Result<()> =
            with_mongodb(&runner, &registry, "mongo_c", None, false, |_mongodb_url| async {
                with_redis(&runner, &registry, "redis_c", false, |_redis_url| async {
                    anyhow::bail!("inner failure")
                })
                .await
            })
            .await;

        assert!(result.is_err());
        let calls = runner.calls();
        let order: Vec<&str> = calls
            .iter()
            .map(|c| {
                if c.starts_with("docker run") && c.contains("mongo_c") {
                    "run mongo"
                } else if c.starts_with("docker run") {
                    "run redis"
                } else if c.contains("redis_c") {
                    "stop redis"
                } else {
                    "stop mongo"
                }
            })
            .collect();
        assert_eq!(order, vec!["run mongo", "run redis", "stop redis", "stop mongo"]);
        registry.clear();
    }

    #[tokio::test]
    async fn successful_body_value_is_returned_after_teardown() {
        let runner = SpyRunner::default();
        let registry = scratch_registry();

        let value = with_redis(&runner, &registry, "r", false, |url| async move {
            assert!(url.starts_with("redis://host.docker.internal:"));
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(runner.count_starting_with("docker stop"), 1);
        registry.clear();
    }

    #[tokio::test]
    async fn failed_launch_registers_nothing() {
        let runner = SpyRunner::failing_on(&["docker run"]);
        let registry = scratch_registry();

        let result = run_redis(&runner, &registry, "r", false).await;

        assert!(result.is_err());
        assert!(registry.running().is_empty());
        registry.clear();
    }

    #[test]
    fn service_names_are_unique_per_call() {
        let a = service_name("app", "tests", "mongodb");
        let b = service_name("app", "tests", "mongodb");
        assert!(a.starts_with("app_tests_mongodb_"));
        assert_ne!(a, b);
    }
}
