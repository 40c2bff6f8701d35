use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Subcommand;
use console::style;

use crate::config::Config;
use crate::docker::{self, DockerRunOpts};
use crate::ports;
use crate::registry::ContainerRegistry;
use crate::services;
use crate::shell::{RunOpts, Runner, ShellOutput};
use crate::update;
use crate::util::random_hex;

#[derive(Debug, Clone, Subcommand)]
pub enum Verb {
    /// Print the CLI version
    Version {
        #[arg(long)]
        simple: bool,
    },
    /// Check the development environment
    Check,
    /// Upgrade the CLI to the latest release
    Upgrade {
        #[arg(long)]
        reinstall: bool,
    },
    /// Format the app sources in the container
    Format,
    /// Lint and byte-compile the app sources
    Lint,
    /// Type-check the app sources
    Compile,
    /// Run the test suite against ephemeral MongoDB/Redis
    Tests {
        #[arg(long)]
        verbose: bool,
    },
    /// Build the app Docker image
    Build,
    /// Rebuild the app Docker image without cache
    Rebuild,
    /// Run the whole CI pipeline
    Ci,
    /// Start the dev API with ephemeral MongoDB/Redis
    Start {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        verbose: bool,
    },
    /// Stop every container started by this tool
    Stop,
    /// Ping the running API
    Ping,
    /// Create an admin user in the session database
    CreateAdmin,
    /// Show pending database changes
    DbChanges,
    /// Apply database migrations
    DbMigrate,
    /// Drop the dev database
    DbClean,
    /// Push the dev branch
    UpdateDev,
    /// Push the alpha branch
    CreateAlpha,
    /// Open the admin UI in the browser
    Admin,
    /// Interactive Python REPL in the app container
    Python,
    /// Report a bug
    ReportBug,
}

/// Verb-name registry; composites resolve their stages through this same
/// mapping at invoke time.
pub fn resolve(name: &str) -> Option<Verb> {
    Some(match name {
        "version" => Verb::Version { simple: false },
        "check" => Verb::Check,
        "upgrade" => Verb::Upgrade { reinstall: false },
        "format" => Verb::Format,
        "lint" => Verb::Lint,
        "compile" => Verb::Compile,
        "tests" => Verb::Tests { verbose: false },
        "build" => Verb::Build,
        "rebuild" => Verb::Rebuild,
        "ci" => Verb::Ci,
        "start" => Verb::Start {
            port: None,
            verbose: false,
        },
        "stop" => Verb::Stop,
        "ping" => Verb::Ping,
        "create-admin" => Verb::CreateAdmin,
        "db-changes" => Verb::DbChanges,
        "db-migrate" => Verb::DbMigrate,
        "db-clean" => Verb::DbClean,
        "update-dev" => Verb::UpdateDev,
        "create-alpha" => Verb::CreateAlpha,
        "admin" => Verb::Admin,
        "python" => Verb::Python,
        "report-bug" => Verb::ReportBug,
        _ => return None,
    })
}

const CI_PIPELINE: &[&str] = &["format", "lint", "compile", "build", "tests"];

/// Everything a command unit needs, threaded explicitly.
pub struct CommandContext<R: Runner> {
    pub config: Config,
    pub registry: ContainerRegistry,
    pub runner: R,
    pub cwd: PathBuf,
}

/// Single dispatch point: one verb, one unit of work.
pub async fn run<R: Runner>(ctx: &mut CommandContext<R>, verb: &Verb) -> Result<()> {
    match verb {
        Verb::Version { simple } => version(*simple).await,
        Verb::Check => check(ctx).await,
        Verb::Upgrade { reinstall } => upgrade(*reinstall).await,
        Verb::Format => format_sources(ctx).await,
        Verb::Lint => lint(ctx).await,
        Verb::Compile => compile(ctx).await,
        Verb::Tests { verbose } => tests(ctx, *verbose).await,
        Verb::Build => build(ctx, false).await,
        Verb::Rebuild => build(ctx, true).await,
        Verb::Ci => ci(ctx).await,
        Verb::Start { port, verbose } => start(ctx, *port, *verbose).await,
        Verb::Stop => stop(ctx).await,
        Verb::Ping => ping(ctx).await,
        Verb::CreateAdmin => create_admin(ctx).await,
        Verb::DbChanges => db_command(ctx, "db_changes").await,
        Verb::DbMigrate => db_command(ctx, "db_migrate").await,
        Verb::DbClean => db_clean(ctx).await,
        Verb::UpdateDev => {
            println!("{}", style("git push to `dev` branch").yellow());
            Ok(())
        }
        Verb::CreateAlpha => {
            println!("{}", style("git push to `alpha` branch").yellow());
            Ok(())
        }
        Verb::Admin => {
            open::that(&ctx.config.admin_url)?;
            Ok(())
        }
        Verb::Python => {
            let opts = DockerRunOpts {
                interactive: true,
                ..DockerRunOpts::default()
            };
            into_result(docker::docker_run(&ctx.runner, &ctx.config, &ctx.cwd, &opts, "env/bin/python").await?)
        }
        Verb::ReportBug => {
            println!("{}", style("Noted, it will be investigated.").yellow());
            Ok(())
        }
    }
}

fn into_result(out: ShellOutput) -> Result<()> {
    if out.error {
        Err(anyhow!("`{}` exited with status {}", out.cmd, out.code))
    } else {
        Ok(())
    }
}

fn env_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn version(simple: bool) -> Result<()> {
    if simple {
        println!("{}", update::VERSION);
        return Ok(());
    }
    println!("APIKit CLI");
    println!("Current version: {}", update::VERSION);
    match update::latest_version().await {
        Ok(latest) => println!("Latest version:  {latest}"),
        Err(e) => {
            tracing::debug!(error = %e, "version check failed");
            println!("{}", style("Update check failed.").yellow());
        }
    }
    Ok(())
}

/// Per-check diagnostic lines for the project files; `true` marks a failure
/// of a required file.
fn project_file_checks(dir: &Path) -> Vec<(String, bool)> {
    let mut results = Vec::new();
    if !dir.join("Dockerfile").is_file() {
        results.push((format!("Dockerfile {}", style("is required.").red()), true));
    }
    if !dir.join("requirements-app.txt").is_file() {
        results.push((
            format!("requirements-app.txt {}", style("is recommended.").yellow()),
            false,
        ));
    }
    if !dir.join("apps").is_dir() {
        results.push((format!("apps {}", style("dir is required.").red()), true));
    }
    results
}

async fn check<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let mut error = false;

    let docker_ok = matches!(
        ctx.runner.run("docker --version", &RunOpts::default()).await,
        Ok(out) if !out.error
    );
    if !docker_ok {
        println!("{}", style("Docker not found or it is not running.").red());
        error = true;
    }

    for (line, required_failure) in project_file_checks(&ctx.cwd) {
        println!("{line}");
        error |= required_failure;
    }

    match update::latest_version().await {
        Ok(latest) if update::version_lower_than(update::VERSION, &latest) => {
            println!(
                "{}",
                style(format!(
                    "APIKit CLI is out of date. Current {}. Latest {latest}",
                    update::VERSION
                ))
                .yellow()
            );
        }
        Ok(_) => {}
        Err(_) => println!("{}", style("Update check failed.").yellow()),
    }

    if error {
        println!("{}", style("Env is not OK.").red());
        anyhow::bail!("environment check failed");
    }
    println!("{}", style("Env is OK.").green());
    Ok(())
}

async fn upgrade(reinstall: bool) -> Result<()> {
    let outcome = async {
        if reinstall {
            return update::upgrade_executable().await;
        }
        let latest = update::latest_version().await?;
        if update::version_lower_than(update::VERSION, &latest) {
            println!(
                "{}",
                style(format!(
                    "APIKit CLI is out of date. Current {}. Latest {latest}",
                    update::VERSION
                ))
                .yellow()
            );
            update::upgrade_executable().await
        } else {
            println!(
                "APIKit CLI is up to date. Current {} - Latest {latest}",
                update::VERSION
            );
            Ok(())
        }
    }
    .await;

    // Soft failure: the tool stays usable without the upgrade.
    if let Err(e) = outcome {
        eprintln!("{}", style(e.to_string()).red());
        println!("{}", style("Update check failed.").yellow());
    }
    Ok(())
}

async fn format_sources<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let opts = DockerRunOpts::default();
    into_result(
        docker::docker_run(&ctx.runner, &ctx.config, &ctx.cwd, &opts, "env/bin/ruff format /app/apps").await?,
    )
}

async fn lint<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let opts = DockerRunOpts::default();
    into_result(
        docker::docker_run(
            &ctx.runner,
            &ctx.config,
            &ctx.cwd,
            &opts,
            "env/bin/ruff check /app/apps --fix",
        )
        .await?,
    )?;
    into_result(
        docker::docker_run(
            &ctx.runner,
            &ctx.config,
            &ctx.cwd,
            &opts,
            "env/bin/python -OO -m compileall --workers 10 -q /app/apps",
        )
        .await?,
    )
}

async fn compile<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let opts = DockerRunOpts::default();
    into_result(
        docker::docker_run(
            &ctx.runner,
            &ctx.config,
            &ctx.cwd,
            &opts,
            r#"env/bin/mypy /app/apps --strict --exclude "env/|tests""#,
        )
        .await?,
    )
}

async fn tests<R: Runner>(ctx: &mut CommandContext<R>, verbose: bool) -> Result<()> {
    let ctx = &*ctx;
    let app = ctx.config.app.clone();
    let mongodb_name = services::service_name(&app, "tests", "mongodb");
    let redis_name = services::service_name(&app, "tests", "redis");
    let custom_apps_dir = std::env::var("APIKIT_APPS_DIR").unwrap_or_default();
    let pytest_flags = if verbose {
        "--no-header --tb=line"
    } else {
        "--no-header -q --disable-warnings --tb=no"
    };

    services::with_mongodb(
        &ctx.runner,
        &ctx.registry,
        &mongodb_name,
        None,
        false,
        |mongodb_url| async move {
            services::with_redis(&ctx.runner, &ctx.registry, &redis_name, false, |redis_url| async move {
                let mut pytest_cmd =
                    "/app/env/bin/pytest --asyncio-mode=auto /app/apps".to_string();
                if !custom_apps_dir.is_empty() {
                    pytest_cmd.push(' ');
                    pytest_cmd.push_str(&custom_apps_dir);
                }
                pytest_cmd.push_str(" -n auto ");
                pytest_cmd.push_str(pytest_flags);

                let opts = DockerRunOpts {
                    env: env_pairs(&[
                        ("DEV_ENV", "true"),
                        ("TEST_ENV", "true"),
                        ("MONGODB_URI", &mongodb_url),
                        ("MONGODB_NAME", &format!("{app}_unittest")),
                        ("REDIS_URL", &redis_url),
                    ]),
                    ..DockerRunOpts::default()
                };
                into_result(
                    docker::docker_run(&ctx.runner, &ctx.config, &ctx.cwd, &opts, &pytest_cmd).await?,
                )
            })
            .await
        },
    )
    .await
}

async fn build<R: Runner>(ctx: &mut CommandContext<R>, no_cache: bool) -> Result<()> {
    docker::build_image(&ctx.runner, &ctx.cwd, &ctx.config.docker_image, no_cache).await
}

/// Best-effort CI pipeline: every stage runs regardless of prior failures,
/// the exit code reflects whether any failed.
async fn ci<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let mut failed = Vec::new();
    for name in CI_PIPELINE {
        let verb = resolve(name).ok_or_else(|| anyhow!("unknown verb {name}"))?;
        if let Err(e) = Box::pin(run(ctx, &verb)).await {
            eprintln!("{}", style(format!("{name}: {e:#}")).red());
            failed.push(*name);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("ci stages failed: {}", failed.join(", "))
    }
}

async fn start<R: Runner>(
    ctx: &mut CommandContext<R>,
    port_override: Option<u16>,
    verbose: bool,
) -> Result<()> {
    let mut config = ctx.config.clone();
    let ctx = &*ctx;
    let app = config.app.clone();
    let mongodb_name = services::service_name(&app, "dev", "mongodb");
    let redis_name = services::service_name(&app, "dev", "redis");
    let config = &mut config;

    services::with_mongodb(
        &ctx.runner,
        &ctx.registry,
        &mongodb_name,
        Some(Path::new(".db")),
        false,
        |mongodb_url| async move {
            services::with_redis(&ctx.runner, &ctx.registry, &redis_name, false, |redis_url| async move {
                let api_name = format!("{app}_api_{}", random_hex(8));
                ctx.registry.record(&api_name)?;

                let port = match port_override {
                    Some(port) => port,
                    None => ports::find_free_port(config.port, config.port.saturating_add(99), false)?,
                };
                config.set_port(port);
                config.mongodb_url = Some(mongodb_url.clone());
                config.mongodb_db = Some(format!("{app}_dev"));
                config.redis_url = Some(redis_url.clone());
                config.token = random_hex(128);
                println!("{} {}", style("API:").yellow(), config.api_url);
                println!("{} {}", style("ADMIN:").yellow(), config.admin_url);
                config.save()?;

                let uvicorn_cmd = format!(
                    "/app/env/bin/uvicorn api_web.version_server:asgi_app \
                     --host 0.0.0.0 --port {port} --workers 1 --loop uvloop \
                     --interface asgi3 --lifespan on --no-server-header \
                     --no-date-header --reload --reload-dir ./apps"
                );
                let opts = DockerRunOpts {
                    port_mapping: Some((port, port)),
                    container_name: Some(api_name),
                    env: env_pairs(&[
                        ("DEV_ENV", "true"),
                        ("API_VERSION", "dev"),
                        ("APP", &app),
                        ("MONGODB_URI", &mongodb_url),
                        ("MONGODB_NAME", &format!("{app}_dev")),
                        ("REDIS_URL", &redis_url),
                        ("APIKIT_SECRET_KEY", &config.token),
                        (
                            "APIKIT_LOG_PRINT_MIN_LEVEL",
                            if verbose { "info" } else { "success" },
                        ),
                    ]),
                    ..DockerRunOpts::default()
                };
                into_result(
                    docker::docker_run(&ctx.runner, config, &ctx.cwd, &opts, &uvicorn_cmd).await?,
                )
            })
            .await
        },
    )
    .await
}

/// Stop everything the registry knows about, including leftovers from a
/// crashed session, then clear the ledger.
async fn stop<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    for container in ctx.registry.running() {
        services::stop_container(&ctx.runner, &container).await;
    }
    ctx.registry.clear();
    Ok(())
}

async fn ping<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let url = format!("{}/status/ping", ctx.config.api_url);
    match reqwest::Client::new().post(&url).send().await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            println!("{status} {body}");
            Ok(())
        }
        Err(e) => {
            println!("{}", style(format!("API is not reachable: {e}")).red());
            Ok(())
        }
    }
}

fn session_db_env(config: &Config) -> Option<Vec<(String, String)>> {
    let mongodb_url = config.mongodb_url.clone()?;
    Some(env_pairs(&[
        ("MONGODB_URI", &mongodb_url),
        ("MONGODB_NAME", config.mongodb_db.as_deref().unwrap_or_default()),
        ("REDIS_URL", config.redis_url.as_deref().unwrap_or_default()),
        ("API_VERSION", "dev"),
    ]))
}

async fn create_admin<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let Some(env) = session_db_env(&ctx.config) else {
        println!("{}", style("Start the API first: apikit start").yellow());
        return Ok(());
    };

    let email: String = dialoguer::Input::new()
        .with_prompt("Enter admin's email")
        .interact_text()?;
    let password: String = dialoguer::Password::new()
        .with_prompt("Enter admin's password")
        .interact()?;

    let opts = DockerRunOpts {
        env,
        ..DockerRunOpts::default()
    };
    let cmd = format!(
        "/app/env/bin/python commands.py create_admin --email {email} --password {password}"
    );
    into_result(docker::docker_run(&ctx.runner, &ctx.config, &ctx.cwd, &opts, &cmd).await?)
}

async fn db_command<R: Runner>(ctx: &mut CommandContext<R>, subcommand: &str) -> Result<()> {
    let Some(env) = session_db_env(&ctx.config) else {
        println!("{}", style("Start the API first: apikit start").yellow());
        return Ok(());
    };

    let opts = DockerRunOpts {
        env,
        ..DockerRunOpts::default()
    };
    let cmd = format!("/app/env/bin/python commands.py {subcommand}");
    into_result(docker::docker_run(&ctx.runner, &ctx.config, &ctx.cwd, &opts, &cmd).await?)
}

async fn db_clean<R: Runner>(ctx: &mut CommandContext<R>) -> Result<()> {
    let (Some(mongodb_url), Some(mongodb_db)) =
        (ctx.config.mongodb_url.clone(), ctx.config.mongodb_db.clone())
    else {
        println!("{}", style("Start the API first: apikit start").yellow());
        return Ok(());
    };

    let cmd = format!(
        "env/bin/python -c 'from pymongo import MongoClient; \
         MongoClient(\"{mongodb_url}\").drop_database(\"{mongodb_db}\")'"
    );
    into_result(
        docker::docker_run(&ctx.runner, &ctx.config, &ctx.cwd, &DockerRunOpts::default(), &cmd)
            .await?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::SpyRunner;

    fn context_in(dir: &Path, runner: SpyRunner) -> CommandContext<SpyRunner> {
        let config = Config::load(dir);
        let registry = ContainerRegistry::for_app(&format!("cmd_test_{}", random_hex(8)));
        CommandContext {
            config,
            registry,
            runner,
            cwd: dir.to_path_buf(),
        }
    }

    #[test]
    fn missing_manifest_is_reported_as_required_failure() {
        let dir = tempfile::tempdir().unwrap();
        let checks = project_file_checks(dir.path());

        let dockerfile = checks.iter().find(|(line, _)| line.contains("Dockerfile")).unwrap();
        assert!(dockerfile.1);
        let apps = checks.iter().find(|(line, _)| line.contains("apps")).unwrap();
        assert!(apps.1);
        // recommended-only file does not fail the check
        let reqs = checks
            .iter()
            .find(|(line, _)| line.contains("requirements-app.txt"))
            .unwrap();
        assert!(!reqs.1);
    }

    #[test]
    fn populated_project_passes_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("requirements-app.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("apps")).unwrap();

        assert!(project_file_checks(dir.path()).is_empty());
    }

    #[test]
    fn every_ci_stage_resolves() {
        for name in CI_PIPELINE {
            assert!(resolve(name).is_some(), "{name} must resolve");
        }
        assert!(resolve("no-such-verb").is_none());
    }

    #[tokio::test]
    async fn ci_runs_every_stage_despite_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let mut ctx = context_in(dir.path(), SpyRunner::failing_on(&["docker run"]));

        let err = run(&mut ctx, &Verb::Ci).await.unwrap_err();
        let message = err.to_string();

        // format and tests both failed, yet build (docker build) still ran
        assert!(message.contains("format"));
        assert!(message.contains("tests"));
        assert!(!message.contains("build"));
        assert_eq!(ctx.runner.count_starting_with("docker build"), 1);
        assert!(ctx.runner.count_starting_with("docker run") >= 4);
        ctx.registry.clear();
    }

    #[tokio::test]
    async fn start_registers_services_and_api_then_stops_services() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let mut ctx = context_in(dir.path(), SpyRunner::default());

        run(&mut ctx, &Verb::Start { port: Some(34999), verbose: false })
            .await
            .unwrap();

        // mongodb + redis + api recorded, in acquisition order
        let recorded = ctx.registry.running();
        assert_eq!(recorded.len(), 3);
        assert!(recorded[0].contains("_dev_mongodb_"));
        assert!(recorded[1].contains("_dev_redis_"));
        assert!(recorded[2].contains("_api_"));

        // both ephemeral services stopped when the dev session ended
        assert_eq!(ctx.runner.count_starting_with("docker stop"), 2);

        // the API container got the requested port mapping
        let api_run = ctx
            .runner
            .calls()
            .into_iter()
            .find(|c| c.contains("uvicorn"))
            .unwrap();
        assert!(api_run.contains("-p 34999:34999"));

        // session state persisted
        let reloaded = Config::load(dir.path());
        assert_eq!(reloaded.port, 34999);
        assert!(reloaded.mongodb_url.is_some());
        assert_eq!(reloaded.token.len(), 128);
        ctx.registry.clear();
    }

    #[tokio::test]
    async fn stop_drains_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_in(dir.path(), SpyRunner::default());
        ctx.registry.record("left_over_mongodb").unwrap();
        ctx.registry.record("left_over_api").unwrap();

        run(&mut ctx, &Verb::Stop).await.unwrap();

        assert_eq!(ctx.runner.count_starting_with("docker stop"), 2);
        assert!(ctx.registry.running().is_empty());
    }

    #[tokio::test]
    async fn db_commands_require_a_started_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_in(dir.path(), SpyRunner::default());

        // no mongodb_url in config: nothing runs, no error
        run(&mut ctx, &Verb::DbMigrate).await.unwrap();
        assert!(ctx.runner.calls().is_empty());
        ctx.registry.clear();
    }

    #[tokio::test]
    async fn db_migrate_passes_session_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let mut ctx = context_in(dir.path(), SpyRunner::default());
        ctx.config.mongodb_url = Some("mongodb://host.docker.internal:33250".into());
        ctx.config.mongodb_db = Some("myapp_dev".into());
        ctx.config.redis_url = Some("redis://host.docker.internal:33251/0".into());

        run(&mut ctx, &Verb::DbMigrate).await.unwrap();

        let cmd = &ctx.runner.calls()[1]; // [0] is the image inspect
        assert!(cmd.contains("-e MONGODB_URI=mongodb://host.docker.internal:33250"));
        assert!(cmd.contains("-e MONGODB_NAME=myapp_dev"));
        assert!(cmd.ends_with("commands.py db_migrate"));
        ctx.registry.clear();
    }
}
