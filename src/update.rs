use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const LATEST_VERSION_URL: &str =
    "https://raw.githubusercontent.com/CodeArtLibs/apikit_cli/refs/heads/main/releases/latest.txt";
const RELEASE_DOWNLOAD_BASE: &str =
    "https://github.com/CodeArtLibs/apikit_cli/releases/download/latest";

/// Fetch the published latest-version string.
pub async fn latest_version() -> Result<String> {
    let text = reqwest::get(LATEST_VERSION_URL)
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(text.trim().to_string())
}

/// Dotted-integer version comparison; the shorter side is zero-padded.
pub fn version_lower_than(v1: &str, v2: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let mut a = parse(v1);
    let mut b = parse(v2);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a < b
}

/// `{os}-{arch}` as used in release file names, e.g. `linux-x64`,
/// `macos-arm64`.
pub fn platform_arch() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{}-{arch}", std::env::consts::OS)
}

/// Replace the running executable with the latest release and re-exec.
///
/// Download lands next to the current binary, the previous binary is kept
/// under a `.old` name as a rollback point, and the swap is a single rename.
pub async fn upgrade_executable() -> Result<()> {
    let platform = platform_arch();
    let mut release_file = format!("apikit-{platform}-latest");
    if cfg!(windows) {
        release_file.push_str(".exe");
    }
    let url = format!("{RELEASE_DOWNLOAD_BASE}/{release_file}");

    let data = reqwest::get(&url)
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    if data.is_empty() {
        anyhow::bail!("downloaded release is empty: {url}");
    }

    let exe = std::env::current_exe().context("cannot locate current executable")?;
    let staged = exe.with_extension("new");
    std::fs::write(&staged, &data)
        .with_context(|| format!("failed to write {}", staged.display()))?;
    // The download loses its executable permission.
    restore_exec_bit(&staged)?;

    let backup = exe.with_extension("old");
    std::fs::copy(&exe, &backup).context("failed to keep rollback copy")?;
    std::fs::rename(&staged, &exe).context("failed to replace executable")?;

    println!("{}", style("Updated. Restarting...").green());
    reexec(&exe)
}

#[cfg(unix)]
fn restore_exec_bit(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_exec_bit(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn reexec(exe: &Path) -> Result<()> {
    use std::os::unix::process::CommandExt;
    let args: Vec<String> = std::env::args().skip(1).collect();
    // Only returns on failure.
    Err(std::process::Command::new(exe).args(args).exec().into())
}

#[cfg(not(unix))]
fn reexec(exe: &Path) -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    std::process::Command::new(exe).args(args).spawn()?;
    std::process::exit(0);
}
