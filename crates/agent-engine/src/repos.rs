use std::ffi::OsStr;
use std::path::Path;

use anyhow::Context;
use tokio::process::Command;

use hpcq_agent_core::config::{Config, RepoSpec};

use crate::api::SyncedRepo;

/// Bring every configured external repo to its pinned ref and return the
/// resolved commits. Callers hold the process-wide sync lock: this function
/// mutates shared on-disk state under the repos root.
pub(crate) async fn sync_external_repos(config: &Config) -> anyhow::Result<Vec<SyncedRepo>> {
    let mut synced = Vec::with_capacity(config.external_repos.len());
    if config.external_repos.is_empty() {
        return Ok(synced);
    }

    tokio::fs::create_dir_all(&config.external_repos_root)
        .await
        .with_context(|| {
            format!(
                "create repos root {}",
                config.external_repos_root.display()
            )
        })?;

    for spec in &config.external_repos {
        let dir = config.external_repos_root.join(&spec.name);
        sync_one(spec, &dir)
            .await
            .with_context(|| format!("sync repo {}", spec.name))?;
        let commit = git(&dir, ["rev-parse", "HEAD"]).await?;
        synced.push(SyncedRepo {
            name: spec.name.clone(),
            path: dir.display().to_string(),
            git_ref: spec.gitref.clone(),
            commit,
        });
    }

    Ok(synced)
}

async fn sync_one(spec: &RepoSpec, dir: &Path) -> anyhow::Result<()> {
    if dir.join(".git").exists() {
        git(dir, ["remote", "set-url", "origin", spec.url.as_str()]).await?;
        git(dir, ["fetch", "--depth", "1", "origin", spec.gitref.as_str()]).await?;
        git(dir, ["reset", "--hard", "FETCH_HEAD"]).await?;
        git(dir, ["clean", "-fdx"]).await?;
    } else {
        let parent = dir
            .parent()
            .ok_or_else(|| anyhow::anyhow!("repo dir {} has no parent", dir.display()))?;
        git(
            parent,
            [
                OsStr::new("clone"),
                OsStr::new("--depth"),
                OsStr::new("1"),
                OsStr::new("--branch"),
                OsStr::new(&spec.gitref),
                OsStr::new(&spec.url),
                dir.as_os_str(),
            ],
        )
        .await?;
    }
    Ok(())
}

async fn git<I, S>(cwd: &Path, args: I) -> anyhow::Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args
        .into_iter()
        .map(|a| a.as_ref().to_os_string())
        .collect();
    let shown = args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");

    let out = Command::new("git")
        .args(&args)
        .current_dir(cwd)
        .output()
        .await
        .with_context(|| format!("spawn git {shown}"))?;

    if !out.status.success() {
        anyhow::bail!(
            "git {shown} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
