use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::Value;

pub(crate) const STAGED_FILES_DIR: &str = "files";

const DEFAULT_MODE: u32 = 0o644;

/// Materialise `local_files` entries under `<job_dir>/files`, returning the
/// absolute path of every staged file.
///
/// Entries that are not objects, or that carry neither a path nor content,
/// are skipped. A present entry with an empty, absolute, or `..`-containing
/// path fails the whole attempt before any byte of it is written.
pub(crate) async fn stage_local_files(
    entries: &[Value],
    job_dir: &Path,
) -> anyhow::Result<Vec<String>> {
    let files_root = job_dir.join(STAGED_FILES_DIR);
    let mut staged = Vec::new();

    for entry in entries {
        let Some(obj) = entry.as_object() else {
            continue;
        };
        let rel = obj
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        let content = obj
            .get("content_b64")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if rel.is_empty() && content.is_empty() {
            continue;
        }

        let rel_path = checked_relative_path(rel)?;
        let data = B64
            .decode(content.as_bytes())
            .with_context(|| format!("invalid base64 for staged file path={rel}"))?;

        let target = files_root.join(&rel_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create staging directory {}", parent.display()))?;
        }
        tokio::fs::write(&target, &data)
            .await
            .with_context(|| format!("write staged file {}", target.display()))?;

        let mode = parse_mode(obj.get("mode"));
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("chmod staged file {}", target.display()))?;

        staged.push(target.display().to_string());
    }

    Ok(staged)
}

fn checked_relative_path(rel: &str) -> anyhow::Result<PathBuf> {
    if rel.is_empty() {
        anyhow::bail!("staged file path is empty");
    }
    let path = Path::new(rel);
    if path.is_absolute() {
        anyhow::bail!("staged file path is absolute: {rel}");
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        anyhow::bail!("staged file path escapes the job directory: {rel}");
    }
    Ok(path.to_path_buf())
}

// Accepts the octal text the submitter sends ("755") or a bare number; falls
// back to 0o644 on anything unparsable.
fn parse_mode(raw: Option<&Value>) -> u32 {
    let text = match raw {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return DEFAULT_MODE,
    };
    u32::from_str_radix(&text, 8).unwrap_or(DEFAULT_MODE)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn stages_nested_files_with_requested_mode() {
        let dir = TempDir::new().unwrap();
        let entries = vec![json!({
            "path": "scripts/run.sh",
            "content_b64": B64.encode("#!/bin/sh\necho hi\n"),
            "mode": "755"
        })];

        let staged = stage_local_files(&entries, dir.path()).await.unwrap();

        let target = dir.path().join("files/scripts/run.sh");
        assert_eq!(staged, vec![target.display().to_string()]);
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "#!/bin/sh\necho hi\n"
        );
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn default_mode_applies_when_missing_or_invalid() {
        let dir = TempDir::new().unwrap();
        let entries = vec![
            json!({"path": "a.txt", "content_b64": B64.encode("a")}),
            json!({"path": "b.txt", "content_b64": B64.encode("b"), "mode": "not-octal"}),
        ];

        stage_local_files(&entries, dir.path()).await.unwrap();

        for name in ["a.txt", "b.txt"] {
            let mode = std::fs::metadata(dir.path().join("files").join(name))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected_before_writing() {
        let dir = TempDir::new().unwrap();
        let entries = vec![json!({"path": "../etc/x", "content_b64": "AA=="})];

        let err = stage_local_files(&entries, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("escapes the job directory"));
        assert!(!dir.path().join("files").exists());
    }

    #[tokio::test]
    async fn absolute_and_empty_paths_are_rejected() {
        let dir = TempDir::new().unwrap();

        let absolute = vec![json!({"path": "/etc/x", "content_b64": "AA=="})];
        assert!(stage_local_files(&absolute, dir.path()).await.is_err());

        let empty = vec![json!({"path": "", "content_b64": "AA=="})];
        assert!(stage_local_files(&empty, dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn bad_base64_fails_hard() {
        let dir = TempDir::new().unwrap();
        let entries = vec![json!({"path": "x.bin", "content_b64": "@@not-base64@@"})];

        let err = stage_local_files(&entries, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("invalid base64"));
    }

    #[tokio::test]
    async fn junk_entries_are_skipped_and_empty_lists_write_nothing() {
        let dir = TempDir::new().unwrap();

        let entries = vec![json!("not an object"), json!({}), json!(7)];
        let staged = stage_local_files(&entries, dir.path()).await.unwrap();
        assert!(staged.is_empty());
        assert!(!dir.path().join("files").exists());

        let staged = stage_local_files(&[], dir.path()).await.unwrap();
        assert!(staged.is_empty());
        assert!(!dir.path().join("files").exists());
    }
}
