//! Source repository inspection

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::errors::PodliftError;

/// State of the working copy being deployed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInfo {
    /// Short commit hash
    pub commit: String,
    pub branch: Option<String>,
    /// Tag pointing exactly at HEAD
    pub tag: Option<String>,
    pub clean: bool,
    pub remote_url: Option<String>,
}

impl GitInfo {
    /// Inspect the repository containing `dir`
    pub async fn inspect(dir: &Path) -> Result<Self, PodliftError> {
        if git(dir, &["rev-parse", "--git-dir"]).await.is_none() {
            return Err(PodliftError::BuildFailed(format!(
                "{} is not a git repository",
                dir.display()
            )));
        }

        let commit = git(dir, &["rev-parse", "--short", "HEAD"])
            .await
            .ok_or_else(|| PodliftError::BuildFailed("failed to read commit hash".to_string()))?;
        let branch = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .filter(|b| b != "HEAD");
        let tag = git(dir, &["describe", "--exact-match", "--tags", "HEAD"]).await;
        let clean = git(dir, &["status", "--porcelain"])
            .await
            .map(|s| s.is_empty())
            .unwrap_or(false);
        let remote_url = git(dir, &["config", "--get", "remote.origin.url"]).await;

        Ok(Self {
            commit,
            branch,
            tag,
            clean,
            remote_url,
        })
    }

    /// Tag if HEAD is tagged, otherwise the short hash
    pub fn version(&self) -> String {
        self.tag.clone().unwrap_or_else(|| self.commit.clone())
    }
}

async fn git(dir: &Path, args: &[&str]) -> Option<String> {
    debug!("git {}", args.join(" "));
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Canonical form of a repository URL for identity comparison
///
/// `git@github.com:org/app.git`, `https://github.com/org/app` and
/// `HTTPS://GitHub.com/Org/App.git/` all normalise to `github.com/org/app`.
pub fn normalize_repo_url(url: &str) -> String {
    let mut s = url.trim().to_lowercase();
    for prefix in ["https://", "http://", "ssh://", "git://"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }
    if let Some((user, rest)) = s.split_once('@') {
        if !user.contains('/') {
            s = rest.to_string();
        }
    }
    s = s.trim_end_matches('/').to_string();
    if let Some(rest) = s.strip_suffix(".git") {
        s = rest.to_string();
    }
    if let Some((host, path)) = s.split_once(':') {
        if !path.starts_with('/') && !path.chars().all(|c| c.is_ascii_digit()) {
            s = format!("{}/{}", host, path);
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_prefers_tag() {
        let mut info = GitInfo {
            commit: "abc1234".to_string(),
            branch: Some("main".to_string()),
            tag: Some("v1.2.0".to_string()),
            clean: true,
            remote_url: None,
        };
        assert_eq!(info.version(), "v1.2.0");
        info.tag = None;
        assert_eq!(info.version(), "abc1234");
    }

    #[test]
    fn test_normalize_repo_url() {
        let expected = "github.com/acme/shop";
        assert_eq!(normalize_repo_url("git@github.com:acme/shop.git"), expected);
        assert_eq!(normalize_repo_url("https://github.com/acme/shop"), expected);
        assert_eq!(normalize_repo_url("HTTPS://GitHub.com/Acme/Shop.git/"), expected);
        assert_ne!(normalize_repo_url("git@github.com:acme/blog.git"), expected);
    }

    #[tokio::test]
    async fn test_inspect_outside_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitInfo::inspect(dir.path()).await.is_err());
    }
}
