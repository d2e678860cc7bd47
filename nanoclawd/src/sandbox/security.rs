//! Mount security: validates a group's extra mounts against an external
//! allowlist.
//!
//! The allowlist lives OUTSIDE the project root (default
//! `~/.config/nanoclaw/mount-allowlist.json`) so a sandboxed agent can never
//! edit its own security configuration. No allowlist means no extra mounts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Path fragments that must never appear in a mounted path.
const BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    "credentials",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
];

/// External mount allowlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountAllowlist {
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub non_main_read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default)]
    pub allow_read_write: bool,
}

/// Extra mount request carried in a group's `container_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub host_path: String,
    #[serde(default)]
    pub container_path: Option<String>,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

fn default_true() -> bool {
    true
}

/// Per-group sandbox overrides, stored as JSON on the registered group.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupContainerConfig {
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
    /// Hard-timeout override for this group (milliseconds).
    pub timeout_ms: Option<u64>,
}

/// Validated mount ready for argument construction.
#[derive(Debug, Clone)]
pub struct ValidatedMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

pub fn default_allowlist_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join(".config/nanoclaw/mount-allowlist.json")
}

/// Load the allowlist, merging the built-in blocked patterns. Missing or
/// unreadable files disable extra mounts entirely.
pub fn load_allowlist(path: &Path) -> Option<MountAllowlist> {
    if !path.exists() {
        warn!(path = %path.display(), "mount allowlist not found, extra mounts blocked");
        return None;
    }

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "mount allowlist unreadable, extra mounts blocked");
            return None;
        }
    };

    let mut allowlist: MountAllowlist = match serde_json::from_str(&content) {
        Ok(a) => a,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "mount allowlist unparseable, extra mounts blocked");
            return None;
        }
    };

    let mut merged: Vec<String> = BLOCKED_PATTERNS.iter().map(|s| s.to_string()).collect();
    for pattern in &allowlist.blocked_patterns {
        if !merged.contains(pattern) {
            merged.push(pattern.clone());
        }
    }
    allowlist.blocked_patterns = merged;

    info!(
        path = %path.display(),
        allowed_roots = allowlist.allowed_roots.len(),
        "mount allowlist loaded"
    );
    Some(allowlist)
}

fn expand_path(p: &str) -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    if p == "~" {
        PathBuf::from(&home)
    } else if let Some(rest) = p.strip_prefix("~/") {
        PathBuf::from(&home).join(rest)
    } else {
        PathBuf::from(p)
    }
}

fn matches_blocked_pattern(real: &Path, patterns: &[String]) -> Option<String> {
    for pattern in patterns {
        for component in real.components() {
            let part = component.as_os_str().to_string_lossy();
            if part.contains(pattern.as_str()) {
                return Some(pattern.clone());
            }
        }
    }
    None
}

/// Target must stay inside `/workspace/extra/`: relative, non-empty, no `..`.
fn is_valid_container_path(p: &str) -> bool {
    !p.is_empty() && !p.contains("..") && !p.starts_with('/')
}

/// Validate one extra mount. Returns the resolved mount or a rejection reason.
pub fn validate_mount(
    mount: &AdditionalMount,
    is_main: bool,
    allowlist: &MountAllowlist,
) -> Result<ValidatedMount, String> {
    let container_path = mount
        .container_path
        .as_deref()
        .unwrap_or_else(|| {
            Path::new(&mount.host_path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("mount")
        })
        .to_string();

    if !is_valid_container_path(&container_path) {
        return Err(format!(
            "invalid container path {container_path:?}: must be relative with no \"..\""
        ));
    }

    let expanded = expand_path(&mount.host_path);
    let real = std::fs::canonicalize(&expanded)
        .map_err(|_| format!("host path does not exist: {}", expanded.display()))?;

    if let Some(pattern) = matches_blocked_pattern(&real, &allowlist.blocked_patterns) {
        return Err(format!(
            "path {} matches blocked pattern {pattern:?}",
            real.display()
        ));
    }

    let allowed_root = allowlist
        .allowed_roots
        .iter()
        .find(|root| {
            std::fs::canonicalize(expand_path(&root.path))
                .is_ok_and(|real_root| real.starts_with(&real_root))
        })
        .ok_or_else(|| format!("path {} is not under any allowed root", real.display()))?;

    let requested_read_write = !mount.readonly;
    let readonly = if requested_read_write {
        if !is_main && allowlist.non_main_read_only {
            true
        } else {
            !allowed_root.allow_read_write
        }
    } else {
        true
    };

    Ok(ValidatedMount {
        host_path: real.to_string_lossy().to_string(),
        container_path: format!("/workspace/extra/{container_path}"),
        readonly,
    })
}

/// Validate all extra mounts for a group, keeping only the survivors.
pub fn validate_additional_mounts(
    mounts: &[AdditionalMount],
    folder: &str,
    is_main: bool,
    allowlist: &MountAllowlist,
) -> Vec<ValidatedMount> {
    let mut validated = Vec::new();
    for mount in mounts {
        match validate_mount(mount, is_main, allowlist) {
            Ok(vm) => validated.push(vm),
            Err(reason) => {
                warn!(
                    folder,
                    requested_path = mount.host_path.as_str(),
                    reason = reason.as_str(),
                    "extra mount rejected"
                );
            }
        }
    }
    validated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_allowlist(tmp: &TempDir, allow_rw: bool) -> MountAllowlist {
        MountAllowlist {
            allowed_roots: vec![AllowedRoot {
                path: tmp.path().to_string_lossy().to_string(),
                allow_read_write: allow_rw,
            }],
            blocked_patterns: BLOCKED_PATTERNS.iter().map(|s| s.to_string()).collect(),
            non_main_read_only: true,
        }
    }

    #[test]
    fn allows_path_under_allowed_root() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("project");
        fs::create_dir_all(&sub).unwrap();

        let mount = AdditionalMount {
            host_path: sub.to_string_lossy().to_string(),
            container_path: Some("project".into()),
            readonly: true,
        };
        let vm = validate_mount(&mount, true, &test_allowlist(&tmp, true)).unwrap();
        assert_eq!(vm.container_path, "/workspace/extra/project");
        assert!(vm.readonly);
    }

    #[test]
    fn rejects_path_outside_allowed_roots() {
        let tmp = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let sub = other.path().join("data");
        fs::create_dir_all(&sub).unwrap();

        let mount = AdditionalMount {
            host_path: sub.to_string_lossy().to_string(),
            container_path: None,
            readonly: true,
        };
        let err = validate_mount(&mount, true, &test_allowlist(&tmp, true)).unwrap_err();
        assert!(err.contains("not under any allowed root"));
    }

    #[test]
    fn rejects_ssh_directory() {
        let tmp = TempDir::new().unwrap();
        let ssh = tmp.path().join(".ssh");
        fs::create_dir_all(&ssh).unwrap();

        let mount = AdditionalMount {
            host_path: ssh.to_string_lossy().to_string(),
            container_path: None,
            readonly: true,
        };
        let err = validate_mount(&mount, true, &test_allowlist(&tmp, true)).unwrap_err();
        assert!(err.contains(".ssh"));
    }

    #[test]
    fn rejects_container_path_traversal() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("ok");
        fs::create_dir_all(&sub).unwrap();

        let mount = AdditionalMount {
            host_path: sub.to_string_lossy().to_string(),
            container_path: Some("../../etc/passwd".into()),
            readonly: true,
        };
        assert!(validate_mount(&mount, true, &test_allowlist(&tmp, true)).is_err());

        let mount = AdditionalMount {
            host_path: sub.to_string_lossy().to_string(),
            container_path: Some("/etc/bad".into()),
            readonly: true,
        };
        assert!(validate_mount(&mount, true, &test_allowlist(&tmp, true)).is_err());
    }

    #[test]
    fn non_main_is_forced_read_only() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("data");
        fs::create_dir_all(&sub).unwrap();

        let mount = AdditionalMount {
            host_path: sub.to_string_lossy().to_string(),
            container_path: Some("data".into()),
            readonly: false,
        };

        let vm = validate_mount(&mount, false, &test_allowlist(&tmp, true)).unwrap();
        assert!(vm.readonly);

        let vm = validate_mount(&mount, true, &test_allowlist(&tmp, true)).unwrap();
        assert!(!vm.readonly);
    }

    #[test]
    fn nonexistent_host_path_rejected() {
        let tmp = TempDir::new().unwrap();
        let mount = AdditionalMount {
            host_path: "/nonexistent/nowhere".into(),
            container_path: None,
            readonly: true,
        };
        let err = validate_mount(&mount, true, &test_allowlist(&tmp, true)).unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn batch_validation_filters_failures() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good");
        fs::create_dir_all(&good).unwrap();

        let mounts = vec![
            AdditionalMount {
                host_path: good.to_string_lossy().to_string(),
                container_path: Some("good".into()),
                readonly: true,
            },
            AdditionalMount {
                host_path: "/nonexistent".into(),
                container_path: None,
                readonly: true,
            },
        ];
        let validated =
            validate_additional_mounts(&mounts, "team-eng", true, &test_allowlist(&tmp, true));
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].container_path, "/workspace/extra/good");
    }

    #[test]
    fn group_container_config_parses_from_json() {
        let json = r#"{"additionalMounts":[{"hostPath":"~/projects","readonly":true}],"timeoutMs":600000}"#;
        let cfg: GroupContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.additional_mounts.len(), 1);
        assert_eq!(cfg.timeout_ms, Some(600_000));
    }

    #[test]
    fn missing_allowlist_file_yields_none() {
        assert!(load_allowlist(Path::new("/nonexistent/allowlist.json")).is_none());
    }
}
