//! Volume mount builder for sandbox launches.

use std::fs;
use std::path::Path;

use nanoclaw_core::VolumeMount;
use nanoclaw_core::ipc::IpcPaths;
use tracing::debug;

use super::security::{GroupContainerConfig, MountAllowlist, validate_additional_mounts};

/// The slice of a registered group the mount builder needs.
pub struct GroupInfo {
    pub folder: String,
    pub name: String,
    pub container_config: Option<GroupContainerConfig>,
}

/// Build the mount list for one sandbox launch.
///
/// - every group: its own working directory (rw) and IPC namespace (rw)
/// - main only: the project root, read-only
/// - non-main: the shared `global` directory, read-only, when present
/// - extras from `container_config`, validated against the external allowlist
pub fn build_volume_mounts(
    group: &GroupInfo,
    is_main: bool,
    project_root: &Path,
    groups_dir: &Path,
    ipc: &IpcPaths,
    allowlist: Option<&MountAllowlist>,
) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    let group_dir = groups_dir.join(&group.folder);
    fs::create_dir_all(&group_dir).ok();

    if is_main {
        mounts.push(VolumeMount {
            host_path: project_root.to_string_lossy().to_string(),
            container_path: "/workspace/project".to_string(),
            readonly: true,
        });
    }

    mounts.push(VolumeMount {
        host_path: group_dir.to_string_lossy().to_string(),
        container_path: "/workspace/group".to_string(),
        readonly: false,
    });

    if !is_main {
        let global_dir = groups_dir.join("global");
        if global_dir.exists() {
            mounts.push(VolumeMount {
                host_path: global_dir.to_string_lossy().to_string(),
                container_path: "/workspace/global".to_string(),
                readonly: true,
            });
        }
    }

    // Per-folder IPC namespace; the folder name is the authorization
    // principal, so only this folder's tree is ever mounted.
    ipc.ensure_folder(&group.folder).ok();
    mounts.push(VolumeMount {
        host_path: ipc.folder_dir(&group.folder).to_string_lossy().to_string(),
        container_path: "/workspace/ipc".to_string(),
        readonly: false,
    });

    if let Some(config) = &group.container_config {
        if !config.additional_mounts.is_empty() {
            if let Some(allowlist) = allowlist {
                for vm in validate_additional_mounts(
                    &config.additional_mounts,
                    &group.folder,
                    is_main,
                    allowlist,
                ) {
                    mounts.push(VolumeMount {
                        host_path: vm.host_path,
                        container_path: vm.container_path,
                        readonly: vm.readonly,
                    });
                }
            } else {
                debug!(
                    folder = group.folder.as_str(),
                    count = config.additional_mounts.len(),
                    "skipping extra mounts, no allowlist loaded"
                );
            }
        }
    }

    mounts
}

/// Generate the container name for a folder: strip everything outside
/// `[A-Za-z0-9-]`, reject when nothing survives.
pub fn container_name(folder: &str) -> Option<String> {
    let safe: String = folder
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if safe.is_empty() {
        return None;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    Some(format!("nanoclaw-{safe}-{now}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (std::path::PathBuf, std::path::PathBuf, IpcPaths) {
        let project_root = tmp.path().join("project");
        let groups_dir = tmp.path().join("groups");
        fs::create_dir_all(&project_root).unwrap();
        fs::create_dir_all(&groups_dir).unwrap();
        (project_root, groups_dir, IpcPaths::new(tmp.path().join("data")))
    }

    fn group(folder: &str) -> GroupInfo {
        GroupInfo {
            folder: folder.into(),
            name: "Test".into(),
            container_config: None,
        }
    }

    #[test]
    fn main_gets_project_root_read_only() {
        let tmp = TempDir::new().unwrap();
        let (project_root, groups_dir, ipc) = setup(&tmp);

        let mounts =
            build_volume_mounts(&group("main"), true, &project_root, &groups_dir, &ipc, None);

        let project = mounts
            .iter()
            .find(|m| m.container_path == "/workspace/project")
            .expect("project mount");
        assert!(project.readonly);

        let group_mount = mounts
            .iter()
            .find(|m| m.container_path == "/workspace/group")
            .expect("group mount");
        assert!(!group_mount.readonly);
    }

    #[test]
    fn non_main_gets_global_not_project() {
        let tmp = TempDir::new().unwrap();
        let (project_root, groups_dir, ipc) = setup(&tmp);
        fs::create_dir_all(groups_dir.join("global")).unwrap();

        let mounts = build_volume_mounts(
            &group("team-eng"),
            false,
            &project_root,
            &groups_dir,
            &ipc,
            None,
        );

        assert!(mounts.iter().all(|m| m.container_path != "/workspace/project"));
        let global = mounts
            .iter()
            .find(|m| m.container_path == "/workspace/global")
            .expect("global mount");
        assert!(global.readonly);
    }

    #[test]
    fn ipc_namespace_created_and_mounted() {
        let tmp = TempDir::new().unwrap();
        let (project_root, groups_dir, ipc) = setup(&tmp);

        let mounts =
            build_volume_mounts(&group("main"), true, &project_root, &groups_dir, &ipc, None);

        assert!(mounts.iter().any(|m| m.container_path == "/workspace/ipc"));
        assert!(ipc.input_dir("main").exists());
        assert!(ipc.messages_dir("main").exists());
        assert!(ipc.tasks_dir("main").exists());
    }

    #[test]
    fn container_name_sanitizes_and_rejects_empty() {
        let name = container_name("team.eng/2").unwrap();
        assert!(name.starts_with("nanoclaw-teameng2-"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));

        assert!(container_name("../..").is_none());
        assert!(container_name("").is_none());
    }
}
