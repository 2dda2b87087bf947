use crate::model::NetMap;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Persistent identity of the embedded overlay node. Kept in the state
/// directory so the node id stays stable across runs.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub node_name: String,
    pub wg_private_key: String,
    pub wg_public_key: String,
    #[serde(default)]
    pub node_token: Option<String>,
    pub ipv4: String,
    pub ipv6: String,
    pub last_netmap: Option<NetMap>,
    pub updated_at: i64,
}

pub fn state_dir(hostname: &str) -> PathBuf {
    resolve_state_dir(
        hostname,
        std::env::var_os("TAILPROXY_STATE_DIR").map(PathBuf::from),
        std::env::var_os("XDG_STATE_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
    )
}

fn resolve_state_dir(
    hostname: &str,
    explicit: Option<PathBuf>,
    xdg_state_home: Option<PathBuf>,
    home: Option<PathBuf>,
) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    let state_home = xdg_state_home.or_else(|| home.map(|home| home.join(".local").join("state")));
    match state_home {
        Some(base) => base.join("tailproxy").join(hostname),
        None => std::env::temp_dir().join(format!("tailproxy-{}", hostname)),
    }
}

/// Creates the directory with owner-only permissions; the embedded node
/// owns its contents.
pub fn ensure_state_dir(hostname: &str) -> Result<PathBuf> {
    let dir = state_dir(hostname);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create state directory {}", dir.display()))?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to restrict state directory {}", dir.display()))?;
    Ok(dir)
}

pub fn node_state_path(state_dir: &Path) -> PathBuf {
    state_dir.join("node.json")
}

pub fn load_state(path: &Path) -> Result<Option<NodeState>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(_) => Ok(None),
    }
}

pub fn save_state(path: &Path, state: &NodeState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(path, json)?;
    Ok(())
}
