use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::RpFilter;
use crate::error::{Result, VethError};

/// Default mount point of the sysctl tree
pub const PROC_SYS: &str = "/proc/sys";

/// Reads and writes kernel parameters under a sysctl tree.
///
/// Paths under `net/` resolve against the network namespace of the calling
/// thread.
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new(PROC_SYS)
    }
}

impl Sysctl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a key such as `net/ipv4/conf/all/rp_filter`.
    pub fn get(&self, key: &str) -> Result<String> {
        let path = self.root.join(key);
        fs::read_to_string(&path)
            .map(|v| v.trim().to_string())
            .map_err(|e| VethError::Io(e).wrap(format!("failed to read sysctl {}", key)))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.root.join(key);
        fs::write(&path, value)
            .map_err(|e| VethError::Io(e).wrap(format!("failed to set sysctl {} to {}", key, value)))
    }

    /// Device entries below a per-device config directory, e.g. `net/ipv6/conf`.
    pub fn devices(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.root.join(dir);
        let entries = fs::read_dir(&path)
            .map_err(|e| VethError::Io(e).wrap(format!("failed to list {}", path.display())))?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            devices.push(entry.file_name().to_string_lossy().into_owned());
        }
        devices.sort();
        Ok(devices)
    }

    /// Force `disable_ipv6` to 0 on every device.
    pub fn enable_ipv6(&self) -> Result<()> {
        debug!(root = %self.root.display(), "setting disable_ipv6 to 0 on all interfaces");
        for device in self.devices("net/ipv6/conf")? {
            let key = format!("net/ipv6/conf/{}/disable_ipv6", device);
            if self.get(&key)? != "0" {
                self.set(&key, "0")?;
            }
        }
        Ok(())
    }

    /// Set `rp_filter` to `value` on every IPv4 device.
    ///
    /// Entries that cannot be read are skipped; matching values are not rewritten.
    pub fn set_rp_filter(&self, value: u8) -> Result<()> {
        let value = value.to_string();
        for device in self.devices("net/ipv4/conf")? {
            let key = format!("net/ipv4/conf/{}/rp_filter", device);
            let current = match self.get(&key) {
                Ok(current) => current,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable rp_filter");
                    continue;
                }
            };
            if current != value {
                self.set(&key, &value)?;
            }
        }
        Ok(())
    }

    /// Apply the host half of the policy: only when enabled.
    pub fn apply_host_rp_filter(&self, policy: &RpFilter) -> Result<()> {
        if !policy.enabled {
            return Ok(());
        }
        self.set_rp_filter(policy.value)
            .map_err(|e| e.wrap("failed to set rp_filter in host"))
    }
}
