//! File logger for a single plugin invocation.
//!
//! The runtime discards plugin stderr, so everything goes to a rotated file.
//! The returned [`Dispatch`] is scoped by the caller rather than installed
//! as the process-wide default.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

use crate::config::{LogOptions, DEFAULT_LOG_MAX_AGE, DEFAULT_LOG_MAX_COUNT, DEFAULT_LOG_MAX_SIZE};
use crate::error::{Result, VethError};

const MIB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;

/// Build the invocation logger described by `options`.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(options: &LogOptions) -> Result<Dispatch> {
    let path = options.file();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .map_err(|e| VethError::Io(e).wrap(format!("failed to create {}", dir.display())))?;
    }

    rotate(
        &path,
        options.max_size.unwrap_or(DEFAULT_LOG_MAX_SIZE),
        options.max_count.unwrap_or(DEFAULT_LOG_MAX_COUNT),
        options.max_age.unwrap_or(DEFAULT_LOG_MAX_AGE),
    )?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| VethError::Io(e).wrap(format!("failed to open {}", path.display())))?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&options.level).map_err(|e| {
            VethError::Config(format!("invalid log_level {:?}: {}", options.level, e))
        })?,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_thread_names(true)
        .finish();

    Ok(Dispatch::new(subscriber))
}

fn rotated(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Roll `path` over once it exceeds `max_size_mib`, keeping `max_count`
/// numbered backups no older than `max_age_days`.
pub fn rotate(path: &Path, max_size_mib: u64, max_count: usize, max_age_days: u64) -> Result<()> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    if size > max_size_mib.saturating_mul(MIB) {
        if max_count == 0 {
            fs::remove_file(path)?;
        } else {
            for index in (1..max_count).rev() {
                let from = rotated(path, index);
                if from.exists() {
                    fs::rename(&from, rotated(path, index + 1))?;
                }
            }
            fs::rename(path, rotated(path, 1))?;
        }
    }

    prune(path, max_count, max_age_days)
}

/// Remove backups beyond `max_count` or older than `max_age_days`.
fn prune(path: &Path, max_count: usize, max_age_days: u64) -> Result<()> {
    let (Some(dir), Some(stem)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let prefix = format!("{}.", stem.to_string_lossy());
    let max_age = Duration::from_secs(max_age_days.saturating_mul(DAY_SECS));
    let now = SystemTime::now();

    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(index) = name
            .strip_prefix(&prefix)
            .and_then(|suffix| suffix.parse::<usize>().ok())
        else {
            continue;
        };

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map_or(false, |age| max_age_days > 0 && age > max_age);

        if index > max_count || expired {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(path: &Path, len: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(&vec![b'x'; len]).unwrap();
    }

    #[test]
    fn small_file_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("veth.log");
        write(&path, 16);
        rotate(&path, 1, 3, 30).unwrap();
        assert!(path.exists());
        assert!(!rotated(&path, 1).exists());
    }

    #[test]
    fn oversized_file_shifts_backups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("veth.log");
        write(&path, (MIB + 1) as usize);
        write(&rotated(&path, 1), 1);
        write(&rotated(&path, 2), 2);

        rotate(&path, 1, 2, 30).unwrap();

        assert!(!path.exists());
        assert_eq!(fs::metadata(rotated(&path, 1)).unwrap().len(), MIB + 1);
        assert_eq!(fs::metadata(rotated(&path, 2)).unwrap().len(), 1);
        assert!(!rotated(&path, 3).exists());
    }

    #[test]
    fn huge_max_size_never_rotates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("veth.log");
        write(&path, 16);
        rotate(&path, u64::MAX, 3, 30).unwrap();
        assert!(path.exists());
        assert!(!rotated(&path, 1).exists());
    }

    #[test]
    fn init_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let options = LogOptions {
            level: "debug".to_string(),
            file_path: dir.path().join("nested/veth.log").display().to_string(),
            ..LogOptions::default()
        };
        let dispatch = init(&options).unwrap();
        tracing::dispatcher::with_default(&dispatch, || tracing::info!("hello"));
        let contents = fs::read_to_string(options.file()).unwrap();
        assert!(contents.contains("hello"));
    }
}
