use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::dispatcher;

use crate::error::{Result, VethError};

/// Handle on a network namespace, kept open for the whole invocation.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    /// Open the namespace at `path` (e.g. `/var/run/netns/<id>` or `/proc/<pid>/ns/net`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            VethError::Namespace(format!("failed to open {}: {}", path.display(), e))
        })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside this namespace.
    ///
    /// setns() only affects the calling OS thread, so the work runs on a
    /// dedicated thread that enters the namespace and exits afterwards. The
    /// caller's thread never leaves its own namespace. The current tracing
    /// dispatcher and span travel with the work.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        let dispatch = dispatcher::get_default(|d| d.clone());
        let span = tracing::Span::current();

        thread::scope(|scope| {
            let worker = thread::Builder::new()
                .name("netns".to_string())
                .spawn_scoped(scope, || {
                    dispatcher::with_default(&dispatch, || {
                        span.in_scope(|| {
                            setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(
                                |e| {
                                    VethError::Namespace(format!(
                                        "setns failed for {}: {}",
                                        self.path.display(),
                                        e
                                    ))
                                },
                            )?;
                            f()
                        })
                    })
                })?;

            worker.join().map_err(|_| {
                VethError::Namespace(format!(
                    "worker for {} panicked",
                    self.path.display()
                ))
            })?
        })
    }
}
