//! Multi-process supervision: the master re-executes this binary once per
//! worker, reaps exits, and replaces workers whose resident memory grows
//! past the configured limit.

use std::io;
use std::process::{Child, Command};
use std::time::Duration;

use log::{info, warn};

/// Set in the environment of spawned workers so the entrypoint knows not to
/// fork again.
pub const WORKER_ENV: &str = "TETHER_WORKER";

const PATROL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Supervisor {
    worker_memory_limit: u64,
    name: Option<String>,
}

impl Supervisor {
    pub fn new(worker_memory_limit: u64, name: Option<String>) -> Self {
        Self {
            worker_memory_limit,
            name,
        }
    }

    /// Run the master loop until a termination signal arrives or every
    /// worker has exited on its own.
    pub async fn start(&self, workers: u32) -> io::Result<()> {
        let pid = std::process::id();
        info!("Started master process [{pid}]");
        set_process_title(self.name.as_deref(), true);

        if self.worker_memory_limit > 0 && !cfg!(target_os = "linux") {
            warn!("worker memory limit is only enforced on linux");
        }

        let mut children = Vec::with_capacity(workers as usize);
        for _ in 0..workers {
            children.push(spawn_worker()?);
        }

        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);

        loop {
            #[cfg(unix)]
            let terminated = sigterm.recv();
            #[cfg(not(unix))]
            let terminated = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = &mut interrupted => break,
                _ = terminated => break,
                _ = tokio::time::sleep(PATROL_INTERVAL) => {
                    if !self.patrol(&mut children)? {
                        break;
                    }
                }
            }
        }

        info!("Stopping master process [{pid}]");
        for child in &mut children {
            terminate(child);
        }
        for mut child in children {
            let _ = child.wait();
        }
        info!("Exit master process [{pid}]");
        Ok(())
    }

    /// Reap finished workers and police the memory limit. Returns false
    /// once no workers remain.
    fn patrol(&self, children: &mut Vec<Child>) -> io::Result<bool> {
        let mut index = 0;
        while index < children.len() {
            if children[index].try_wait()?.is_some() {
                let child = children.remove(index);
                info!("worker [{}] exited", child.id());
                continue;
            }
            index += 1;
        }
        if children.is_empty() {
            return Ok(false);
        }

        if self.worker_memory_limit > 0 {
            let mut replacements = 0;
            for child in children.iter() {
                match resident_bytes(child.id()) {
                    Some(rss) if rss > self.worker_memory_limit => {
                        warn!(
                            "worker [{}] killed because memory overflowed ({rss} > {} bytes)",
                            child.id(),
                            self.worker_memory_limit
                        );
                        interrupt(child.id());
                        replacements += 1;
                    }
                    _ => {}
                }
            }
            // the interrupted workers are reaped by the next patrol
            for _ in 0..replacements {
                children.push(spawn_worker()?);
            }
        }

        Ok(true)
    }
}

fn spawn_worker() -> io::Result<Child> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    Command::new(exe).args(args).env(WORKER_ENV, "1").spawn()
}

#[cfg(unix)]
fn interrupt(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGINT);
    }
}

#[cfg(not(unix))]
fn interrupt(_pid: u32) {}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

/// Resident set size of another process, from procfs.
#[cfg(target_os = "linux")]
fn resident_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes(_pid: u32) -> Option<u64> {
    None
}

/// Stamp the process title with a master or worker suffix.
pub fn set_process_title(name: Option<&str>, master: bool) {
    let Some(name) = name else {
        return;
    };
    let suffix = if master { "[master]" } else { "[worker]" };
    let title = format!("{name}{suffix}");

    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        if let Ok(title) = CString::new(title) {
            unsafe {
                libc::prctl(libc::PR_SET_NAME, title.as_ptr(), 0, 0, 0);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = title;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_bytes_of_self() {
        let rss = resident_bytes(std::process::id()).unwrap();
        assert!(rss > 0);
    }

    #[test]
    fn test_resident_bytes_of_missing_process() {
        // pid 0 has no procfs entry
        assert_eq!(resident_bytes(0), None);
    }
}
