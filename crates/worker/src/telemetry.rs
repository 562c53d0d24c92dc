//! Process memory sampling for recycle decisions.

use sysinfo::{Pid, Process, ProcessesToUpdate, System};

/// Guard against parent cycles in a stale process table
const MAX_TREE_DEPTH: usize = 64;

/// Resident memory of `root_pid` and all of its descendants, in MB.
///
/// Chrome runs renderers and GPU work in child processes, so the browser
/// pid alone underestimates the footprint. Returns None when the process
/// no longer exists.
pub fn process_tree_rss_mb(root_pid: u32) -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let root = Pid::from_u32(root_pid);
    sys.process(root)?;

    let bytes: u64 = sys
        .processes()
        .values()
        .filter(|process| process.pid() == root || descends_from(&sys, process, root))
        .map(|process| process.memory())
        .sum();

    Some(bytes / (1024 * 1024))
}

fn descends_from(sys: &System, process: &Process, root: Pid) -> bool {
    let mut parent = process.parent();
    for _ in 0..MAX_TREE_DEPTH {
        match parent {
            Some(pid) if pid == root => return true,
            Some(pid) => parent = sys.process(pid).and_then(|p| p.parent()),
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_current_process() {
        assert!(process_tree_rss_mb(std::process::id()).is_some());
    }

    #[test]
    fn test_missing_process_yields_none() {
        assert!(process_tree_rss_mb(u32::MAX - 1).is_none());
    }
}
