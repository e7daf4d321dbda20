use std::time::Duration;

/// `outer: inner` rendering of an error and its causes, skipping blank and repeated links.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut links: Vec<String> = err
        .chain()
        .map(|cause| cause.to_string())
        .filter(|text| !text.is_empty())
        .collect();
    links.dedup();
    if links.is_empty() {
        return "unknown error".to_owned();
    }
    links.join(": ")
}

fn check_kill(rc: i32) -> std::io::Result<()> {
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // Already gone.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Sends `sig` to every process in group `pgid`. A vanished group is not an error.
#[cfg(unix)]
pub fn signal_group(pgid: i32, sig: i32) -> std::io::Result<()> {
    if pgid <= 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }
    let rc = unsafe { libc::kill(-pgid, sig) };
    check_kill(rc)
}

/// Sends `sig` to one process. A vanished process is not an error.
#[cfg(unix)]
pub fn signal_pid(pid: u32, sig: i32) -> std::io::Result<()> {
    if pid <= 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    }
    let rc = unsafe { libc::kill(pid as i32, sig) };
    check_kill(rc)
}

/// True if `pid` exists (zombies included).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Parent pid from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn read_parent_pid(pid: u32) -> Option<u32> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_ppid(&s)
}

#[cfg(not(target_os = "linux"))]
fn read_parent_pid(_pid: u32) -> Option<u32> {
    None
}

// The command name may contain spaces and parens, so split after the last ')'.
fn stat_fields(stat: &str) -> Option<std::str::SplitWhitespace<'_>> {
    let end = stat.rfind(')')?;
    Some(stat.get((end + 2)..)?.split_whitespace())
}

fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let mut fields = stat_fields(stat)?;
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

fn parse_stat_pgrp(stat: &str) -> Option<i32> {
    stat_fields(stat)?.nth(2)?.parse().ok()
}

/// Live members of process group `pgid` other than `exclude`, found by scanning `/proc`.
pub fn group_members(pgid: i32, exclude: u32) -> Vec<u32> {
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    rd.flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| pid != exclude)
        .filter(|&pid| {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|s| parse_stat_pgrp(&s))
                == Some(pgid)
        })
        .collect()
}

/// Terminates every other process in the caller's group when the caller leads it.
///
/// Catches processes that joined the group without being our children.
#[cfg(unix)]
pub async fn sweep_own_group(grace: Duration) -> usize {
    let me = std::process::id();
    let pgid = unsafe { libc::getpgrp() };
    if pgid != me as i32 {
        tracing::debug!(pgid, pid = me, "not a process group leader; skipping group sweep");
        return 0;
    }
    sweep_group(pgid, me, grace).await
}

pub(crate) async fn sweep_group(pgid: i32, exclude: u32, grace: Duration) -> usize {
    let members = group_members(pgid, exclude);
    if !members.is_empty() {
        tracing::info!(pgid, count = members.len(), "terminating remaining group members");
        terminate_pids(&members, grace).await;
    }
    members.len()
}

/// All transitive children of `root`, found by scanning `/proc`.
pub fn descendant_pids(root: u32) -> Vec<u32> {
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let table: Vec<(u32, u32)> = rd
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| Some((pid, read_parent_pid(pid)?)))
        .collect();
    collect_descendants(root, &table)
}

fn collect_descendants(root: u32, table: &[(u32, u32)]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for &(pid, ppid) in table {
            if ppid == parent && pid != root && !out.contains(&pid) {
                out.push(pid);
                frontier.push(pid);
            }
        }
    }
    out
}

/// SIGTERM every pid, wait up to `grace` for them to vanish, then SIGKILL the rest.
#[cfg(unix)]
pub async fn terminate_pids(pids: &[u32], grace: Duration) {
    for &pid in pids {
        if let Err(e) = signal_pid(pid, libc::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
        }
    }
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if pids.iter().all(|&p| !pid_alive(p)) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for &pid in pids {
        if pid_alive(pid) {
            tracing::debug!(pid, "escalating to SIGKILL");
            let _ = signal_pid(pid, libc::SIGKILL);
        }
    }
}
