//! Process hardening for a daemon that keeps private keys in memory.
//!
//! Best-effort: each step logs a warning on failure and startup continues.

/// Disable core dumps and ptrace-style memory reads, then pin memory so key
/// material is never swapped out.  Call before any key is loaded.
pub fn harden_process() {
    disable_core_dumps();
    lock_memory();
}

#[cfg(target_os = "linux")]
fn disable_core_dumps() {
    // SAFETY: PR_SET_DUMPABLE takes a plain integer and touches no memory.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong) };
    if ret == 0 {
        tracing::debug!("process marked non-dumpable");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed: {err}");
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_core_dumps() {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if ret == 0 {
        tracing::debug!("core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("setrlimit(RLIMIT_CORE, 0) failed: {err}");
    }
}

fn lock_memory() {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("memory pages locked in RAM");
    } else {
        // EPERM or ENOMEM without CAP_IPC_LOCK or a large enough RLIMIT_MEMLOCK.
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed, keys may be swapped to disk: {err}");
    }
}
