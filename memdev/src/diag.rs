//! Startup and scheduler diagnostics.

use std::mem::size_of;

use crate::config::Config;

/// Log the one-time startup report: primitive sizes, page size, build
/// target and the effective parameter values.
pub fn startup_report(config: &Config) {
    log::info!(
        "sizes: u8={} u16={} u32={} u64={} usize={} ptr={}",
        size_of::<u8>(),
        size_of::<u16>(),
        size_of::<u32>(),
        size_of::<u64>(),
        size_of::<usize>(),
        size_of::<*const u8>()
    );
    log::info!("page size: {} bytes", page_size());
    log::info!(
        "build: {} {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH,
        if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        }
    );
    log::info!(
        "params: devices={} ceiling={} prefix=[{}] beacons={} workers={} units={}",
        config.devices,
        config.capacity_ceiling,
        config.prefix,
        config.beacons,
        config.workers,
        config.effective_units()
    );
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

/// Log the calling thread's scheduling policy and real-time priority.
#[cfg(unix)]
pub fn log_scheduler_policy(tag: &str) {
    let mut policy: libc::c_int = 0;
    let mut param = libc::sched_param {
        sched_priority: 0,
    };
    // SAFETY: out-pointers are valid for the duration of the call.
    let rc = unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) };
    if rc == 0 {
        log::info!(
            "{tag}: policy {} ({policy}) rt_priority {}",
            policy_name(policy),
            param.sched_priority
        );
    } else {
        log::warn!("{tag}: scheduling policy unavailable (err {rc})");
    }
}

#[cfg(not(unix))]
pub fn log_scheduler_policy(tag: &str) {
    log::info!("{tag}: scheduling policy unavailable on this target");
}

#[cfg(unix)]
#[must_use]
pub fn policy_name(policy: libc::c_int) -> &'static str {
    match policy {
        libc::SCHED_OTHER => "SCHED_OTHER",
        libc::SCHED_FIFO => "SCHED_FIFO",
        libc::SCHED_RR => "SCHED_RR",
        _ => "SCHED_UNKNOWN",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn policy_names() {
        assert_eq!(policy_name(libc::SCHED_RR), "SCHED_RR");
        assert_eq!(policy_name(libc::SCHED_OTHER), "SCHED_OTHER");
        assert_eq!(policy_name(-1), "SCHED_UNKNOWN");
    }

    #[test]
    fn page_size_is_sane() {
        assert!(page_size() >= 512);
    }
}
