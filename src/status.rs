//! Host resource sampling for the status report.

use crate::domain::NodeStatus;

fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (used / total * 100.0).clamp(0.0, 100.0)
}

/// Samples cpu load, memory use, root filesystem use and uptime. Any probe that fails
/// reports zero.
#[cfg(target_os = "linux")]
pub fn sample() -> NodeStatus {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;

    let mut loads = [0f64; 3];
    // SAFETY: `loads` has room for the requested three samples.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    let cpu = if n >= 1 { percent(loads[0], cpus) } else { 0.0 };

    // SAFETY: sysinfo only writes into the zeroed struct we pass.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    let (mem, uptime) = if unsafe { libc::sysinfo(&mut info) } == 0 {
        let unit = f64::from(info.mem_unit.max(1));
        let total = info.totalram as f64 * unit;
        let free = (info.freeram as f64 + info.bufferram as f64) * unit;
        (percent(total - free, total), info.uptime.max(0) as u64)
    } else {
        (0.0, 0)
    };

    NodeStatus {
        cpu,
        mem,
        disk: root_disk_usage(),
        uptime,
    }
}

#[cfg(target_os = "linux")]
fn root_disk_usage() -> f64 {
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: the path is a NUL-terminated literal and `st` is a valid out pointer.
    if unsafe { libc::statvfs(c"/".as_ptr(), &mut st) } != 0 {
        return 0.0;
    }
    let frsize = st.f_frsize as f64;
    let total = st.f_blocks as f64 * frsize;
    let free = st.f_bfree as f64 * frsize;
    percent(total - free, total)
}

#[cfg(not(target_os = "linux"))]
pub fn sample() -> NodeStatus {
    NodeStatus::default()
}
