// src/net/affinity.rs - Worker thread CPU pinning
//
// cpu >= 0 pins to that core; cpu < 0 restores affinity to every core.
// Platforms without an affinity API accept the call and succeed.

/// Sentinel for "no affinity requested yet".
pub(crate) const AFFINITY_UNSET: i32 = i32::MIN;

#[cfg(target_os = "linux")]
pub(crate) fn set_thread_affinity(thread: libc::pthread_t, cpu: i32) -> bool {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        if cpu >= 0 {
            libc::CPU_SET(cpu as usize, &mut set);
        } else {
            for core in 0..libc::CPU_SETSIZE as usize {
                libc::CPU_SET(core, &mut set);
            }
        }
    }
    // SAFETY: `set` is a fully initialized cpu_set_t on the stack and the
    // size argument matches its type; the call only reads it.
    let ret = unsafe {
        libc::pthread_setaffinity_np(thread, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_thread_affinity(_thread: libc::pthread_t, _cpu: i32) -> bool {
    true
}
