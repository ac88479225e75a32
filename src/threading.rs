//! Thread placement helpers shared by the worker and LB runtimes.

/// Pin the current thread to one core when the platform supports it.
///
/// Compute threads and the I/O thread are pinned on Linux via
/// `pthread_setaffinity_np`; elsewhere this is a no-op. Failures are
/// ignored: an unpinned thread is slower, not wrong.
pub fn set_thread_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);
        let _ = pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
    }
}

/// Request an elevated scheduling class for the current thread.
///
/// Real-time policies need privileges; when the request is refused the
/// thread keeps running under the default policy.
pub fn set_realtime_priority() {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO};
        let mut param: sched_param = std::mem::zeroed();
        param.sched_priority = 70;
        let _ = pthread_setschedparam(pthread_self(), SCHED_FIFO, &param);
    }
}
