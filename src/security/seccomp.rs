//! Seccomp BPF allowlist for the hypervisor process.
//!
//! Applied in the child between fork and exec, so the filter binds the
//! hypervisor without touching the manager. Any syscall outside the
//! allowlist kills the process.

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

/// Builder for the hypervisor syscall allowlist.
pub struct HypervisorSeccomp {
    allowed_syscalls: Vec<i64>,
}

impl HypervisorSeccomp {
    pub fn new() -> Self {
        Self {
            allowed_syscalls: Vec::new(),
        }
    }

    /// The syscalls a Firecracker-style hypervisor needs: file and socket
    /// I/O, guest RAM mappings, KVM ioctls, its epoll event loop, signals,
    /// and clean exit. Notably absent: execve, ptrace, mount, chroot.
    pub fn with_hypervisor_defaults() -> Self {
        let mut filter = Self::new();

        // I/O
        filter.allow(libc::SYS_read);
        filter.allow(libc::SYS_write);
        filter.allow(libc::SYS_close);
        filter.allow(libc::SYS_lseek);
        filter.allow(libc::SYS_pread64);
        filter.allow(libc::SYS_pwrite64);
        filter.allow(libc::SYS_readv);
        filter.allow(libc::SYS_writev);
        filter.allow(libc::SYS_fsync);

        // Guest RAM
        filter.allow(libc::SYS_mmap);
        filter.allow(libc::SYS_munmap);
        filter.allow(libc::SYS_mprotect);
        filter.allow(libc::SYS_brk);
        filter.allow(libc::SYS_madvise);

        // KVM control
        filter.allow(libc::SYS_ioctl);

        // Files and sockets (API socket, vsock backend)
        filter.allow(libc::SYS_openat);
        filter.allow(libc::SYS_fstat);
        filter.allow(libc::SYS_newfstatat);
        filter.allow(libc::SYS_fcntl);
        filter.allow(libc::SYS_dup);
        filter.allow(libc::SYS_socket);
        filter.allow(libc::SYS_bind);
        filter.allow(libc::SYS_listen);
        filter.allow(libc::SYS_accept4);
        filter.allow(libc::SYS_connect);
        filter.allow(libc::SYS_recvfrom);
        filter.allow(libc::SYS_sendto);
        filter.allow(libc::SYS_unlink);

        // Event loop
        filter.allow(libc::SYS_epoll_create1);
        filter.allow(libc::SYS_epoll_ctl);
        filter.allow(libc::SYS_epoll_wait);
        filter.allow(libc::SYS_epoll_pwait);
        filter.allow(libc::SYS_eventfd2);
        filter.allow(libc::SYS_timerfd_create);
        filter.allow(libc::SYS_timerfd_settime);

        // Signals
        filter.allow(libc::SYS_rt_sigaction);
        filter.allow(libc::SYS_rt_sigprocmask);
        filter.allow(libc::SYS_rt_sigreturn);
        filter.allow(libc::SYS_sigaltstack);

        // Threads and exit
        filter.allow(libc::SYS_clone3);
        filter.allow(libc::SYS_futex);
        filter.allow(libc::SYS_sched_yield);
        filter.allow(libc::SYS_exit);
        filter.allow(libc::SYS_exit_group);

        // Misc
        filter.allow(libc::SYS_clock_gettime);
        filter.allow(libc::SYS_nanosleep);
        filter.allow(libc::SYS_getrandom);

        filter
    }

    pub fn allow(&mut self, syscall: i64) -> &mut Self {
        self.allowed_syscalls.push(syscall);
        self
    }

    /// Compile the allowlist to BPF bytecode for the current architecture.
    pub fn build(&self) -> Result<BpfProgram, io::Error> {
        let rules: BTreeMap<i64, Vec<SeccompRule>> = self
            .allowed_syscalls
            .iter()
            .map(|&syscall| (syscall, vec![]))
            .collect();

        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(|e: seccompiler::BackendError| io::Error::other(e.to_string()))?;

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::KillProcess,
            SeccompAction::Allow,
            arch,
        )
        .map_err(|e| io::Error::other(e.to_string()))?;

        let program: BpfProgram = filter
            .try_into()
            .map_err(|e: seccompiler::BackendError| io::Error::other(e.to_string()))?;
        Ok(program)
    }

    /// Install the filter on the current process. Irreversible and inherited
    /// across exec, which is exactly what the pre_exec hook wants.
    pub fn apply(&self) -> Result<(), io::Error> {
        let program = self.build()?;
        seccompiler::apply_filter(&program).map_err(|e| io::Error::other(e.to_string()))
    }

    pub fn allowed_count(&self) -> usize {
        self.allowed_syscalls.len()
    }
}

impl Default for HypervisorSeccomp {
    fn default() -> Self {
        Self::with_hypervisor_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_compiles() {
        let filter = HypervisorSeccomp::with_hypervisor_defaults();
        assert!(filter.allowed_count() > 20);
        assert!(filter.build().is_ok());
    }

    #[test]
    fn empty_filter_compiles() {
        assert!(HypervisorSeccomp::new().build().is_ok());
    }

    #[test]
    fn custom_allowlist() {
        let mut filter = HypervisorSeccomp::new();
        filter
            .allow(libc::SYS_read)
            .allow(libc::SYS_write)
            .allow(libc::SYS_exit_group);
        assert_eq!(filter.allowed_count(), 3);
        assert!(filter.build().is_ok());
    }
}
