// Stable process handles (Linux 5.3+)
//
// A pidfd keeps referring to the same process even if its pid gets recycled,
// so signalling and process_mrelease() through it cannot hit a stranger.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug)]
pub struct PidFd(OwnedFd);

impl PidFd {
    /// pidfd_open(2). ENOSYS on kernels that predate it.
    #[allow(unsafe_code)]
    pub fn open(pid: i32) -> nix::Result<Self> {
        // SAFETY: plain syscall, no pointers involved
        let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        let fd = Errno::result(ret)?;
        // SAFETY: the kernel just handed us this descriptor and nobody else owns it
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd as RawFd) }))
    }

    /// pidfd_send_signal(2). `None` only checks that the process exists.
    #[allow(unsafe_code)]
    pub fn send_signal(&self, signal: Option<Signal>) -> nix::Result<()> {
        let sig = signal.map_or(0, |s| s as libc::c_int);
        // SAFETY: a null siginfo pointer is explicitly allowed
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.0.as_raw_fd(),
                sig,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            )
        };
        Errno::result(ret).map(drop)
    }

    /// process_mrelease(2) (Linux 5.15+): reap the memory of a process that
    /// got SIGKILL without waiting for it to finish exiting.
    #[allow(unsafe_code)]
    pub fn release_memory(&self) -> nix::Result<()> {
        // SAFETY: plain syscall, no pointers involved
        let ret = unsafe { libc::syscall(libc::SYS_process_mrelease, self.0.as_raw_fd(), 0) };
        Errno::result(ret).map(drop)
    }
}
