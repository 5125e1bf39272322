//! CLI command implementations.

pub mod controller;
pub mod daemon;
pub mod policy;
pub mod teardown;

use anyhow::Result;

/// Fail unless running as root. The daemon, policy agent and teardown all
/// program the kernel.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() is a simple syscall that reads the effective user ID.
    // It has no preconditions, never fails, and doesn't modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has CAP_NET_ADMIN."
        )
    }
    Ok(())
}
