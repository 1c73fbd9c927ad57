//! Privilege reduction for the agent child process
//!
//! The agent is an untrusted program that reads host metadata and talks to a
//! model API. It needs no root powers at all, so when the host itself runs
//! with capabilities we strip them from the child before `exec`:
//!
//! ```text
//! host (maybe root)
//!   │ fork
//!   ▼
//! child ── PR_SET_NO_NEW_PRIVS ──► setuid binaries cannot raise privileges
//!       ── PR_SET_PDEATHSIG    ──► child is killed if the host dies
//!       ── PR_CAPBSET_DROP × N ──► caps can never come back after exec
//!   │ exec(agent)
//!   ▼
//! agent (bounded)
//! ```
//!
//! Everything that runs between fork and exec must be async-signal-safe, so
//! the capability list is turned into plain integers up front and the child
//! side only issues `prctl` calls.

use std::io;

// ═══════════════════════════════════════════════════════════════════════════
// CapabilityDropper
// ═══════════════════════════════════════════════════════════════════════════
// Holds the capabilities to remove from the agent's bounding set.
//
// USAGE:
//   let hardening = CapabilityDropper::with_agent_drops().prepare();
//   unsafe { command.pre_exec(move || hardening.apply()) };
// ═══════════════════════════════════════════════════════════════════════════

pub struct CapabilityDropper {
    caps_to_drop: Vec<caps::Capability>,
}

impl CapabilityDropper {
    pub fn new() -> Self {
        Self {
            caps_to_drop: Vec::new(),
        }
    }

    /// Every capability an agent could abuse
    ///
    /// ```text
    /// ┌────────────────────┬──────────────────────────────────────────────┐
    /// │ CAP_SYS_ADMIN      │ mount, namespaces, most of "root"            │
    /// │ CAP_SYS_PTRACE     │ attach to the host process and read memory   │
    /// │ CAP_SYS_MODULE     │ load kernel modules                          │
    /// │ CAP_NET_ADMIN/RAW  │ reconfigure or sniff the network             │
    /// │ CAP_SETUID/SETGID  │ become another user                          │
    /// │ CAP_DAC_*          │ read or write files regardless of mode       │
    /// │ CAP_KILL           │ signal processes it does not own             │
    /// └────────────────────┴──────────────────────────────────────────────┘
    /// ```
    pub fn with_agent_drops() -> Self {
        let mut dropper = Self::new();

        // System administration
        dropper
            .drop_cap(caps::Capability::CAP_SYS_ADMIN)
            .drop_cap(caps::Capability::CAP_SYS_PTRACE)
            .drop_cap(caps::Capability::CAP_SYS_MODULE)
            .drop_cap(caps::Capability::CAP_SYS_BOOT)
            .drop_cap(caps::Capability::CAP_SYS_RAWIO)
            .drop_cap(caps::Capability::CAP_SYS_CHROOT)
            .drop_cap(caps::Capability::CAP_SYS_TIME);

        // Network
        dropper
            .drop_cap(caps::Capability::CAP_NET_ADMIN)
            .drop_cap(caps::Capability::CAP_NET_RAW)
            .drop_cap(caps::Capability::CAP_NET_BIND_SERVICE);

        // Identity and file permissions
        dropper
            .drop_cap(caps::Capability::CAP_SETUID)
            .drop_cap(caps::Capability::CAP_SETGID)
            .drop_cap(caps::Capability::CAP_SETPCAP)
            .drop_cap(caps::Capability::CAP_CHOWN)
            .drop_cap(caps::Capability::CAP_DAC_OVERRIDE)
            .drop_cap(caps::Capability::CAP_DAC_READ_SEARCH)
            .drop_cap(caps::Capability::CAP_FOWNER)
            .drop_cap(caps::Capability::CAP_FSETID)
            .drop_cap(caps::Capability::CAP_MKNOD)
            .drop_cap(caps::Capability::CAP_KILL);

        // Audit, MAC and the rest
        dropper
            .drop_cap(caps::Capability::CAP_AUDIT_WRITE)
            .drop_cap(caps::Capability::CAP_AUDIT_CONTROL)
            .drop_cap(caps::Capability::CAP_MAC_ADMIN)
            .drop_cap(caps::Capability::CAP_MAC_OVERRIDE)
            .drop_cap(caps::Capability::CAP_SYSLOG)
            .drop_cap(caps::Capability::CAP_LINUX_IMMUTABLE);

        dropper
    }

    pub fn drop_cap(&mut self, cap: caps::Capability) -> &mut Self {
        if !self.caps_to_drop.contains(&cap) {
            self.caps_to_drop.push(cap);
        }
        self
    }

    pub fn drop_count(&self) -> usize {
        self.caps_to_drop.len()
    }

    /// Names of the capabilities being dropped (for logging)
    pub fn caps_being_dropped(&self) -> Vec<String> {
        self.caps_to_drop.iter().map(|cap| cap.to_string()).collect()
    }

    /// Precompute the child-side work so `pre_exec` does not allocate
    pub fn prepare(&self) -> ChildHardening {
        ChildHardening {
            bounding_indices: self
                .caps_to_drop
                .iter()
                .map(|cap| libc::c_ulong::from(cap.index()))
                .collect(),
        }
    }
}

impl Default for CapabilityDropper {
    fn default() -> Self {
        Self::with_agent_drops()
    }
}

/// Child-side hardening, safe to run between fork and exec
#[derive(Debug, Clone)]
pub struct ChildHardening {
    bounding_indices: Vec<libc::c_ulong>,
}

impl ChildHardening {
    /// Only the parent-death signal and no-new-privs, no capability drops
    pub fn minimal() -> Self {
        Self {
            bounding_indices: Vec::new(),
        }
    }

    pub fn dropped_count(&self) -> usize {
        self.bounding_indices.len()
    }

    /// Apply to the calling process. Call only from `pre_exec`.
    ///
    /// Dropping from the bounding set needs CAP_SETPCAP; an unprivileged host
    /// has nothing to drop, so EPERM is ignored.
    pub fn apply(&self) -> io::Result<()> {
        // SAFETY: prctl with integer arguments touches no memory we own
        unsafe {
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            for &index in &self.bounding_indices {
                if libc::prctl(libc::PR_CAPBSET_DROP, index, 0, 0, 0) != 0 {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EPERM) | Some(libc::EINVAL) => {}
                        _ => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropper_creation() {
        assert_eq!(CapabilityDropper::new().drop_count(), 0);
        assert!(CapabilityDropper::with_agent_drops().drop_count() > 20);
    }

    #[test]
    fn test_duplicate_drops_are_ignored() {
        let mut dropper = CapabilityDropper::new();
        dropper
            .drop_cap(caps::Capability::CAP_NET_RAW)
            .drop_cap(caps::Capability::CAP_NET_RAW)
            .drop_cap(caps::Capability::CAP_SYS_ADMIN);
        assert_eq!(dropper.drop_count(), 2);
    }

    #[test]
    fn test_cap_names() {
        let names = CapabilityDropper::with_agent_drops().caps_being_dropped();
        assert!(names.iter().any(|n| n == "CAP_SYS_PTRACE"));
        assert!(names.iter().any(|n| n == "CAP_DAC_OVERRIDE"));
    }

    #[test]
    fn test_prepare_keeps_every_index() {
        let dropper = CapabilityDropper::with_agent_drops();
        assert_eq!(dropper.prepare().dropped_count(), dropper.drop_count());
        assert_eq!(ChildHardening::minimal().dropped_count(), 0);
    }
}
