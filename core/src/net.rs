//! Host-side netlink operations for the per-job veth pair
//!
//! All commands here shell out to `ip(8)`, mirroring the rest of this crate's
//! preference for direct, well-validated `Command` invocations over pulling
//! in a netlink client library.
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::bail;
use nix::unistd::Pid;

/// Prevents command injection through interface names: only plain
/// alphanumerics, `-` and `_` are accepted.
fn valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() < 16 // IFNAMSIZ
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn run_ip(args: &[&str]) -> anyhow::Result<()> {
    let out = Command::new("ip").args(args).output()?;
    if !out.status.success() {
        bail!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(())
}

/// A veth pair with one end destined for a target namespace
pub struct VethPair {
    pub host_if: String,
    pub guest_if: String,
}

impl VethPair {
    /// Creates `host_if` in the caller's current namespace with its peer
    /// `guest_if` moved directly into the namespace of thread/process
    /// `target`
    ///
    /// Must be run from a thread that has *not* been moved into the job's
    /// namespace: `ip link add ... netns <target>` requires the target
    /// namespace to be reachable from the caller's, which is only the case
    /// from the parent (background) namespace.
    pub fn create(host_if: &str, guest_if: &str, target: Pid) -> anyhow::Result<Self> {
        if !valid_ifname(host_if) || !valid_ifname(guest_if) {
            bail!("interface name is not well-formed");
        }

        run_ip(&[
            "link", "add", host_if, "type", "veth", "peer", "name", guest_if, "netns",
            &target.to_string(),
        ])?;

        Ok(Self {
            host_if: host_if.to_string(),
            guest_if: guest_if.to_string(),
        })
    }

    // No Drop impl: the veth pair is torn down automatically once the job's
    // network namespace is destroyed, and the host-side end is additionally
    // removed explicitly by the supervisor during teardown (see
    // `delete_link`).
}

/// Renames a link, used to turn the freshly-arrived guest end (created as
/// `eth1` in the parent namespace's view) into `eth0` inside the job's
/// namespace
pub fn rename_link(old: &str, new: &str) -> anyhow::Result<()> {
    if !valid_ifname(old) || !valid_ifname(new) {
        bail!("interface name is not well-formed");
    }
    run_ip(&["link", "set", "dev", old, "name", new])
}

/// Brings a link up
pub fn link_up(ifname: &str) -> anyhow::Result<()> {
    if !valid_ifname(ifname) {
        bail!("interface name is not well-formed");
    }
    run_ip(&["link", "set", "dev", ifname, "up"])
}

/// Assigns a `/31` address to a link
pub fn addr_add(ifname: &str, addr: Ipv4Addr) -> anyhow::Result<()> {
    if !valid_ifname(ifname) {
        bail!("interface name is not well-formed");
    }
    run_ip(&["addr", "add", &format!("{addr}/31"), "dev", ifname])
}

/// Adds a host-scoped route to `dest` through `ifname`
pub fn route_add_dev(dest: Ipv4Addr, ifname: &str) -> anyhow::Result<()> {
    if !valid_ifname(ifname) {
        bail!("interface name is not well-formed");
    }
    run_ip(&["route", "add", &dest.to_string(), "dev", ifname])
}

/// Adds a default route via `via`
pub fn route_add_default(via: Ipv4Addr) -> anyhow::Result<()> {
    run_ip(&["route", "add", "default", "via", &via.to_string()])
}

/// Best-effort deletion of a link by name; used during job teardown to
/// reclaim the host-side veth end if the namespace is still around
pub fn delete_link(ifname: &str) {
    if !valid_ifname(ifname) {
        return;
    }
    let _ = run_ip(&["link", "delete", ifname]);
}

/// Monotonically-increasing, process-wide counter used to derive host
/// interface names and `/31` address pairs
///
/// Starts at 0 on every process start; restarting the server can collide
/// with stale `ve-envdeploy*` interfaces left behind by a previous run (see
/// DESIGN.md, "startup veth leak").
static IF_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Allocates the next host-side interface name and its `/31` address pair
///
/// Returns `(host_if, host_addr, guest_addr)`. The prefix is taken from the
/// counter's value: `a = (n / 127) % 256`, `b = (n % 127) * 2`, producing
/// `10.0.a.b` (host) and `10.0.a.(b+1)` (guest). This wraps after roughly
/// 32k allocations and addresses are never reused, even after the owning
/// job is removed (see DESIGN.md, "address-space wrap").
pub fn alloc_host_endpoint() -> (String, Ipv4Addr, Ipv4Addr) {
    let n = IF_COUNTER.fetch_add(1, Ordering::SeqCst);
    let host_if = format!("ve-envdeploy{n}");
    let a = ((n / 127) % 256) as u8;
    let b = ((n % 127) * 2) as u8;
    let host_addr = Ipv4Addr::new(10, 0, a, b);
    let guest_addr = Ipv4Addr::new(10, 0, a, b + 1);
    (host_if, host_addr, guest_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_allocation_matches_formula() {
        // n = 130 -> a = 1, b = 6
        let a = ((130u32 / 127) % 256) as u8;
        let b = ((130u32 % 127) * 2) as u8;
        assert_eq!(a, 1);
        assert_eq!(b, 6);
        assert_eq!(Ipv4Addr::new(10, 0, a, b + 1), Ipv4Addr::new(10, 0, 1, 7));
    }

    #[test]
    fn ifname_validation_rejects_shell_metacharacters() {
        assert!(valid_ifname("ve-envdeploy12"));
        assert!(!valid_ifname("ve;rm -rf /"));
        assert!(!valid_ifname(""));
    }
}
