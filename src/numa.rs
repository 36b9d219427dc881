// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! NUMA placement for pinned buffers and worker threads.
//!
//! # Linux
//! A PCI device reports its node and local CPUs under
//! `/sys/bus/pci/devices/<dddd:bb:dd.f>/`:
//! - `numa_node` - node id, `-1` when the platform does not say
//! - `local_cpulist` - CPUs on the device's root complex, e.g. `0-15,32-47`
//!
//! Binding uses `sched_setaffinity` for CPUs and `set_mempolicy(MPOL_BIND)`
//! for memory, both scoped to the calling thread.

use crate::error::{DmaError, DmaResult};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Sysfs root for PCI devices.
const SYSFS_PCI_PATH: &str = "bus/pci/devices";

const MPOL_BIND: libc::c_int = 2;

/// Node mask width passed to `get_mempolicy`; the kernel's `MAX_NUMNODES` ceiling.
const MAX_NODES: usize = 1024;

/// PCI address of a device (`dddd:bb:dd.f`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceLocality {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl DeviceLocality {
    pub const fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            segment,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for DeviceLocality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

impl FromStr for DeviceLocality {
    type Err = DmaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DmaError::InvalidArgument(format!("malformed PCI address '{s}'"));
        let (segment, rest) = s.split_once(':').ok_or_else(bad)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(bad)?;
        let (device, function) = rest.split_once('.').ok_or_else(bad)?;
        Ok(Self {
            segment: u16::from_str_radix(segment, 16).map_err(|_| bad())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| bad())?,
            device: u8::from_str_radix(device, 16).map_err(|_| bad())?,
            function: u8::from_str_radix(function, 16).map_err(|_| bad())?,
        })
    }
}

/// CPU and memory-node sets a thread should be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NumaBinding {
    /// Node the device sits on, if known.
    pub node: Option<u32>,
    /// CPUs local to the device. Empty means leave CPU affinity alone.
    pub cpus: Vec<usize>,
    /// Memory nodes to allocate from. Empty means leave memory policy alone.
    pub mem_nodes: Vec<u32>,
}

impl NumaBinding {
    /// Binding for one node and its CPUs.
    pub fn node(node: u32, cpus: Vec<usize>) -> Self {
        Self {
            node: Some(node),
            cpus,
            mem_nodes: vec![node],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty() && self.mem_nodes.is_empty()
    }

    /// Bind the calling thread's CPU affinity and memory policy.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::AffinityBinding`] if either system call fails.
    pub fn apply_to_current_thread(&self) -> DmaResult<()> {
        if !self.cpus.is_empty() {
            set_affinity(&self.cpus)?;
        }
        if !self.mem_nodes.is_empty() {
            set_mempolicy(MPOL_BIND, &self.mem_nodes)?;
        }
        log::debug!(
            "bound thread to node {:?} ({} cpus)",
            self.node,
            self.cpus.len()
        );
        Ok(())
    }
}

/// Saved thread placement, restored by [`ThreadPlacement::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPlacement {
    cpus: Vec<usize>,
    /// `None` when the kernel will not report the policy.
    mem_policy: Option<MemPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemPolicy {
    mode: libc::c_int,
    nodes: Vec<u32>,
}

impl ThreadPlacement {
    /// Capture the calling thread's CPU affinity and memory policy.
    pub fn current() -> DmaResult<Self> {
        // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        // SAFETY: set is a valid out-parameter of the size passed.
        let rc = unsafe {
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set)
        };
        if rc != 0 {
            return Err(DmaError::AffinityBinding(format!(
                "sched_getaffinity: {}",
                std::io::Error::last_os_error()
            )));
        }
        let cpus = (0..libc::CPU_SETSIZE as usize)
            // SAFETY: cpu is below CPU_SETSIZE.
            .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
            .collect();
        Ok(Self {
            cpus,
            mem_policy: get_mempolicy()?,
        })
    }

    /// Reapply the saved CPU affinity and memory policy.
    pub fn restore(&self) -> DmaResult<()> {
        if !self.cpus.is_empty() {
            set_affinity(&self.cpus)?;
        }
        match &self.mem_policy {
            Some(policy) => set_mempolicy(policy.mode, &policy.nodes),
            None => Ok(()),
        }
    }
}

/// Mode (with any mode flags) and nodes of the calling thread's policy.
fn get_mempolicy() -> DmaResult<Option<MemPolicy>> {
    const BITS: usize = libc::c_ulong::BITS as usize;
    let mut mode: libc::c_int = 0;
    let mut mask = [0 as libc::c_ulong; MAX_NODES / BITS];
    // SAFETY: mode and mask are valid out-parameters; mask holds MAX_NODES
    // bits. A null address with zero flags queries the thread policy.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut mode as *mut libc::c_int,
            mask.as_mut_ptr(),
            MAX_NODES as libc::c_ulong,
            std::ptr::null::<libc::c_void>(),
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // No NUMA support, or the syscall is filtered: leave policy alone.
        if matches!(err.raw_os_error(), Some(libc::ENOSYS | libc::EPERM)) {
            return Ok(None);
        }
        return Err(DmaError::AffinityBinding(format!("get_mempolicy: {err}")));
    }
    let nodes = (0..MAX_NODES)
        .filter(|&n| mask[n / BITS] & (1 << (n % BITS)) != 0)
        .map(|n| n as u32)
        .collect();
    Ok(Some(MemPolicy { mode, nodes }))
}

fn set_affinity(cpus: &[usize]) -> DmaResult<()> {
    // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in cpus.iter().filter(|&&c| c < libc::CPU_SETSIZE as usize) {
        // SAFETY: cpu is below CPU_SETSIZE.
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    // SAFETY: set is fully initialized and sized correctly.
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(DmaError::AffinityBinding(format!(
            "sched_setaffinity({cpus:?}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn set_mempolicy(mode: libc::c_int, nodes: &[u32]) -> DmaResult<()> {
    const BITS: usize = libc::c_ulong::BITS as usize;
    let max_node = nodes.iter().copied().max().map_or(0, |n| n as usize + 1);
    let mut mask = vec![0 as libc::c_ulong; max_node.div_ceil(BITS).max(1)];
    for &node in nodes {
        let node = node as usize;
        mask[node / BITS] |= 1 << (node % BITS);
    }
    let (mask_ptr, max_bits) = if nodes.is_empty() {
        (std::ptr::null(), 0)
    } else {
        (mask.as_ptr(), (mask.len() * BITS + 1) as libc::c_ulong)
    };
    // SAFETY: mask outlives the call and holds max_bits - 1 bits.
    let rc = unsafe { libc::syscall(libc::SYS_set_mempolicy, mode, mask_ptr, max_bits) };
    if rc != 0 {
        return Err(DmaError::AffinityBinding(format!(
            "set_mempolicy({nodes:?}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Resolves a device locality to the CPU and memory sets to bind to.
pub trait Topology: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DmaError::TopologyLookup`] when the device's placement
    /// cannot be read.
    fn binding_for(&self, locality: &DeviceLocality) -> DmaResult<NumaBinding>;
}

/// Topology read from sysfs.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsTopology {
    /// Read topology below `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn device_dir(&self, locality: &DeviceLocality) -> PathBuf {
        self.root.join(SYSFS_PCI_PATH).join(locality.to_string())
    }
}

impl Topology for SysfsTopology {
    fn binding_for(&self, locality: &DeviceLocality) -> DmaResult<NumaBinding> {
        let dir = self.device_dir(locality);
        if !dir.exists() {
            return Err(DmaError::TopologyLookup(format!(
                "no sysfs entry for {locality}"
            )));
        }

        let node = read_sysfs_i32(&dir.join("numa_node"))?;
        let cpus = match read_sysfs_string(&dir.join("local_cpulist")) {
            Ok(list) => parse_cpu_list(&list)?,
            Err(_) => Vec::new(),
        };

        let binding = match u32::try_from(node) {
            Ok(node) => NumaBinding::node(node, cpus),
            // Platform without NUMA information: CPUs only.
            Err(_) => NumaBinding {
                node: None,
                cpus,
                mem_nodes: Vec::new(),
            },
        };
        log::debug!("{} is local to {:?}", locality, binding);
        Ok(binding)
    }
}

fn read_sysfs_string(path: &Path) -> DmaResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| DmaError::TopologyLookup(format!("{}: {e}", path.display())))
}

fn read_sysfs_i32(path: &Path) -> DmaResult<i32> {
    let s = read_sysfs_string(path)?;
    s.parse()
        .map_err(|_| DmaError::TopologyLookup(format!("{}: bad value '{s}'", path.display())))
}

/// Parse a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> DmaResult<Vec<usize>> {
    let bad = || DmaError::TopologyLookup(format!("malformed cpu list '{list}'"));
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| bad())?;
                let hi: usize = hi.trim().parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().map_err(|_| bad())?),
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(name: &str, node: &str, cpulist: Option<&str>) -> (PathBuf, DeviceLocality) {
        let root = std::env::temp_dir().join(format!("fpga-dma-{name}-{}", std::process::id()));
        let loc = DeviceLocality::new(0, 0x3b, 0, 0);
        let dir = root.join(SYSFS_PCI_PATH).join(loc.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("numa_node"), format!("{node}\n")).unwrap();
        if let Some(list) = cpulist {
            fs::write(dir.join("local_cpulist"), format!("{list}\n")).unwrap();
        }
        (root, loc)
    }

    #[test]
    fn test_placement_restores_memory_policy() {
        std::thread::spawn(|| {
            let saved = ThreadPlacement::current().unwrap();
            // Kernels without NUMA support reject the bind.
            if saved.mem_policy.is_some() && set_mempolicy(MPOL_BIND, &[0]).is_ok() {
                let bound = ThreadPlacement::current().unwrap().mem_policy.unwrap();
                assert_eq!(bound.mode, MPOL_BIND);
                assert_eq!(bound.nodes, vec![0]);
            }
            saved.restore().unwrap();
            assert_eq!(ThreadPlacement::current().unwrap(), saved);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_locality_round_trip() {
        let loc: DeviceLocality = "0000:3b:00.1".parse().unwrap();
        assert_eq!(loc, DeviceLocality::new(0, 0x3b, 0, 1));
        assert_eq!(loc.to_string(), "0000:3b:00.1");
        assert!("3b:00.1".parse::<DeviceLocality>().is_err());
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,8,10-11\n").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<usize>::new());
        assert!(parse_cpu_list("4-2").is_err());
        assert!(parse_cpu_list("x").is_err());
    }

    #[test]
    fn test_sysfs_binding() {
        let (root, loc) = fake_sysfs("node1", "1", Some("16-17"));
        let binding = SysfsTopology::new(&root).binding_for(&loc).unwrap();
        assert_eq!(binding, NumaBinding::node(1, vec![16, 17]));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_sysfs_without_numa_node() {
        let (root, loc) = fake_sysfs("nonuma", "-1", None);
        let binding = SysfsTopology::new(&root).binding_for(&loc).unwrap();
        assert_eq!(binding.node, None);
        assert!(binding.is_empty());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_missing_device_is_topology_error() {
        let topo = SysfsTopology::new("/nonexistent-sysfs");
        let err = topo
            .binding_for(&DeviceLocality::new(0, 1, 2, 3))
            .unwrap_err();
        assert!(matches!(err, DmaError::TopologyLookup(_)));
    }
}
