//! In-process hypervisor simulation.
//!
//! Keeps a domain table in memory and applies the same state transitions a
//! libvirt host would. Used for local development (`HEARTH_BACKEND=simulated`)
//! and as the hypervisor fake in tests, with fault injection, artificial
//! latency and helpers that simulate drift made outside the control plane.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::{
    Domain, DomainInfo, DomainSnapshot, DomainState, Hypervisor, ResizeScope, RevertFlags,
    SnapshotCreateFlags, SnapshotDeleteFlags,
};
use crate::descriptor;
use crate::HypervisorError;

#[derive(Debug, Clone)]
struct SimDomain {
    descriptor: String,
    state: DomainState,
    reason: String,
    vcpus: u32,
    max_vcpus: u32,
    memory_kib: u64,
    max_memory_kib: u64,
    cpu_time_ns: u64,
    snapshots: BTreeMap<String, String>,
}

/// CPU time a running simulated guest accrues per [`Domain::info`] call.
const SIM_CPU_TICK_NS: u64 = 10_000_000;

#[derive(Debug, Default)]
struct SimState {
    domains: BTreeMap<String, SimDomain>,
    faults: HashMap<&'static str, String>,
    crash_on_start: HashSet<String>,
    latency: Duration,
    offline: bool,
}

/// In-memory [`Hypervisor`]. Cloning shares the domain table.
#[derive(Debug, Clone, Default)]
pub struct SimulatedHypervisor {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHypervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future call of `operation` fail with `message` until
    /// [`clear_faults`](Self::clear_faults) is called.
    ///
    /// Operation names match the trait method names, e.g. `start`,
    /// `undefine`, `create_snapshot`, `delete_snapshot`.
    pub async fn fail_operation(&self, operation: &'static str, message: impl Into<String>) {
        self.state.lock().await.faults.insert(operation, message.into());
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Delays every call by `latency` before it takes effect.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// Makes [`Hypervisor::is_alive`] report `false`.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// The next start of `name` leaves the domain shut off with reason `crashed`.
    pub async fn crash_on_start(&self, name: &str) {
        self.state.lock().await.crash_on_start.insert(name.to_owned());
    }

    /// Flips a domain's run state as if changed outside the control plane.
    /// Returns `false` if the domain does not exist.
    pub async fn set_active(&self, name: &str, active: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(domain) = state.domains.get_mut(name) else {
            return false;
        };
        if active {
            domain.state = DomainState::Running;
            domain.reason = "booted".to_owned();
        } else {
            domain.state = DomainState::Shutoff;
            domain.reason = "destroyed".to_owned();
        }
        true
    }

    /// Removes a domain as if undefined outside the control plane.
    pub async fn remove_domain(&self, name: &str) -> bool {
        self.state.lock().await.domains.remove(name).is_some()
    }

    pub async fn domain_names(&self) -> Vec<String> {
        self.state.lock().await.domains.keys().cloned().collect()
    }

    /// `None` if the domain does not exist.
    pub async fn is_domain_active(&self, name: &str) -> Option<bool> {
        self.state.lock().await.domains.get(name).map(|d| d.state.is_active())
    }

    /// Config-scope `(vcpus, max_vcpus, memory_kib)` of a domain.
    pub async fn domain_sizes(&self, name: &str) -> Option<(u32, u32, u64)> {
        self.state
            .lock()
            .await
            .domains
            .get(name)
            .map(|d| (d.vcpus, d.max_vcpus, d.memory_kib))
    }

    pub async fn snapshot_names(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .domains
            .get(name)
            .map(|d| d.snapshots.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sleeps for the configured latency, then checks for an injected fault.
    async fn enter(&self, operation: &'static str) -> Result<(), HypervisorError> {
        let latency = self.state.lock().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(message) = self.state.lock().await.faults.get(operation) {
            return Err(HypervisorError::Command {
                operation: operation.to_owned(),
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn handle(&self, name: &str) -> Box<dyn Domain> {
        Box::new(SimDomainHandle { name: name.to_owned(), hv: self.clone() })
    }

    /// Runs `f` on the named domain while holding the table lock.
    async fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut SimDomain) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let mut state = self.state.lock().await;
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::domain_not_found(name))?;
        f(domain)
    }
}

/// Replaces the first `<tag ...>...</tag>` element with `replacement`.
fn replace_element(xml: &str, tag: &str, replacement: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = xml
        .match_indices(&open)
        .map(|(i, _)| i)
        .find(|&i| matches!(xml.as_bytes().get(i + open.len()), Some(b' ' | b'>')));
    let Some(start) = start else {
        return xml.to_owned();
    };
    let Some(end) = xml[start..].find(&close) else {
        return xml.to_owned();
    };
    let end = start + end + close.len();
    format!("{}{replacement}{}", &xml[..start], &xml[end..])
}

fn command_error(operation: &str, message: impl Into<String>) -> HypervisorError {
    HypervisorError::Command { operation: operation.to_owned(), message: message.into() }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    async fn lookup_domain(&self, name: &str) -> Result<Box<dyn Domain>, HypervisorError> {
        self.enter("lookup_domain").await?;
        if self.state.lock().await.domains.contains_key(name) {
            Ok(self.handle(name))
        } else {
            Err(HypervisorError::domain_not_found(name))
        }
    }

    async fn define_domain(&self, descriptor: &str) -> Result<Box<dyn Domain>, HypervisorError> {
        self.enter("define_domain").await?;
        let name = descriptor::descriptor_name(descriptor)
            .ok_or_else(|| command_error("define_domain", "descriptor has no <name>"))?;
        let max_vcpus = descriptor::max_vcpus(descriptor)
            .ok_or_else(|| command_error("define_domain", "descriptor has no <vcpu>"))?;
        let max_memory = descriptor::max_memory_kib(descriptor)
            .ok_or_else(|| command_error("define_domain", "descriptor has no <memory>"))?;
        let vcpus = descriptor::current_vcpus(descriptor).unwrap_or(max_vcpus).min(max_vcpus);
        let memory = descriptor::current_memory_kib(descriptor).unwrap_or(max_memory);

        let mut state = self.state.lock().await;
        let entry = state.domains.entry(name.clone()).or_insert_with(|| SimDomain {
            descriptor: String::new(),
            state: DomainState::Shutoff,
            reason: "unknown".to_owned(),
            vcpus,
            max_vcpus,
            memory_kib: memory,
            max_memory_kib: max_memory,
            cpu_time_ns: 0,
            snapshots: BTreeMap::new(),
        });
        entry.descriptor = descriptor.to_owned();
        entry.vcpus = vcpus;
        entry.max_vcpus = max_vcpus;
        entry.memory_kib = memory;
        entry.max_memory_kib = max_memory;
        drop(state);

        tracing::debug!(domain = %name, "simulated domain defined");
        Ok(self.handle(&name))
    }

    async fn is_alive(&self) -> bool {
        !self.state.lock().await.offline
    }
}

struct SimDomainHandle {
    name: String,
    hv: SimulatedHypervisor,
}

#[async_trait]
impl Domain for SimDomainHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_active(&self) -> Result<bool, HypervisorError> {
        self.hv.enter("is_active").await?;
        self.hv.with_domain(&self.name, |d| Ok(d.state.is_active())).await
    }

    async fn state(&self) -> Result<(DomainState, String), HypervisorError> {
        self.hv.enter("state").await?;
        self.hv.with_domain(&self.name, |d| Ok((d.state, d.reason.clone()))).await
    }

    async fn info(&self) -> Result<DomainInfo, HypervisorError> {
        self.hv.enter("info").await?;
        self.hv
            .with_domain(&self.name, |d| {
                if d.state.is_active() {
                    d.cpu_time_ns += SIM_CPU_TICK_NS;
                }
                Ok(DomainInfo {
                    state: d.state,
                    max_memory_kib: d.max_memory_kib,
                    memory_kib: d.memory_kib,
                    vcpus: d.vcpus,
                    cpu_time_ns: d.cpu_time_ns,
                })
            })
            .await
    }

    async fn descriptor(&self, _secure: bool) -> Result<String, HypervisorError> {
        self.hv.enter("descriptor").await?;
        self.hv
            .with_domain(&self.name, |d| {
                let vcpu = format!(
                    "<vcpu placement='static' current='{}'>{}</vcpu>",
                    d.vcpus, d.max_vcpus
                );
                let memory = format!("<memory unit='KiB'>{}</memory>", d.max_memory_kib);
                let current =
                    format!("<currentMemory unit='KiB'>{}</currentMemory>", d.memory_kib);
                let rendered = replace_element(&d.descriptor, "vcpu", &vcpu);
                let rendered = replace_element(&rendered, "memory", &memory);
                Ok(replace_element(&rendered, "currentMemory", &current))
            })
            .await
    }

    async fn start(&self) -> Result<(), HypervisorError> {
        self.hv.enter("start").await?;
        let crash = self.hv.state.lock().await.crash_on_start.remove(&self.name);
        self.hv
            .with_domain(&self.name, |d| {
                if d.state.is_active() {
                    return Err(command_error("start", "domain is already active"));
                }
                if crash {
                    d.state = DomainState::Shutoff;
                    d.reason = "crashed".to_owned();
                } else {
                    d.state = DomainState::Running;
                    d.reason = "booted".to_owned();
                }
                Ok(())
            })
            .await
    }

    async fn force_stop(&self) -> Result<(), HypervisorError> {
        self.hv.enter("force_stop").await?;
        self.hv
            .with_domain(&self.name, |d| {
                if !d.state.is_active() {
                    return Err(command_error("force_stop", "domain is not running"));
                }
                d.state = DomainState::Shutoff;
                d.reason = "destroyed".to_owned();
                Ok(())
            })
            .await
    }

    async fn graceful_stop(&self) -> Result<(), HypervisorError> {
        self.hv.enter("graceful_stop").await?;
        self.hv
            .with_domain(&self.name, |d| {
                if !d.state.is_active() {
                    return Err(command_error("graceful_stop", "domain is not running"));
                }
                d.state = DomainState::Shutoff;
                d.reason = "shutdown".to_owned();
                Ok(())
            })
            .await
    }

    async fn undefine(&self) -> Result<(), HypervisorError> {
        self.hv.enter("undefine").await?;
        let mut state = self.hv.state.lock().await;
        if state.domains.remove(&self.name).is_none() {
            return Err(HypervisorError::domain_not_found(&self.name));
        }
        Ok(())
    }

    async fn set_vcpus(&self, count: u32, scope: ResizeScope) -> Result<(), HypervisorError> {
        self.hv.enter("set_vcpus").await?;
        self.hv
            .with_domain(&self.name, |d| {
                match scope {
                    ResizeScope::ConfigMaximum => d.max_vcpus = count,
                    ResizeScope::Config | ResizeScope::Live => {
                        if count > d.max_vcpus {
                            return Err(command_error(
                                "set_vcpus",
                                format!("requested {count} vcpus exceeds maximum {}", d.max_vcpus),
                            ));
                        }
                        if scope == ResizeScope::Live && !d.state.is_active() {
                            return Err(command_error("set_vcpus", "domain is not running"));
                        }
                        d.vcpus = count;
                    }
                }
                Ok(())
            })
            .await
    }

    async fn set_memory_kib(&self, kib: u64, scope: ResizeScope) -> Result<(), HypervisorError> {
        self.hv.enter("set_memory").await?;
        self.hv
            .with_domain(&self.name, |d| {
                match scope {
                    ResizeScope::ConfigMaximum => d.max_memory_kib = kib,
                    ResizeScope::Config | ResizeScope::Live => {
                        if scope == ResizeScope::Live && !d.state.is_active() {
                            return Err(command_error("set_memory", "domain is not running"));
                        }
                        d.memory_kib = kib;
                        d.max_memory_kib = d.max_memory_kib.max(kib);
                    }
                }
                Ok(())
            })
            .await
    }

    async fn create_snapshot(
        &self,
        descriptor: &str,
        flags: SnapshotCreateFlags,
    ) -> Result<Box<dyn DomainSnapshot>, HypervisorError> {
        self.hv.enter("create_snapshot").await?;
        let name = descriptor::descriptor_name(descriptor)
            .ok_or_else(|| command_error("create_snapshot", "descriptor has no <name>"))?;
        self.hv
            .with_domain(&self.name, |d| {
                if d.snapshots.contains_key(&name) {
                    return Err(command_error(
                        "create_snapshot",
                        format!("snapshot '{name}' already exists"),
                    ));
                }
                d.snapshots.insert(name.clone(), descriptor.to_owned());
                Ok(())
            })
            .await?;
        tracing::debug!(
            domain = %self.name,
            snapshot = %name,
            ?flags,
            "simulated snapshot created"
        );
        Ok(Box::new(SimSnapshotHandle {
            domain: self.name.clone(),
            name,
            hv: self.hv.clone(),
        }))
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, HypervisorError> {
        self.hv.enter("list_snapshots").await?;
        self.hv
            .with_domain(&self.name, |d| Ok(d.snapshots.keys().cloned().collect()))
            .await
    }

    async fn lookup_snapshot(
        &self,
        name: &str,
    ) -> Result<Box<dyn DomainSnapshot>, HypervisorError> {
        self.hv.enter("lookup_snapshot").await?;
        let exists = self
            .hv
            .with_domain(&self.name, |d| Ok(d.snapshots.contains_key(name)))
            .await?;
        if !exists {
            return Err(HypervisorError::snapshot_not_found(name));
        }
        Ok(Box::new(SimSnapshotHandle {
            domain: self.name.clone(),
            name: name.to_owned(),
            hv: self.hv.clone(),
        }))
    }
}

struct SimSnapshotHandle {
    domain: String,
    name: String,
    hv: SimulatedHypervisor,
}

#[async_trait]
impl DomainSnapshot for SimSnapshotHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn descriptor(&self) -> Result<String, HypervisorError> {
        self.hv.enter("snapshot_descriptor").await?;
        let name = &self.name;
        self.hv
            .with_domain(&self.domain, |d| {
                d.snapshots
                    .get(name)
                    .cloned()
                    .ok_or_else(|| HypervisorError::snapshot_not_found(name.as_str()))
            })
            .await
    }

    async fn revert(&self, flags: RevertFlags) -> Result<(), HypervisorError> {
        self.hv.enter("revert_snapshot").await?;
        let name = &self.name;
        self.hv
            .with_domain(&self.domain, |d| {
                if !d.snapshots.contains_key(name) {
                    return Err(HypervisorError::snapshot_not_found(name.as_str()));
                }
                if d.state.is_active() && !flags.force {
                    return Err(command_error(
                        "revert_snapshot",
                        "domain is running, revert requires force",
                    ));
                }
                if flags.running {
                    d.state = DomainState::Running;
                    d.reason = "from snapshot".to_owned();
                } else {
                    d.state = DomainState::Shutoff;
                    d.reason = "from snapshot".to_owned();
                }
                Ok(())
            })
            .await
    }

    async fn delete(&self, flags: SnapshotDeleteFlags) -> Result<(), HypervisorError> {
        self.hv.enter("delete_snapshot").await?;
        let name = &self.name;
        self.hv
            .with_domain(&self.domain, |d| {
                if d.snapshots.remove(name).is_none() {
                    return Err(HypervisorError::snapshot_not_found(name.as_str()));
                }
                if flags.children {
                    // Snapshots are flat here; every later snapshot counts as a child.
                    let later: Vec<String> =
                        d.snapshots.keys().filter(|s| *s > name).cloned().collect();
                    for child in later {
                        d.snapshots.remove(&child);
                    }
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;
    use crate::config::DiskFormat;
    use crate::descriptor::{domain_xml, DomainSpec, GraphicsKind};

    fn xml(name: &str, vcpus: u32) -> String {
        domain_xml(&DomainSpec {
            name: name.to_owned(),
            uuid: Uuid::new_v4(),
            vcpus,
            memory_mib: 512,
            disk_path: PathBuf::from(format!("/vms/{name}.raw")),
            disk_format: DiskFormat::Raw,
            media_path: PathBuf::from("/iso/linux.iso"),
            network: "default".to_owned(),
            graphics: GraphicsKind::None,
        })
    }

    #[tokio::test]
    async fn define_then_start_makes_domain_active() {
        let hv = SimulatedHypervisor::new();
        let domain = hv.define_domain(&xml("alpha", 2)).await.expect("define");
        assert_eq!(domain.name(), "alpha");
        assert!(!domain.is_active().await.expect("is_active"));
        domain.start().await.expect("start");
        assert_eq!(hv.is_domain_active("alpha").await, Some(true));
        assert_eq!(hv.domain_sizes("alpha").await, Some((2, 2, 512 * 1024)));
    }

    #[tokio::test]
    async fn lookup_missing_domain_is_not_found() {
        let hv = SimulatedHypervisor::new();
        let err = hv.lookup_domain("ghost").await;
        assert!(matches!(err, Err(e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn injected_fault_fails_only_that_operation() {
        let hv = SimulatedHypervisor::new();
        let domain = hv.define_domain(&xml("alpha", 1)).await.expect("define");
        hv.fail_operation("start", "no memory").await;
        assert!(matches!(domain.start().await, Err(HypervisorError::Command { .. })));
        assert!(domain.is_active().await.is_ok());
        hv.clear_faults().await;
        assert!(domain.start().await.is_ok());
    }

    #[tokio::test]
    async fn crash_on_start_leaves_domain_shut_off() {
        let hv = SimulatedHypervisor::new();
        let domain = hv.define_domain(&xml("alpha", 1)).await.expect("define");
        hv.crash_on_start("alpha").await;
        domain.start().await.expect("start call itself succeeds");
        let (state, reason) = domain.state().await.expect("state");
        assert_eq!(state, DomainState::Shutoff);
        assert_eq!(reason, "crashed");
    }

    #[tokio::test]
    async fn descriptor_reports_current_and_maximum_vcpus() {
        let hv = SimulatedHypervisor::new();
        let domain = hv.define_domain(&xml("alpha", 2)).await.expect("define");
        domain.set_vcpus(4, ResizeScope::ConfigMaximum).await.expect("raise max");
        domain.set_vcpus(3, ResizeScope::Config).await.expect("set");
        let current = hv.domain_sizes("alpha").await;
        assert_eq!(current, Some((3, 4, 512 * 1024)));
        let xml = domain.descriptor(false).await.expect("descriptor");
        assert_eq!(descriptor::max_vcpus(&xml), Some(4));
        assert!(xml.contains("current='3'"), "got {xml}");
        assert!(domain.set_vcpus(5, ResizeScope::Config).await.is_err());
    }

    #[tokio::test]
    async fn redefine_keeps_current_sizes() {
        let hv = SimulatedHypervisor::new();
        let domain = hv.define_domain(&xml("alpha", 4)).await.expect("define");
        domain.set_vcpus(2, ResizeScope::Config).await.expect("set vcpus");
        domain.set_memory_kib(256 * 1024, ResizeScope::Config).await.expect("set memory");
        let current = domain.descriptor(false).await.expect("descriptor");
        hv.define_domain(&current).await.expect("redefine");
        assert_eq!(hv.domain_sizes("alpha").await, Some((2, 4, 256 * 1024)));
    }

    #[tokio::test]
    async fn info_accrues_cpu_time_only_while_running() {
        let hv = SimulatedHypervisor::new();
        let domain = hv.define_domain(&xml("alpha", 2)).await.expect("define");
        let idle = domain.info().await.expect("info");
        assert_eq!(idle.state, DomainState::Shutoff);
        assert_eq!(idle.cpu_time_ns, 0);
        assert_eq!((idle.vcpus, idle.memory_kib), (2, 512 * 1024));

        domain.start().await.expect("start");
        let first = domain.info().await.expect("info");
        let second = domain.info().await.expect("info");
        assert_eq!(first.state, DomainState::Running);
        assert!(second.cpu_time_ns > first.cpu_time_ns);
    }

    #[tokio::test]
    async fn snapshot_lifecycle() {
        let hv = SimulatedHypervisor::new();
        let domain = hv.define_domain(&xml("alpha", 1)).await.expect("define");
        let overlay = std::path::Path::new("/vms/alpha-1-100.qcow2");
        let snap_xml = descriptor::snapshot_xml("1-100", "", overlay);
        let snap = domain
            .create_snapshot(&snap_xml, SnapshotCreateFlags::ATOMIC_DISK_ONLY)
            .await
            .expect("create");
        assert_eq!(hv.snapshot_names("alpha").await, vec!["1-100".to_owned()]);
        assert!(domain.create_snapshot(&snap_xml, SnapshotCreateFlags::default()).await.is_err());

        snap.revert(RevertFlags::RUNNING_FORCE).await.expect("revert");
        assert_eq!(hv.is_domain_active("alpha").await, Some(true));

        let found = domain.lookup_snapshot("1-100").await.expect("lookup");
        found.delete(SnapshotDeleteFlags::CHILDREN).await.expect("delete");
        assert!(hv.snapshot_names("alpha").await.is_empty());
        assert!(matches!(domain.lookup_snapshot("1-100").await, Err(e) if e.is_not_found()));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_calls() {
        let hv = SimulatedHypervisor::new();
        hv.set_latency(Duration::from_secs(3)).await;
        let started = tokio::time::Instant::now();
        let _ = hv.lookup_domain("alpha").await;
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
