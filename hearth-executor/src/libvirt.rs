//! libvirt backend over the `virt` bindings.
//!
//! libvirt calls block the calling thread, so each one runs on the tokio
//! blocking pool. Only the connection is shared between tasks; domain and
//! snapshot handles are looked up by name inside every call and freed when
//! the call returns.

use std::sync::Arc;

use async_trait::async_trait;
use virt::connect::Connect;
use virt::domain::Domain as VirtDomain;
use virt::domain_snapshot::DomainSnapshot as VirtSnapshot;
use virt::error::{self as virt_error, Error as VirtError, ErrorNumber};
use virt::sys;

use crate::backend::{
    Domain, DomainInfo, DomainSnapshot, DomainState, Hypervisor, ResizeScope, RevertFlags,
    SnapshotCreateFlags, SnapshotDeleteFlags,
};
use crate::HypervisorError;

/// An open libvirt connection, closed on drop.
struct Connection {
    conn: Connect,
    uri: String,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            tracing::debug!(uri = %self.uri, error = %e, "closing libvirt connection failed");
        }
    }
}

/// What a failed call was aimed at, for not-found classification.
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    domain: &'a str,
    snapshot: Option<&'a str>,
}

/// Maps a libvirt error code to a [`HypervisorError`].
fn classify(
    uri: &str,
    operation: &str,
    target: Target<'_>,
    code: ErrorNumber,
    message: String,
) -> HypervisorError {
    match code {
        ErrorNumber::NoDomain => HypervisorError::domain_not_found(target.domain),
        ErrorNumber::NoDomainSnapshot => {
            HypervisorError::snapshot_not_found(target.snapshot.unwrap_or_default())
        }
        ErrorNumber::NoConnect => HypervisorError::NotConnected {
            uri: uri.to_owned(),
            reason: message,
        },
        _ => HypervisorError::Command {
            operation: operation.to_owned(),
            message,
        },
    }
}

/// Runs `f` against the connection on the blocking pool.
async fn blocking<T, F>(
    connection: &Arc<Connection>,
    operation: &'static str,
    target: Target<'_>,
    f: F,
) -> Result<T, HypervisorError>
where
    T: Send + 'static,
    F: FnOnce(&Connect) -> Result<T, VirtError> + Send + 'static,
{
    let shared = Arc::clone(connection);
    let joined = tokio::task::spawn_blocking(move || f(&shared.conn))
        .await
        .map_err(|e| HypervisorError::Command {
            operation: operation.to_owned(),
            message: format!("blocking libvirt call did not complete: {e}"),
        })?;
    joined.map_err(|e| classify(&connection.uri, operation, target, e.code(), e.to_string()))
}

fn domain_state(code: sys::virDomainState) -> DomainState {
    match code {
        sys::VIR_DOMAIN_RUNNING => DomainState::Running,
        sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => DomainState::ShuttingDown,
        sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
        _ => DomainState::NoState,
    }
}

/// Human-readable reason for the states the orchestrator reports on.
fn state_reason(state: DomainState, reason: i32) -> &'static str {
    let Ok(code) = u32::try_from(reason) else {
        return "unknown";
    };
    match state {
        DomainState::Shutoff => match code {
            sys::VIR_DOMAIN_SHUTOFF_SHUTDOWN => "shutdown",
            sys::VIR_DOMAIN_SHUTOFF_DESTROYED => "destroyed",
            sys::VIR_DOMAIN_SHUTOFF_CRASHED => "crashed",
            sys::VIR_DOMAIN_SHUTOFF_SAVED => "saved",
            sys::VIR_DOMAIN_SHUTOFF_FAILED => "failed",
            sys::VIR_DOMAIN_SHUTOFF_FROM_SNAPSHOT => "from snapshot",
            _ => "unknown",
        },
        DomainState::Running => match code {
            sys::VIR_DOMAIN_RUNNING_BOOTED => "booted",
            sys::VIR_DOMAIN_RUNNING_RESTORED => "restored",
            sys::VIR_DOMAIN_RUNNING_FROM_SNAPSHOT => "from snapshot",
            sys::VIR_DOMAIN_RUNNING_UNPAUSED => "unpaused",
            _ => "unknown",
        },
        DomainState::Crashed => "crashed",
        _ => "unknown",
    }
}

fn vcpu_flags(scope: ResizeScope) -> sys::virDomainVcpuFlags {
    match scope {
        ResizeScope::Live => sys::VIR_DOMAIN_VCPU_LIVE,
        ResizeScope::Config => sys::VIR_DOMAIN_VCPU_CONFIG,
        ResizeScope::ConfigMaximum => sys::VIR_DOMAIN_VCPU_CONFIG | sys::VIR_DOMAIN_VCPU_MAXIMUM,
    }
}

fn memory_flags(scope: ResizeScope) -> sys::virDomainMemoryModFlags {
    match scope {
        ResizeScope::Live => sys::VIR_DOMAIN_MEM_LIVE,
        ResizeScope::Config => sys::VIR_DOMAIN_MEM_CONFIG,
        ResizeScope::ConfigMaximum => sys::VIR_DOMAIN_MEM_CONFIG | sys::VIR_DOMAIN_MEM_MAXIMUM,
    }
}

fn create_flags(flags: SnapshotCreateFlags) -> u32 {
    let mut bits = 0;
    if flags.atomic {
        bits |= sys::VIR_DOMAIN_SNAPSHOT_CREATE_ATOMIC;
    }
    if flags.disk_only {
        bits |= sys::VIR_DOMAIN_SNAPSHOT_CREATE_DISK_ONLY;
    }
    bits
}

fn revert_flags(flags: RevertFlags) -> u32 {
    let mut bits = 0;
    if flags.running {
        bits |= sys::VIR_DOMAIN_SNAPSHOT_REVERT_RUNNING;
    }
    if flags.force {
        bits |= sys::VIR_DOMAIN_SNAPSHOT_REVERT_FORCE;
    }
    bits
}

fn delete_flags(flags: SnapshotDeleteFlags) -> u32 {
    let mut bits = 0;
    if flags.children {
        bits |= sys::VIR_DOMAIN_SNAPSHOT_DELETE_CHILDREN;
    }
    if flags.metadata_only {
        bits |= sys::VIR_DOMAIN_SNAPSHOT_DELETE_METADATA_ONLY;
    }
    bits
}

/// libvirt [`Hypervisor`].
#[derive(Clone)]
pub struct LibvirtBackend {
    connection: Arc<Connection>,
}

impl LibvirtBackend {
    /// Opens a connection to `uri`.
    ///
    /// # Errors
    /// Returns [`HypervisorError::NotConnected`] if libvirt cannot be reached.
    pub async fn connect(uri: impl Into<String>) -> Result<Self, HypervisorError> {
        let uri = uri.into();
        let target = uri.clone();
        let opened = tokio::task::spawn_blocking(move || {
            // Errors surface through `Result`; libvirt's default handler
            // would also print them to stderr.
            virt_error::clear_error_callback();
            Connect::open(Some(target.as_str()))
        })
        .await
        .map_err(|e| HypervisorError::NotConnected {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;
        let conn = opened.map_err(|e| HypervisorError::NotConnected {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;
        tracing::info!(uri = %uri, "connected to libvirt");
        Ok(Self { connection: Arc::new(Connection { conn, uri }) })
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.connection.uri
    }

    fn domain(&self, name: String) -> Box<dyn Domain> {
        Box::new(LibvirtDomain { connection: Arc::clone(&self.connection), name })
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn kind(&self) -> &'static str {
        "libvirt"
    }

    async fn lookup_domain(&self, name: &str) -> Result<Box<dyn Domain>, HypervisorError> {
        let owned = name.to_owned();
        let target = Target { domain: name, snapshot: None };
        blocking(&self.connection, "lookup_domain", target, move |conn| {
            VirtDomain::lookup_by_name(conn, &owned).map(drop)
        })
        .await?;
        Ok(self.domain(name.to_owned()))
    }

    async fn define_domain(&self, descriptor: &str) -> Result<Box<dyn Domain>, HypervisorError> {
        let xml = descriptor.to_owned();
        let target = Target { domain: "", snapshot: None };
        let name = blocking(&self.connection, "define_domain", target, move |conn| {
            VirtDomain::define_xml(conn, &xml)?.get_name()
        })
        .await?;
        tracing::info!(domain = %name, "domain defined");
        Ok(self.domain(name))
    }

    async fn is_alive(&self) -> bool {
        let target = Target { domain: "", snapshot: None };
        blocking(&self.connection, "is_alive", target, |conn| conn.is_alive())
            .await
            .unwrap_or(false)
    }
}

struct LibvirtDomain {
    connection: Arc<Connection>,
    name: String,
}

impl LibvirtDomain {
    /// Looks the domain up on the blocking pool and runs `f` on it.
    async fn with_domain<T, F>(&self, operation: &'static str, f: F) -> Result<T, HypervisorError>
    where
        T: Send + 'static,
        F: FnOnce(&VirtDomain) -> Result<T, VirtError> + Send + 'static,
    {
        let name = self.name.clone();
        let target = Target { domain: &self.name, snapshot: None };
        blocking(&self.connection, operation, target, move |conn| {
            let domain = VirtDomain::lookup_by_name(conn, &name)?;
            f(&domain)
        })
        .await
    }

    fn snapshot(&self, name: String) -> Box<dyn DomainSnapshot> {
        Box::new(LibvirtSnapshot {
            connection: Arc::clone(&self.connection),
            domain: self.name.clone(),
            name,
        })
    }
}

#[async_trait]
impl Domain for LibvirtDomain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_active(&self) -> Result<bool, HypervisorError> {
        self.with_domain("is_active", |d| d.is_active()).await
    }

    async fn state(&self) -> Result<(DomainState, String), HypervisorError> {
        let (code, reason) = self.with_domain("state", |d| d.get_state()).await?;
        let state = domain_state(code);
        Ok((state, state_reason(state, reason).to_owned()))
    }

    async fn info(&self) -> Result<DomainInfo, HypervisorError> {
        let info = self.with_domain("info", |d| d.get_info()).await?;
        Ok(DomainInfo {
            state: domain_state(info.state),
            max_memory_kib: info.max_mem,
            memory_kib: info.memory,
            vcpus: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    async fn descriptor(&self, secure: bool) -> Result<String, HypervisorError> {
        let flags = if secure { sys::VIR_DOMAIN_XML_SECURE } else { 0 };
        self.with_domain("descriptor", move |d| d.get_xml_desc(flags)).await
    }

    async fn start(&self) -> Result<(), HypervisorError> {
        self.with_domain("start", |d| d.create().map(drop)).await
    }

    async fn force_stop(&self) -> Result<(), HypervisorError> {
        self.with_domain("force_stop", VirtDomain::destroy).await
    }

    async fn graceful_stop(&self) -> Result<(), HypervisorError> {
        self.with_domain("graceful_stop", |d| d.shutdown().map(drop)).await
    }

    async fn undefine(&self) -> Result<(), HypervisorError> {
        self.with_domain("undefine", VirtDomain::undefine).await
    }

    async fn set_vcpus(&self, count: u32, scope: ResizeScope) -> Result<(), HypervisorError> {
        let flags = vcpu_flags(scope);
        self.with_domain("set_vcpus", move |d| d.set_vcpus_flags(count, flags).map(drop))
            .await
    }

    async fn set_memory_kib(&self, kib: u64, scope: ResizeScope) -> Result<(), HypervisorError> {
        let flags = memory_flags(scope);
        self.with_domain("set_memory", move |d| d.set_memory_flags(kib, flags).map(drop))
            .await
    }

    async fn create_snapshot(
        &self,
        descriptor: &str,
        flags: SnapshotCreateFlags,
    ) -> Result<Box<dyn DomainSnapshot>, HypervisorError> {
        let xml = descriptor.to_owned();
        let bits = create_flags(flags);
        let name = self
            .with_domain("create_snapshot", move |d| {
                VirtSnapshot::create_xml(d, &xml, bits)?.get_name()
            })
            .await?;
        tracing::info!(domain = %self.name, snapshot = %name, "snapshot created");
        Ok(self.snapshot(name))
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, HypervisorError> {
        self.with_domain("list_snapshots", |d| {
            d.list_all_snapshots(0)?
                .iter()
                .map(VirtSnapshot::get_name)
                .collect()
        })
        .await
    }

    async fn lookup_snapshot(
        &self,
        name: &str,
    ) -> Result<Box<dyn DomainSnapshot>, HypervisorError> {
        let domain = self.name.clone();
        let owned = name.to_owned();
        let target = Target { domain: &self.name, snapshot: Some(name) };
        blocking(&self.connection, "lookup_snapshot", target, move |conn| {
            let dom = VirtDomain::lookup_by_name(conn, &domain)?;
            VirtSnapshot::lookup_by_name(&dom, &owned, 0).map(drop)
        })
        .await?;
        Ok(self.snapshot(name.to_owned()))
    }
}

struct LibvirtSnapshot {
    connection: Arc<Connection>,
    domain: String,
    name: String,
}

impl LibvirtSnapshot {
    async fn with_snapshot<T, F>(&self, operation: &'static str, f: F) -> Result<T, HypervisorError>
    where
        T: Send + 'static,
        F: FnOnce(&VirtSnapshot) -> Result<T, VirtError> + Send + 'static,
    {
        let domain = self.domain.clone();
        let name = self.name.clone();
        let target = Target { domain: &self.domain, snapshot: Some(&self.name) };
        blocking(&self.connection, operation, target, move |conn| {
            let dom = VirtDomain::lookup_by_name(conn, &domain)?;
            let snapshot = VirtSnapshot::lookup_by_name(&dom, &name, 0)?;
            f(&snapshot)
        })
        .await
    }
}

#[async_trait]
impl DomainSnapshot for LibvirtSnapshot {
    fn name(&self) -> &str {
        &self.name
    }

    async fn descriptor(&self) -> Result<String, HypervisorError> {
        self.with_snapshot("snapshot_descriptor", |s| s.get_xml_desc(0)).await
    }

    async fn revert(&self, flags: RevertFlags) -> Result<(), HypervisorError> {
        let bits = revert_flags(flags);
        self.with_snapshot("revert_snapshot", move |s| s.revert(bits)).await
    }

    async fn delete(&self, flags: SnapshotDeleteFlags) -> Result<(), HypervisorError> {
        let bits = delete_flags(flags);
        self.with_snapshot("delete_snapshot", move |s| s.delete(bits)).await
    }
}
