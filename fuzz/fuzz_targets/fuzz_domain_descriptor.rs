//! Fuzz target: domain descriptor synthesis.
//!
//! Splits the input into a VM name and a network name, renders a domain
//! descriptor and reads it back. Rendering must never panic, and for names
//! that pass validation the name and sizes must survive the round trip.
#![no_main]

use std::path::PathBuf;

use hearth_executor::descriptor::{
    descriptor_name, domain_xml, max_memory_kib, max_vcpus, DomainSpec,
};
use hearth_executor::{DiskFormat, GraphicsKind};
use libfuzzer_sys::fuzz_target;
use uuid::Uuid;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (name, network) = text.split_once('\n').unwrap_or((text, "default"));
    let vcpus = u32::from(data.first().copied().unwrap_or(1)).max(1);
    let memory_mib = u32::from(data.last().copied().unwrap_or(1)).max(1) * 64;

    let spec = DomainSpec {
        name: name.to_owned(),
        uuid: Uuid::from_bytes([data.len().to_le_bytes()[0]; 16]),
        vcpus,
        memory_mib,
        disk_path: PathBuf::from(format!("/var/lib/hearth/vms/{name}.qcow2")),
        disk_format: DiskFormat::Qcow2,
        media_path: PathBuf::from("/var/lib/hearth/iso/installer.iso"),
        network: network.to_owned(),
        graphics: GraphicsKind::Vnc,
    };
    let xml = domain_xml(&spec);

    if hearth_core::validate_vm_name(name).is_ok() {
        assert_eq!(descriptor_name(&xml).as_deref(), Some(name));
    }
    assert_eq!(max_vcpus(&xml), Some(vcpus));
    assert_eq!(max_memory_kib(&xml), Some(u64::from(memory_mib) * 1024));
});
