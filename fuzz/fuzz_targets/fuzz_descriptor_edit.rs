//! Fuzz target: domain descriptor editing.
//!
//! Runs the boot-order and CD-ROM editors over arbitrary text, which must
//! never panic. The first input line also becomes a media path loaded into
//! a rendered descriptor, which must read back unchanged.
#![no_main]

use std::path::PathBuf;

use hearth_executor::descriptor::{
    boot_devices, cdrom_source, domain_xml, remove_cdrom, set_boot_order, set_cdrom_source,
    DomainSpec,
};
use hearth_executor::{BootOrder, DiskFormat, GraphicsKind};
use libfuzzer_sys::fuzz_target;
use uuid::Uuid;

const ORDERS: [BootOrder; 4] =
    [BootOrder::CdromHd, BootOrder::Hd, BootOrder::Cdrom, BootOrder::HdCdrom];

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let order = ORDERS[data.first().map_or(0, |b| usize::from(*b) % ORDERS.len())];

    let _ = set_boot_order(&text, order);
    let _ = boot_devices(&text);
    let _ = set_cdrom_source(&text, None);
    let _ = remove_cdrom(&text);
    if cdrom_source(&text).is_some() {
        assert!(set_cdrom_source(&text, None).is_some());
    }

    let media = PathBuf::from(text.lines().next().unwrap_or_default());
    let xml = domain_xml(&DomainSpec {
        name: "fuzz".to_owned(),
        uuid: Uuid::nil(),
        vcpus: 1,
        memory_mib: 512,
        disk_path: PathBuf::from("/var/lib/hearth/vms/fuzz.qcow2"),
        disk_format: DiskFormat::Qcow2,
        media_path: PathBuf::from("/var/lib/hearth/iso/installer.iso"),
        network: "default".to_owned(),
        graphics: GraphicsKind::None,
    });
    let loaded = set_cdrom_source(&xml, Some(&media)).expect("rendered descriptor has a cd-rom");
    let expected = (!media.as_os_str().is_empty()).then(|| media.clone());
    assert_eq!(cdrom_source(&loaded), Some(expected));

    let reordered = set_boot_order(&loaded, order).expect("rendered descriptor has <os>");
    assert_eq!(boot_devices(&reordered), order.devices());
    assert_eq!(cdrom_source(&remove_cdrom(&reordered)), None);
});
