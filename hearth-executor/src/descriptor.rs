//! libvirt domain and snapshot descriptor synthesis.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::DiskFormat;

/// Remote display attached to a new domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphicsKind {
    #[default]
    Vnc,
    Spice,
    None,
}

impl FromStr for GraphicsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vnc" => Ok(Self::Vnc),
            "spice" => Ok(Self::Spice),
            "none" | "" => Ok(Self::None),
            other => Err(format!("unknown graphics type '{other}'")),
        }
    }
}

/// Everything needed to render a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub uuid: Uuid,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub disk_path: PathBuf,
    pub disk_format: DiskFormat,
    pub media_path: PathBuf,
    pub network: String,
    pub graphics: GraphicsKind,
}

/// Escapes the five XML special characters.
#[must_use]
pub fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn escape_path(path: &Path) -> String {
    xml_escape(&path.to_string_lossy())
}

/// Locally administered MAC derived from the VM UUID.
///
/// Stable for a given UUID so a redefined domain keeps its DHCP lease.
#[must_use]
pub fn mac_for(uuid: &Uuid) -> String {
    let digest = Sha256::digest(uuid.as_bytes());
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}

fn graphics_xml(kind: GraphicsKind) -> &'static str {
    match kind {
        GraphicsKind::Vnc => concat!(
            "    <graphics type='vnc' port='-1' autoport='yes' listen='0.0.0.0'>\n",
            "      <listen type='address' address='0.0.0.0'/>\n",
            "    </graphics>\n",
        ),
        GraphicsKind::Spice => concat!(
            "    <graphics type='spice' port='-1' autoport='yes' listen='0.0.0.0'>\n",
            "      <listen type='address' address='0.0.0.0'/>\n",
            "    </graphics>\n",
        ),
        GraphicsKind::None => "",
    }
}

/// Boot device sequence written into a domain's `<os>` element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootOrder {
    /// Installation media first, then the disk. New domains use this.
    #[default]
    CdromHd,
    /// Disk only.
    Hd,
    /// Installation media only.
    Cdrom,
    /// Disk first, then the installation media.
    HdCdrom,
}

impl BootOrder {
    /// libvirt `<boot dev=...>` values, in boot order.
    #[must_use]
    pub const fn devices(self) -> &'static [&'static str] {
        match self {
            Self::CdromHd => &["cdrom", "hd"],
            Self::Hd => &["hd"],
            Self::Cdrom => &["cdrom"],
            Self::HdCdrom => &["hd", "cdrom"],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CdromHd => "cdrom_hd",
            Self::Hd => "hd",
            Self::Cdrom => "cdrom",
            Self::HdCdrom => "hd_cdrom",
        }
    }
}

impl std::fmt::Display for BootOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootOrder {
    type Err = String;

    /// Accepts `cdrom_hd`, `hd`, `cdrom` and `hd_cdrom`, case-insensitively,
    /// with `-` for `_`, `hdd` for `hd` and an optional `_only` suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_").replace("hdd", "hd");
        match normalized.trim_end_matches("_only") {
            "cdrom_hd" => Ok(Self::CdromHd),
            "hd" => Ok(Self::Hd),
            "cdrom" => Ok(Self::Cdrom),
            "hd_cdrom" => Ok(Self::HdCdrom),
            _ => Err(format!(
                "unknown boot order '{s}' (expected cdrom_hd, hd, cdrom or hd_cdrom)"
            )),
        }
    }
}

fn boot_xml(devices: &[&str]) -> String {
    let mut xml = String::new();
    for dev in devices {
        let _ = write!(xml, "\n    <boot dev='{dev}'/>");
    }
    xml
}

/// Renders the libvirt domain XML for a new VM.
///
/// Boots from the installation media first, then the disk.
#[must_use]
pub fn domain_xml(spec: &DomainSpec) -> String {
    let memory_kib = u64::from(spec.memory_mib) * 1024;
    let mut xml = String::with_capacity(2048);
    xml.push_str("<domain type='kvm'>\n");
    let _ = writeln!(xml, "  <name>{}</name>", xml_escape(&spec.name));
    let _ = writeln!(xml, "  <uuid>{}</uuid>", spec.uuid);
    let _ = writeln!(xml, "  <memory unit='KiB'>{memory_kib}</memory>");
    let _ = writeln!(xml, "  <currentMemory unit='KiB'>{memory_kib}</currentMemory>");
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", spec.vcpus);
    xml.push_str("  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>");
    xml.push_str(&boot_xml(BootOrder::CdromHd.devices()));
    xml.push_str("\n  </os>\n");
    xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
    xml.push_str("  <cpu mode='host-model' check='partial'/>\n");
    xml.push_str("  <clock offset='utc'/>\n");
    xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
    xml.push_str("  <on_reboot>restart</on_reboot>\n");
    xml.push_str("  <on_crash>destroy</on_crash>\n");
    xml.push_str("  <devices>\n");
    xml.push_str("    <disk type='file' device='disk'>\n");
    let _ = writeln!(xml, "      <driver name='qemu' type='{}'/>", spec.disk_format.as_str());
    let _ = writeln!(xml, "      <source file='{}'/>", escape_path(&spec.disk_path));
    xml.push_str("      <target dev='vda' bus='virtio'/>\n    </disk>\n");
    xml.push_str("    <disk type='file' device='cdrom'>\n");
    xml.push_str("      <driver name='qemu' type='raw'/>\n");
    let _ = writeln!(xml, "      <source file='{}'/>", escape_path(&spec.media_path));
    xml.push_str("      <target dev='sda' bus='sata'/>\n      <readonly/>\n    </disk>\n");
    xml.push_str("    <interface type='network'>\n");
    let _ = writeln!(xml, "      <mac address='{}'/>", mac_for(&spec.uuid));
    let _ = writeln!(xml, "      <source network='{}'/>", xml_escape(&spec.network));
    xml.push_str("      <model type='virtio'/>\n    </interface>\n");
    xml.push_str("    <serial type='pty'>\n      <target port='0'/>\n    </serial>\n");
    xml.push_str("    <console type='pty'>\n");
    xml.push_str("      <target type='serial' port='0'/>\n");
    xml.push_str("    </console>\n");
    xml.push_str("    <input type='tablet' bus='usb'/>\n");
    xml.push_str(graphics_xml(spec.graphics));
    xml.push_str("    <video>\n");
    xml.push_str("      <model type='virtio' heads='1' primary='yes'/>\n");
    xml.push_str("    </video>\n");
    xml.push_str("  </devices>\n</domain>\n");
    xml
}

/// Renders the descriptor for an atomic, disk-only external snapshot whose
/// overlay is written to `overlay_path`.
#[must_use]
pub fn snapshot_xml(internal_name: &str, description: &str, overlay_path: &Path) -> String {
    let mut xml = String::with_capacity(256);
    xml.push_str("<domainsnapshot>\n");
    let _ = writeln!(xml, "  <name>{}</name>", xml_escape(internal_name));
    let _ = writeln!(xml, "  <description>{}</description>", xml_escape(description));
    xml.push_str("  <disks>\n    <disk name='vda' snapshot='external'>\n");
    let _ = writeln!(xml, "      <source file='{}'/>", escape_path(overlay_path));
    xml.push_str("    </disk>\n  </disks>\n</domainsnapshot>\n");
    xml
}

/// Position of the first `<tag` that opens exactly `tag`, so `<boot` does
/// not match `<bootmenu`.
fn find_tag(xml: &str, tag: &str) -> Option<usize> {
    let open = format!("<{tag}");
    let mut offset = 0;
    while let Some(found) = xml[offset..].find(&open) {
        let at = offset + found;
        let next = xml[at + open.len()..].chars().next();
        if matches!(next, Some(c) if c.is_whitespace() || c == '/' || c == '>') {
            return Some(at);
        }
        offset = at + open.len();
    }
    None
}

/// Value of attribute `name` in an opening tag, quotes removed.
fn attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=");
    let mut offset = 0;
    while let Some(found) = tag[offset..].find(&needle) {
        let at = offset + found;
        offset = at + needle.len();
        if !tag[..at].ends_with(char::is_whitespace) {
            continue;
        }
        let rest = &tag[offset..];
        let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
        let value = &rest[1..];
        return value.find(quote).map(|end| &value[..end]);
    }
    None
}

/// Byte range of the first `<tag>...</tag>` or self-closing `<tag/>`
/// element at or after `from` for which `accept` holds on its opening tag.
/// Unclosed elements are skipped.
fn element(
    xml: &str,
    tag: &str,
    from: usize,
    accept: impl Fn(&str) -> bool,
) -> Option<(usize, usize)> {
    let close = format!("</{tag}>");
    let mut offset = from;
    while let Some(found) = find_tag(&xml[offset..], tag) {
        let start = offset + found;
        let open_end = start + xml[start..].find('>')?;
        let open = &xml[start..open_end];
        let end = if open.ends_with('/') {
            open_end + 1
        } else if let Some(close_at) = xml[open_end..].find(&close) {
            open_end + close_at + close.len()
        } else {
            offset = open_end;
            continue;
        };
        if accept(open) {
            return Some((start, end));
        }
        offset = end;
    }
    None
}

/// Text content of the first `<tag>` element along with its opening tag.
fn element_text<'a>(xml: &'a str, tag: &str) -> Option<(&'a str, &'a str)> {
    let (start, end) = element(xml, tag, 0, |_| true)?;
    let whole = &xml[start..end];
    let open_end = whole.find('>')?;
    let body = whole[open_end + 1..].strip_suffix(&format!("</{tag}>"))?;
    Some((&whole[..open_end], body.trim()))
}

/// Removes `xml[start..end]` together with the whitespace before it.
fn cut(xml: &str, start: usize, end: usize) -> String {
    format!("{}{}", xml[..start].trim_end(), &xml[end..])
}

/// Extracts the maximum vCPU count from a domain descriptor.
///
/// The text content of `<vcpu ...>N</vcpu>` is the maximum; a `current`
/// attribute, if any, is the active count.
#[must_use]
pub fn max_vcpus(descriptor: &str) -> Option<u32> {
    element_text(descriptor, "vcpu")?.1.parse().ok()
}

/// The `current` vCPU count of a domain descriptor, or the maximum when
/// the attribute is absent.
#[must_use]
pub fn current_vcpus(descriptor: &str) -> Option<u32> {
    let (open, body) = element_text(descriptor, "vcpu")?;
    match attr(open, "current") {
        Some(current) => current.parse().ok(),
        None => body.parse().ok(),
    }
}

fn memory_element_kib(descriptor: &str, tag: &str) -> Option<u64> {
    let (open, body) = element_text(descriptor, tag)?;
    let value: u64 = body.parse().ok()?;
    match attr(open, "unit").unwrap_or("KiB") {
        "b" | "bytes" => Some(value / 1024),
        "KiB" | "k" | "K" => Some(value),
        "MiB" | "M" => value.checked_mul(1024),
        "GiB" | "G" => value.checked_mul(1024 * 1024),
        _ => None,
    }
}

/// Extracts the maximum memory in KiB from a domain descriptor's
/// `<memory>` element. Values in other units are converted.
#[must_use]
pub fn max_memory_kib(descriptor: &str) -> Option<u64> {
    memory_element_kib(descriptor, "memory")
}

/// Memory currently allotted to the domain in KiB, from `<currentMemory>`,
/// falling back to the maximum.
#[must_use]
pub fn current_memory_kib(descriptor: &str) -> Option<u64> {
    memory_element_kib(descriptor, "currentMemory").or_else(|| max_memory_kib(descriptor))
}

/// Extracts the `<name>` of a domain or snapshot descriptor.
#[must_use]
pub fn descriptor_name(descriptor: &str) -> Option<String> {
    let start = descriptor.find("<name>")? + "<name>".len();
    let end = descriptor[start..].find("</name>")? + start;
    Some(xml_unescape(descriptor[start..end].trim()))
}

fn xml_unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Range of the `<os>` element and the offset just past its `</type>`.
fn os_section(xml: &str) -> Option<(usize, usize, usize)> {
    let (start, end) = element(xml, "os", 0, |_| true)?;
    let type_end = start + xml[start..end].find("</type>")? + "</type>".len();
    Some((start, end, type_end))
}

/// Drops the `<boot/>` tags inside `xml[start..end]` whose `dev` matches.
fn strip_boot(xml: &str, start: usize, end: usize, drop_dev: impl Fn(&str) -> bool) -> String {
    let mut section = xml[start..end].to_owned();
    let mut from = 0;
    while let Some((s, e)) = element(&section, "boot", from, |open| {
        attr(open, "dev").is_some_and(&drop_dev)
    }) {
        let trimmed = section[..s].trim_end().len();
        section = cut(&section, s, e);
        from = trimmed;
    }
    format!("{}{section}{}", &xml[..start], &xml[end..])
}

/// Rewrites the boot devices of a domain descriptor.
///
/// Existing `<boot/>` tags are replaced by `order`'s devices right after
/// the `<type>` element. `None` if the descriptor has no `<os>` with a
/// `<type>`.
#[must_use]
pub fn set_boot_order(descriptor: &str, order: BootOrder) -> Option<String> {
    let (start, end, _) = os_section(descriptor)?;
    let stripped = strip_boot(descriptor, start, end, |_| true);
    let (_, _, type_end) = os_section(&stripped)?;
    Some(format!(
        "{}{}{}",
        &stripped[..type_end],
        boot_xml(order.devices()),
        &stripped[type_end..]
    ))
}

/// Boot devices currently listed in the `<os>` element.
#[must_use]
pub fn boot_devices(descriptor: &str) -> Vec<String> {
    let Some((start, end, _)) = os_section(descriptor) else {
        return Vec::new();
    };
    let section = &descriptor[start..end];
    let mut devices = Vec::new();
    let mut from = 0;
    while let Some((s, e)) = element(section, "boot", from, |_| true) {
        if let Some(dev) = attr(&section[s..e], "dev") {
            devices.push(dev.to_owned());
        }
        from = e;
    }
    devices
}

fn cdrom_disk(xml: &str) -> Option<(usize, usize)> {
    element(xml, "disk", 0, |open| attr(open, "device") == Some("cdrom"))
}

/// Media loaded in the domain's CD-ROM drive.
///
/// `None` if the descriptor has no CD-ROM device, `Some(None)` if the drive
/// is empty.
#[must_use]
pub fn cdrom_source(descriptor: &str) -> Option<Option<PathBuf>> {
    let (start, end) = cdrom_disk(descriptor)?;
    let disk = &descriptor[start..end];
    let source = element(disk, "source", 0, |_| true)
        .and_then(|(s, e)| attr(&disk[s..e], "file"))
        .filter(|file| !file.is_empty())
        .map(|file| PathBuf::from(xml_unescape(file)));
    Some(source)
}

/// Loads `media` into the CD-ROM drive, or empties it for `None`.
///
/// `None` if the descriptor has no CD-ROM device.
#[must_use]
pub fn set_cdrom_source(descriptor: &str, media: Option<&Path>) -> Option<String> {
    let (start, end) = cdrom_disk(descriptor)?;
    let mut disk = descriptor[start..end].to_owned();
    while let Some((s, e)) = element(&disk, "source", 0, |_| true) {
        disk = cut(&disk, s, e);
    }
    if let Some(path) = media {
        if let Some(open) = disk.strip_suffix("/>") {
            disk = format!("{open}>\n    </disk>");
        }
        let anchor = element(&disk, "driver", 0, |_| true)
            .map(|(_, e)| e)
            .or_else(|| disk.find('>').map(|i| i + 1))?;
        disk.insert_str(anchor, &format!("\n      <source file='{}'/>", escape_path(path)));
    }
    Some(format!("{}{disk}{}", &descriptor[..start], &descriptor[end..]))
}

/// Removes the CD-ROM device and its boot entry so the domain boots from
/// disk. A `<boot dev='hd'/>` is added when no disk boot entry remains.
#[must_use]
pub fn remove_cdrom(descriptor: &str) -> String {
    let mut xml = match cdrom_disk(descriptor) {
        Some((start, end)) => cut(descriptor, start, end),
        None => descriptor.to_owned(),
    };
    if let Some((start, end, _)) = os_section(&xml) {
        xml = strip_boot(&xml, start, end, |dev| dev == "cdrom");
    }
    if !boot_devices(&xml).iter().any(|dev| dev == "hd") {
        if let Some((_, _, type_end)) = os_section(&xml) {
            xml.insert_str(type_end, &boot_xml(BootOrder::Hd.devices()));
        }
    }
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DomainSpec {
        DomainSpec {
            name: "alpha".to_owned(),
            uuid: Uuid::nil(),
            vcpus: 2,
            memory_mib: 1024,
            disk_path: PathBuf::from("/vms/alpha.qcow2"),
            disk_format: DiskFormat::Qcow2,
            media_path: PathBuf::from("/iso/linux.iso"),
            network: "default".to_owned(),
            graphics: GraphicsKind::Vnc,
        }
    }

    #[test]
    fn domain_xml_contains_sizes_and_devices() {
        let xml = domain_xml(&spec());
        assert!(xml.contains("<name>alpha</name>"));
        assert!(xml.contains("<memory unit='KiB'>1048576</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("<source file='/vms/alpha.qcow2'/>"));
        assert!(xml.contains("<source file='/iso/linux.iso'/>"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("<graphics type='vnc'"));
        assert!(xml.contains("<serial type='pty'>"));
    }

    #[test]
    fn domain_xml_boots_media_before_disk() {
        let xml = domain_xml(&spec());
        let cdrom = xml.find("<boot dev='cdrom'/>");
        let hd = xml.find("<boot dev='hd'/>");
        assert!(matches!((cdrom, hd), (Some(c), Some(h)) if c < h));
    }

    #[test]
    fn domain_xml_without_graphics_has_no_graphics_element() {
        let mut s = spec();
        s.graphics = GraphicsKind::None;
        assert!(!domain_xml(&s).contains("<graphics"));
        s.graphics = GraphicsKind::Spice;
        assert!(domain_xml(&s).contains("<graphics type='spice'"));
    }

    #[test]
    fn domain_xml_escapes_paths() {
        let mut s = spec();
        s.media_path = PathBuf::from("/iso/a'b&c.iso");
        let xml = domain_xml(&s);
        assert!(xml.contains("/iso/a&apos;b&amp;c.iso"), "got {xml}");
    }

    #[test]
    fn mac_is_stable_and_locally_administered() {
        let id = Uuid::from_u128(0x1234);
        assert_eq!(mac_for(&id), mac_for(&id));
        assert!(mac_for(&id).starts_with("52:54:00:"));
        assert_eq!(mac_for(&id).len(), 17);
        assert_ne!(mac_for(&id), mac_for(&Uuid::from_u128(0x1235)));
    }

    #[test]
    fn max_vcpus_reads_element_text() {
        let xml = "<domain><vcpu placement='static' current='2'>8</vcpu></domain>";
        assert_eq!(max_vcpus(xml), Some(8));
        assert_eq!(max_vcpus(&domain_xml(&spec())), Some(2));
        assert_eq!(max_vcpus("<domain/>"), None);
    }

    #[test]
    fn max_memory_kib_converts_units() {
        assert_eq!(max_memory_kib(&domain_xml(&spec())), Some(1024 * 1024));
        assert_eq!(max_memory_kib("<memory unit=\"MiB\">512</memory>"), Some(512 * 1024));
        assert_eq!(max_memory_kib("<memory>2048</memory>"), Some(2048));
        assert_eq!(max_memory_kib("<domain/>"), None);
    }

    #[test]
    fn descriptor_name_round_trips_escaped_names() {
        let xml = snapshot_xml("7-1700000000000", "before <upgrade>", Path::new("/vms/a-7.qcow2"));
        assert_eq!(descriptor_name(&xml).as_deref(), Some("7-1700000000000"));
        assert!(xml.contains("before &lt;upgrade&gt;"));
        assert!(xml.contains("snapshot='external'"));
    }

    #[test]
    fn boot_order_parses_loose_spellings() {
        assert_eq!("cdrom_hd".parse::<BootOrder>(), Ok(BootOrder::CdromHd));
        assert_eq!("CDROM-HDD".parse::<BootOrder>(), Ok(BootOrder::CdromHd));
        assert_eq!("hdd-only".parse::<BootOrder>(), Ok(BootOrder::Hd));
        assert_eq!("hd_cdrom".parse::<BootOrder>(), Ok(BootOrder::HdCdrom));
        assert_eq!(" cdrom ".parse::<BootOrder>(), Ok(BootOrder::Cdrom));
        assert!("network".parse::<BootOrder>().is_err());
        assert_eq!(BootOrder::HdCdrom.to_string(), "hd_cdrom");
    }

    #[test]
    fn set_boot_order_replaces_every_boot_entry() {
        let xml = set_boot_order(&domain_xml(&spec()), BootOrder::HdCdrom).expect("has <os>");
        assert_eq!(boot_devices(&xml), vec!["hd", "cdrom"]);
        assert!(xml.contains("hvm</type>\n    <boot dev='hd'/>\n    <boot dev='cdrom'/>\n  </os>"));

        let xml = set_boot_order(&xml, BootOrder::Hd).expect("has <os>");
        assert_eq!(boot_devices(&xml), vec!["hd"]);
        assert_eq!(set_boot_order("<domain/>", BootOrder::Hd), None);
    }

    #[test]
    fn set_boot_order_keeps_bootmenu() {
        let xml = concat!(
            "<domain><os><type>hvm</type>",
            "<boot dev='cdrom'/><bootmenu enable='yes'/></os></domain>"
        );
        let updated = set_boot_order(xml, BootOrder::Hd).expect("has <os>");
        assert!(updated.contains("<bootmenu enable='yes'/>"));
        assert_eq!(boot_devices(&updated), vec!["hd"]);
    }

    #[test]
    fn cdrom_source_distinguishes_empty_drive_from_missing_device() {
        let xml = domain_xml(&spec());
        assert_eq!(cdrom_source(&xml), Some(Some(PathBuf::from("/iso/linux.iso"))));

        let empty = set_cdrom_source(&xml, None).expect("has cdrom");
        assert_eq!(cdrom_source(&empty), Some(None));
        assert!(empty.contains("<source file='/vms/alpha.qcow2'/>"), "disk source untouched");

        let reloaded =
            set_cdrom_source(&empty, Some(Path::new("/iso/a&b.iso"))).expect("has cdrom");
        assert_eq!(cdrom_source(&reloaded), Some(Some(PathBuf::from("/iso/a&b.iso"))));
        assert!(reloaded.contains("<source file='/iso/a&amp;b.iso'/>"));

        let ejected = remove_cdrom(&xml);
        assert_eq!(cdrom_source(&ejected), None);
        assert_eq!(set_cdrom_source(&ejected, None), None);
    }

    #[test]
    fn remove_cdrom_leaves_disk_boot() {
        let xml = set_boot_order(&domain_xml(&spec()), BootOrder::Cdrom).expect("has <os>");
        let ejected = remove_cdrom(&xml);
        assert!(!ejected.contains("device='cdrom'"));
        assert_eq!(boot_devices(&ejected), vec!["hd"]);
        assert!(ejected.contains("device='disk'"));
        assert_eq!(remove_cdrom(&ejected), ejected);
    }

    #[test]
    fn current_sizes_fall_back_to_maximum() {
        let xml = domain_xml(&spec());
        assert_eq!(current_vcpus(&xml), Some(2));
        assert_eq!(current_memory_kib(&xml), Some(1024 * 1024));
        let resized = "<vcpu placement='static' current='3'>8</vcpu><memory>4096</memory>\
                       <currentMemory unit='MiB'>2</currentMemory>";
        assert_eq!(current_vcpus(resized), Some(3));
        assert_eq!(current_memory_kib(resized), Some(2048));
        assert_eq!(current_memory_kib("<memory>4096</memory>"), Some(4096));
    }

    proptest::proptest! {
        #[test]
        fn proptest_boot_order_rewrite_keeps_the_rest(
            order in proptest::sample::select(vec![
                BootOrder::CdromHd, BootOrder::Hd, BootOrder::Cdrom, BootOrder::HdCdrom,
            ]),
        ) {
            let xml = domain_xml(&spec());
            let updated = set_boot_order(&xml, order).expect("has <os>");
            proptest::prop_assert_eq!(boot_devices(&updated), order.devices().to_vec());
            let without_boot = |x: &str| {
                x.lines().filter(|l| !l.contains("<boot ")).collect::<Vec<_>>().join("\n")
            };
            proptest::prop_assert_eq!(without_boot(&updated), without_boot(&xml));
        }
    }

    proptest::proptest! {
        #[test]
        fn proptest_escaped_text_has_no_raw_markup(raw in ".{0,64}") {
            let escaped = xml_escape(&raw);
            proptest::prop_assert!(!escaped.contains('<'));
            proptest::prop_assert!(!escaped.contains('>'));
            proptest::prop_assert!(!escaped.contains('\''));
            proptest::prop_assert_eq!(xml_unescape(&escaped), raw);
        }
    }
}
