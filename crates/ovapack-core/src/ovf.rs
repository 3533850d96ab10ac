//! OVF descriptor generation.
//!
//! The descriptor describes a single virtual machine with one streamOptimized
//! disk, one network adapter on "VM Network" and a fixed hardware profile.
//! Only the disk reference, the identifiers and the timestamp vary between
//! runs; everything else is static.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Version of the descriptor layout written into the product section.
pub const OVF_VERSION: &str = "3.3.0.0";

/// Format URI of the referenced disk.
pub const DISK_FORMAT_URI: &str =
    "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

/// Name of the single logical network.
pub const NETWORK_NAME: &str = "VM Network";

/// Bytes per capacity unit (`byte * 2^30`).
pub const BYTES_PER_GIB: u64 = 1 << 30;

/// Timestamp layout used in the annotation section.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

const NS_OVF: &str = "http://schemas.dmtf.org/ovf/envelope/1";
const NS_CIM: &str = "http://schemas.dmtf.org/wbem/wscim/1/common";
const NS_RASD: &str =
    "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData";
const NS_VSSD: &str =
    "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData";
const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";

const FILE_ID: &str = "file1";
const DISK_ID: &str = "vmdisk1";

/// One `Item` of the virtual hardware section.
struct HardwareItem {
    required: bool,
    /// `rasd:` element names and their text, in schema order.
    fields: &'static [(&'static str, &'static str)],
}

const HARDWARE_PROFILE: &[HardwareItem] = &[
    HardwareItem {
        required: true,
        fields: &[
            ("AllocationUnits", "hertz * 10^6"),
            ("Description", "Number of Virtual CPUs"),
            ("ElementName", "1 virtual CPU(s)"),
            ("InstanceID", "1"),
            ("ResourceType", "3"),
            ("VirtualQuantity", "1"),
        ],
    },
    HardwareItem {
        required: true,
        fields: &[
            ("AllocationUnits", "byte * 2^20"),
            ("Description", "Memory Size"),
            ("ElementName", "2048MB of memory"),
            ("InstanceID", "2"),
            ("ResourceType", "4"),
            ("VirtualQuantity", "2048"),
        ],
    },
    HardwareItem {
        required: true,
        fields: &[
            ("Address", "1"),
            ("Description", "IDE Controller"),
            ("ElementName", "VirtualIDEController 1"),
            ("InstanceID", "3"),
            ("ResourceType", "5"),
        ],
    },
    HardwareItem {
        required: true,
        fields: &[
            ("Address", "0"),
            ("Description", "IDE Controller"),
            ("ElementName", "VirtualIDEController 0"),
            ("InstanceID", "4"),
            ("ResourceType", "5"),
        ],
    },
    HardwareItem {
        required: false,
        fields: &[
            ("AutomaticAllocation", "false"),
            ("ElementName", "VirtualVideoCard"),
            ("InstanceID", "5"),
            ("ResourceType", "24"),
        ],
    },
    HardwareItem {
        required: false,
        fields: &[
            ("AutomaticAllocation", "false"),
            ("ElementName", "VirtualVMCIDevice"),
            ("InstanceID", "6"),
            ("ResourceSubType", "vmware.vmci"),
            ("ResourceType", "1"),
        ],
    },
    HardwareItem {
        required: false,
        fields: &[
            ("AddressOnParent", "0"),
            ("AutomaticAllocation", "false"),
            ("ElementName", "CD-ROM 1"),
            ("InstanceID", "7"),
            ("Parent", "3"),
            ("ResourceSubType", "vmware.cdrom.remotepassthrough"),
            ("ResourceType", "15"),
        ],
    },
    HardwareItem {
        required: true,
        fields: &[
            ("AddressOnParent", "0"),
            ("ElementName", "Hard Disk 1"),
            ("HostResource", "ovf:/disk/vmdisk1"),
            ("InstanceID", "8"),
            ("Parent", "4"),
            ("ResourceType", "17"),
        ],
    },
    HardwareItem {
        required: false,
        fields: &[
            ("AddressOnParent", "0"),
            ("AutomaticAllocation", "false"),
            ("Description", "Floppy Drive"),
            ("ElementName", "Floppy 1"),
            ("InstanceID", "9"),
            ("ResourceSubType", "vmware.floppy.remotedevice"),
            ("ResourceType", "14"),
        ],
    },
    HardwareItem {
        required: true,
        fields: &[
            ("AddressOnParent", "7"),
            ("AutomaticAllocation", "true"),
            ("Connection", NETWORK_NAME),
            ("Description", "VmxNet3 ethernet adapter on \"VM Network\""),
            ("ElementName", "Ethernet 1"),
            ("InstanceID", "10"),
            ("ResourceSubType", "VmxNet3"),
            ("ResourceType", "10"),
        ],
    },
];

/// Everything that varies between two rendered descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfConfig {
    /// File name of the disk inside the archive (e.g. "test.vmdk").
    pub disk_file_name: String,
    /// Logical size of the source image in bytes.
    pub raw_disk_size: u64,
    /// Stand-in for a hypervisor-assigned snapshot identifier.
    pub snapshot_id: Uuid,
    /// Stand-in for a hypervisor-assigned storage pool identifier.
    pub storage_pool_id: Uuid,
    /// Creation time of the descriptor.
    pub created: DateTime<Utc>,
}

impl OvfConfig {
    /// Create a configuration with fresh identifiers and the current time.
    pub fn new(disk_file_name: impl Into<String>, raw_disk_size: u64) -> Self {
        Self {
            disk_file_name: disk_file_name.into(),
            raw_disk_size,
            snapshot_id: Uuid::new_v4(),
            storage_pool_id: Uuid::new_v4(),
            created: Utc::now(),
        }
    }

    /// Disk capacity in whole GiB.
    ///
    /// Truncates: the capacity field is an integer and purely advisory, so a
    /// 1.5 GiB image is declared as 1.
    pub fn disk_size_gb(&self) -> u64 {
        self.raw_disk_size / BYTES_PER_GIB
    }

    /// Creation timestamp as written into the descriptor.
    pub fn timestamp(&self) -> String {
        self.created.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Name of the virtual system, derived from the disk file stem.
    pub fn system_name(&self) -> &str {
        Path::new(&self.disk_file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.disk_file_name)
    }

    /// Render the descriptor XML.
    pub fn render(&self) -> Result<String> {
        let mut xml = XmlWriter::new();

        xml.decl()?;
        xml.start_with(
            "Envelope",
            &[
                ("xmlns", NS_OVF),
                ("xmlns:cim", NS_CIM),
                ("xmlns:ovf", NS_OVF),
                ("xmlns:rasd", NS_RASD),
                ("xmlns:vssd", NS_VSSD),
                ("xmlns:xsi", NS_XSI),
            ],
        )?;

        let raw_size = self.raw_disk_size.to_string();
        xml.start("References")?;
        xml.empty(
            "File",
            &[
                ("ovf:href", self.disk_file_name.as_str()),
                ("ovf:id", FILE_ID),
                ("ovf:size", raw_size.as_str()),
            ],
        )?;
        xml.end("References")?;

        let capacity = self.disk_size_gb().to_string();
        xml.start("DiskSection")?;
        xml.text_element("Info", "Virtual disk information")?;
        xml.empty(
            "Disk",
            &[
                ("ovf:capacity", capacity.as_str()),
                ("ovf:boot", "true"),
                ("ovf:capacityAllocationUnits", "byte * 2^30"),
                ("ovf:diskId", DISK_ID),
                ("ovf:fileRef", FILE_ID),
                ("ovf:format", DISK_FORMAT_URI),
            ],
        )?;
        xml.end("DiskSection")?;

        xml.start("NetworkSection")?;
        xml.text_element("Info", "The list of logical networks")?;
        xml.start_with("Network", &[("ovf:name", NETWORK_NAME)])?;
        xml.text_element("Description", &format!("The {} network", NETWORK_NAME))?;
        xml.end("Network")?;
        xml.end("NetworkSection")?;

        let system_id = self.system_name().to_lowercase();
        xml.start_with("VirtualSystem", &[("ovf:id", system_id.as_str())])?;
        xml.text_element("Info", "A virtual machine")?;
        xml.text_element("Name", self.system_name())?;
        self.write_product_section(&mut xml)?;
        self.write_annotation_section(&mut xml)?;

        xml.start_with("OperatingSystemSection", &[("ovf:id", "80"), ("ovf:version", "6")])?;
        xml.text_element("Info", "The kind of installed guest operating system")?;
        xml.end("OperatingSystemSection")?;

        xml.start("VirtualHardwareSection")?;
        xml.text_element("Info", "Virtual hardware requirements")?;
        xml.start("System")?;
        xml.text_element("vssd:ElementName", "Virtual Hardware Family")?;
        xml.text_element("vssd:InstanceID", "0")?;
        xml.text_element("vssd:VirtualSystemIdentifier", &system_id)?;
        xml.text_element("vssd:VirtualSystemType", "vmx-08")?;
        xml.end("System")?;
        for item in HARDWARE_PROFILE {
            if item.required {
                xml.start("Item")?;
            } else {
                xml.start_with("Item", &[("ovf:required", "false")])?;
            }
            for (name, value) in item.fields {
                xml.text_element(&format!("rasd:{}", name), value)?;
            }
            xml.end("Item")?;
        }
        xml.end("VirtualHardwareSection")?;

        xml.end("VirtualSystem")?;
        xml.end("Envelope")?;

        xml.finish()
    }

    fn write_product_section(&self, xml: &mut XmlWriter) -> Result<()> {
        xml.start("ProductSection")?;
        xml.text_element("Info", "Information about the installed software")?;
        xml.text_element("Product", &self.disk_file_name)?;
        xml.text_element("Version", OVF_VERSION)?;
        xml.end("ProductSection")
    }

    fn write_annotation_section(&self, xml: &mut XmlWriter) -> Result<()> {
        xml.start("AnnotationSection")?;
        xml.text_element("Info", "Image provenance")?;
        xml.text_element(
            "Annotation",
            &format!(
                "Created {} (snapshot {}, storage pool {})",
                self.timestamp(),
                self.snapshot_id,
                self.storage_pool_id
            ),
        )?;
        xml.end("AnnotationSection")
    }
}

/// Thin wrapper over the quick-xml writer that maps its errors.
struct XmlWriter {
    writer: Writer<Vec<u8>>,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| Error::ovf(format!("failed to write XML: {}", e)))
    }

    fn decl(&mut self) -> Result<()> {
        self.write(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
    }

    fn start(&mut self, name: &str) -> Result<()> {
        self.write(Event::Start(BytesStart::new(name)))
    }

    fn start_with(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for &attr in attrs {
            elem.push_attribute(attr);
        }
        self.write(Event::Start(elem))
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for &attr in attrs {
            elem.push_attribute(attr);
        }
        self.write(Event::Empty(elem))
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start(name)?;
        self.write(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn finish(self) -> Result<String> {
        let mut bytes = self.writer.into_inner();
        bytes.push(b'\n');
        String::from_utf8(bytes).map_err(|e| Error::ovf(format!("descriptor is not UTF-8: {}", e)))
    }
}

/// Render a descriptor for `disk_file_name` with fresh identifiers.
pub fn render(disk_file_name: &str, logical_size_bytes: u64) -> Result<String> {
    OvfConfig::new(disk_file_name, logical_size_bytes).render()
}

/// Descriptor file name for an image basename.
pub fn descriptor_file_name(basename: &str) -> String {
    format!("{}.ovf", basename)
}

/// Render a descriptor and write it to `<dir>/<basename>.ovf`.
///
/// Returns the path of the written file.
pub fn write_descriptor(
    dir: &Path,
    basename: &str,
    disk_file_name: &str,
    logical_size_bytes: u64,
) -> Result<PathBuf> {
    let config = OvfConfig::new(disk_file_name, logical_size_bytes);
    let xml = config.render()?;
    let path = dir.join(descriptor_file_name(basename));

    tracing::info!(
        path = %path.display(),
        capacity_gb = config.disk_size_gb(),
        snapshot_id = %config.snapshot_id,
        "writing OVF descriptor"
    );
    fs::write(&path, xml).map_err(|e| Error::io(e, &path))?;

    Ok(path)
}
