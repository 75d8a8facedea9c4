//! Libvirt domain descriptors: building the one passed to `define` and
//! reading back the fields the node cares about from `describe`.

use std::borrow::Cow;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::Writer;

/// Parameters for defining a libvirt domain.
pub struct DomainConfig {
    pub name: String,
    pub uuid: String,
    pub memory_mib: u32,
    pub vcpu_count: u32,
    pub disk_path: String,
    pub mac_address: String,
    pub network: String,
    pub display_port: u16,
    pub display_password: String,
}

impl DomainConfig {
    /// Build the domain descriptor passed to `define`.
    ///
    /// One virtio disk backed by the copied image, one virtio NIC on the
    /// named network, a password-guarded VNC channel on every address and a
    /// serial console.
    pub fn to_xml(&self) -> Result<String, DomainXmlError> {
        let memory = self.memory_mib.to_string();
        let vcpu = self.vcpu_count.to_string();
        let port = self.display_port.to_string();

        let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
        start(&mut w, "domain", &[("type", "kvm")])?;
        text(&mut w, "name", &[], &self.name)?;
        text(&mut w, "uuid", &[], &self.uuid)?;
        text(&mut w, "memory", &[("unit", "MiB")], &memory)?;
        text(&mut w, "currentMemory", &[("unit", "MiB")], &memory)?;
        text(&mut w, "vcpu", &[], &vcpu)?;

        start(&mut w, "os", &[])?;
        text(&mut w, "type", &[("arch", "x86_64")], "hvm")?;
        empty(&mut w, "boot", &[("dev", "hd")])?;
        end(&mut w, "os")?;

        start(&mut w, "features", &[])?;
        for feature in ["acpi", "apic", "pae"] {
            empty(&mut w, feature, &[])?;
        }
        end(&mut w, "features")?;
        empty(&mut w, "clock", &[("offset", "utc")])?;

        start(&mut w, "devices", &[])?;

        start(&mut w, "disk", &[("type", "file"), ("device", "disk")])?;
        empty(&mut w, "driver", &[("name", "qemu"), ("type", "qcow2")])?;
        empty(&mut w, "source", &[("file", &self.disk_path)])?;
        empty(&mut w, "target", &[("dev", "vda"), ("bus", "virtio")])?;
        end(&mut w, "disk")?;

        start(&mut w, "interface", &[("type", "network")])?;
        empty(&mut w, "source", &[("network", &self.network)])?;
        empty(&mut w, "mac", &[("address", &self.mac_address)])?;
        empty(&mut w, "model", &[("type", "virtio")])?;
        end(&mut w, "interface")?;

        start(
            &mut w,
            "graphics",
            &[
                ("type", "vnc"),
                ("port", &port),
                ("autoport", "no"),
                ("listen", "0.0.0.0"),
                ("passwd", &self.display_password),
            ],
        )?;
        empty(&mut w, "listen", &[("type", "address"), ("address", "0.0.0.0")])?;
        end(&mut w, "graphics")?;

        start(&mut w, "video", &[])?;
        empty(&mut w, "model", &[("type", "cirrus")])?;
        end(&mut w, "video")?;

        start(&mut w, "console", &[("type", "pty")])?;
        empty(&mut w, "target", &[("type", "virtio"), ("port", "0")])?;
        end(&mut w, "console")?;

        start(&mut w, "serial", &[("type", "pty")])?;
        empty(&mut w, "target", &[("port", "0")])?;
        end(&mut w, "serial")?;

        end(&mut w, "devices")?;
        end(&mut w, "domain")?;

        String::from_utf8(w.into_inner()).map_err(|e| {
            DomainXmlError::Write(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

type XmlWriter = Writer<Vec<u8>>;

fn start(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> Result<(), DomainXmlError> {
    w.write_event(Event::Start(
        BytesStart::new(name).with_attributes(attrs.iter().copied()),
    ))
    .map_err(DomainXmlError::Write)
}

fn empty(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> Result<(), DomainXmlError> {
    w.write_event(Event::Empty(
        BytesStart::new(name).with_attributes(attrs.iter().copied()),
    ))
    .map_err(DomainXmlError::Write)
}

fn end(w: &mut XmlWriter, name: &str) -> Result<(), DomainXmlError> {
    w.write_event(Event::End(BytesEnd::new(name)))
        .map_err(DomainXmlError::Write)
}

fn text(
    w: &mut XmlWriter,
    name: &str,
    attrs: &[(&str, &str)],
    value: &str,
) -> Result<(), DomainXmlError> {
    start(w, name, attrs)?;
    w.write_event(Event::Text(BytesText::new(value)))
        .map_err(DomainXmlError::Write)?;
    end(w, name)
}

/// Fields recovered from a domain descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainDescription {
    pub name: Option<String>,
    pub uuid: Option<String>,
    /// Backing file of the first file-backed disk.
    pub disk_path: Option<String>,
    /// Guest device name of that disk (e.g. `vda`).
    pub disk_target: Option<String>,
    /// VNC port, `None` when the hypervisor picks one at boot.
    pub display_port: Option<u16>,
    pub mac_address: Option<String>,
    /// Host-side tap device of the first NIC, only present while running.
    pub interface_dev: Option<String>,
}

#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, DomainXmlError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| DomainXmlError::Read(e.into()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(DomainXmlError::Read)?;
            attrs.push((key, value.into_owned()));
        }
        Ok(Self { name, attrs })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl DomainDescription {
    pub fn parse(xml: &str) -> Result<Self, DomainXmlError> {
        let mut reader = Reader::from_str(xml);
        let mut desc = DomainDescription::default();
        let mut stack: Vec<Element> = Vec::new();

        loop {
            match reader.read_event().map_err(DomainXmlError::Read)? {
                Event::Start(e) => {
                    let element = Element::from_start(&e)?;
                    desc.visit(&element, stack.last());
                    stack.push(element);
                }
                Event::Empty(e) => {
                    let element = Element::from_start(&e)?;
                    desc.visit(&element, stack.last());
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(t) => {
                    let value = t.unescape().map_err(DomainXmlError::Read)?;
                    desc.visit_text(&stack, value);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(desc)
    }

    fn visit_text(&mut self, stack: &[Element], value: Cow<'_, str>) {
        let path: Vec<&str> = stack.iter().map(|e| e.name.as_str()).collect();
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        match path.as_slice() {
            ["domain", "name"] => self.name = Some(value.to_string()),
            ["domain", "uuid"] => self.uuid = Some(value.to_string()),
            _ => {}
        }
    }

    fn visit(&mut self, element: &Element, parent: Option<&Element>) {
        let parent_name = parent.map(|p| p.name.as_str());
        match (element.name.as_str(), parent_name) {
            ("source", Some("disk")) if self.disk_path.is_none() => {
                let file_disk = parent
                    .map(|p| p.attr("type") == Some("file") && p.attr("device") != Some("cdrom"))
                    .unwrap_or(false);
                if file_disk {
                    self.disk_path = element.attr("file").map(str::to_string);
                }
            }
            ("target", Some("disk")) if self.disk_target.is_none() => {
                let file_disk = parent.map(|p| p.attr("device") != Some("cdrom")).unwrap_or(false);
                if file_disk {
                    self.disk_target = element.attr("dev").map(str::to_string);
                }
            }
            ("graphics", _) if element.attr("type") == Some("vnc") => {
                self.display_port = element.attr("port").and_then(|p| p.parse::<u16>().ok());
            }
            ("mac", Some("interface")) if self.mac_address.is_none() => {
                self.mac_address = element.attr("address").map(str::to_string);
            }
            ("target", Some("interface")) if self.interface_dev.is_none() => {
                self.interface_dev = element.attr("dev").map(str::to_string);
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
pub enum DomainXmlError {
    Write(std::io::Error),
    Read(quick_xml::Error),
}

impl std::fmt::Display for DomainXmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainXmlError::Write(e) => write!(f, "failed to write domain descriptor: {}", e),
            DomainXmlError::Read(e) => write!(f, "malformed domain descriptor: {}", e),
        }
    }
}

impl std::error::Error for DomainXmlError {}
