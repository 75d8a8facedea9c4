use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::id;
use crate::proxy::ProxyConfig;

/// Default display (VNC) port range scanned at create time.
pub const DEFAULT_DISPLAY_PORTS: RangeInclusive<u16> = 5900..=5999;

/// Display passwords are never shorter than this.
pub const MIN_DISPLAY_PASSWORD_LEN: usize = 8;

/// Status a VM lands in once provisioning succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCreatePolicy {
    /// Define the domain and leave it shut off.
    Stopped,
    /// Define the domain and boot it right away.
    Running,
}

impl PostCreatePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stopped" | "stop" | "0" | "false" => Some(PostCreatePolicy::Stopped),
            "running" | "start" | "1" | "true" => Some(PostCreatePolicy::Running),
            _ => None,
        }
    }
}

impl std::fmt::Display for PostCreatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostCreatePolicy::Stopped => write!(f, "stopped"),
            PostCreatePolicy::Running => write!(f, "running"),
        }
    }
}

/// Node daemon configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub grpc_port: u16,
    pub data_dir: String,
    /// Directory holding the per-VM disk copies.
    pub storage_dir: String,
    pub hypervisor_uri: String,
    /// Libvirt virtual network every VM NIC is attached to.
    pub network_name: String,
    pub display_ports: RangeInclusive<u16>,
    pub post_create: PostCreatePolicy,
    pub display_password_len: usize,
    pub reconcile_interval: Duration,
    pub proxy: ProxyConfig,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let data_dir =
            std::env::var("LABVM_DATA_DIR").unwrap_or_else(|_| "/var/lib/labvm".to_string());

        let port_min = env_parse("LABVM_DISPLAY_PORT_MIN", *DEFAULT_DISPLAY_PORTS.start());
        let port_max = env_parse("LABVM_DISPLAY_PORT_MAX", *DEFAULT_DISPLAY_PORTS.end());
        let display_ports = if port_min <= port_max {
            port_min..=port_max
        } else {
            DEFAULT_DISPLAY_PORTS
        };

        let post_create = std::env::var("LABVM_POST_CREATE")
            .ok()
            .and_then(|v| PostCreatePolicy::parse(&v))
            .unwrap_or(PostCreatePolicy::Stopped);

        Self {
            node_id: std::env::var("LABVM_NODE_ID")
                .unwrap_or_else(|_| id::generate_id(id::NODE_PREFIX)),
            grpc_port: env_parse("LABVM_GRPC_PORT", 50051),
            storage_dir: std::env::var("LABVM_STORAGE_DIR")
                .unwrap_or_else(|_| "/var/lib/libvirt/images".to_string()),
            hypervisor_uri: std::env::var("LABVM_HYPERVISOR_URI")
                .unwrap_or_else(|_| "qemu:///system".to_string()),
            network_name: std::env::var("LABVM_NETWORK").unwrap_or_else(|_| "default".to_string()),
            proxy: ProxyConfig::from_env(*display_ports.start()),
            display_ports,
            post_create,
            display_password_len: env_parse("LABVM_DISPLAY_PASSWORD_LEN", MIN_DISPLAY_PASSWORD_LEN)
                .max(MIN_DISPLAY_PASSWORD_LEN),
            reconcile_interval: Duration::from_secs(env_parse("LABVM_RECONCILE_INTERVAL_SECS", 60)),
            data_dir,
        }
    }

    /// Location of the persisted record store snapshot.
    pub fn state_path(&self) -> String {
        format!("{}/state.json", self.data_dir)
    }

    /// Destination of a VM's private copy of its template disk.
    pub fn disk_path_for(&self, vm_name: &str) -> String {
        format!("{}/{}.qcow2", self.storage_dir, vm_name)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub fn test_config(root: &std::path::Path) -> NodeConfig {
    NodeConfig {
        node_id: "node_test".to_string(),
        grpc_port: 50051,
        data_dir: root.join("data").to_string_lossy().into_owned(),
        storage_dir: root.join("images").to_string_lossy().into_owned(),
        hypervisor_uri: "test:///default".to_string(),
        network_name: "default".to_string(),
        display_ports: DEFAULT_DISPLAY_PORTS,
        post_create: PostCreatePolicy::Stopped,
        display_password_len: MIN_DISPLAY_PASSWORD_LEN,
        reconcile_interval: Duration::from_secs(60),
        proxy: ProxyConfig {
            binary: root.join("no-such-websockify").to_string_lossy().into_owned(),
            public_port_base: 6080,
            display_port_base: *DEFAULT_DISPLAY_PORTS.start(),
            web_root: None,
            stop_timeout: Duration::from_millis(500),
        },
    }
}
