use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::access::Actor;
use crate::config::{NodeConfig, PostCreatePolicy};
use crate::disk::{self, DiskError};
use crate::domain::{DomainConfig, DomainDescription, DomainXmlError};
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::id;
use crate::network::{MacAllocator, MacError};
use crate::ports::{PortAllocator, PortError};
use crate::proxy::{ProxyError, ProxySupervisor};
use crate::quota::{self, QuotaError, ResourceRequest};
use crate::store::{now_ms, RecordStore, StoreError, Template, VmRecord, VmStatus};
use crate::tasks::TaskRegistry;

const MAX_NAME_LEN: usize = 64;

/// What a caller asks for when creating a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVmSpec {
    pub name: String,
    pub template_id: String,
    pub course_id: Option<String>,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

/// Outcome of a lifecycle operation as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub success: bool,
    pub vm_id: String,
    pub error: Option<String>,
}

impl OperationResult {
    pub fn ok(vm_id: &str) -> Self {
        Self {
            success: true,
            vm_id: vm_id.to_string(),
            error: None,
        }
    }

    pub fn failed(vm_id: &str, error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            vm_id: vm_id.to_string(),
            error: Some(error.to_string()),
        }
    }

    pub fn from_result<T>(vm_id: &str, result: &Result<T, VmError>) -> Self {
        match result {
            Ok(_) => Self::ok(vm_id),
            Err(e) => Self::failed(vm_id, e),
        }
    }
}

/// Handle to an asynchronous create.
pub struct CreateTicket {
    pub vm_id: String,
    pub task_id: String,
    pub handle: JoinHandle<OperationResult>,
}

/// Observed runtime state of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatusReport {
    pub state: String,
    pub display_port: Option<u16>,
    pub ip_address: Option<String>,
    pub is_active: bool,
}

/// Raw hypervisor counters. All zero while the domain is not active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmMetrics {
    /// Cumulative guest CPU time in nanoseconds.
    pub cpu_usage: u64,
    pub memory_usage: u64,
    pub memory_available: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub network_rx: u64,
    pub network_tx: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleAccess {
    pub proxy_port: u16,
    pub display_password: String,
}

/// Drives VM lifecycle transitions against the hypervisor and keeps the
/// record store in step with what the hypervisor did.
pub struct VmManager {
    config: NodeConfig,
    store: Arc<dyn RecordStore>,
    hypervisor: Arc<dyn Hypervisor>,
    proxies: ProxySupervisor,
    ports: PortAllocator,
    macs: MacAllocator,
    tasks: TaskRegistry,
    /// Serializes admission so quota and name checks see every prior insert.
    admission: Mutex<()>,
}

impl VmManager {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn RecordStore>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        Self {
            ports: PortAllocator::new(config.display_ports.clone()),
            proxies: ProxySupervisor::new(config.proxy.clone()),
            macs: MacAllocator::new(),
            tasks: TaskRegistry::new(),
            admission: Mutex::new(()),
            config,
            store,
            hypervisor,
        }
    }

    /// Replace the display port allocator.
    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn proxies(&self) -> &ProxySupervisor {
        &self.proxies
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Bring in-memory state in line with the store after a restart.
    ///
    /// Ports and MACs of every record are reserved, and records left in
    /// `creating` or `deleting` by a crash are moved to `error`.
    pub async fn restore(&self) -> Result<usize, VmError> {
        let vms = self.store.list_vms().await.map_err(VmError::Store)?;
        for vm in &vms {
            if let Some(port) = vm.display_port {
                if !self.ports.reserve(port) {
                    warn!(vm_id = %vm.id, port, "display port recorded twice");
                }
            }
            if let Some(mac) = &vm.mac_address {
                self.macs.reserve(mac);
            }
            if vm.status.is_transient() {
                warn!(vm_id = %vm.id, status = %vm.status, "operation interrupted by restart");
                self.store
                    .transition(&vm.id, &[vm.status], VmStatus::Error)
                    .await
                    .map_err(VmError::Store)?;
            }
        }
        info!(vms = vms.len(), ports = self.ports.reserved_count(), "vm state restored");
        Ok(vms.len())
    }

    /// Look up a VM the actor is allowed to operate.
    pub async fn authorize(&self, actor: &Actor, vm_id: &str) -> Result<VmRecord, VmError> {
        let vm = self.get_record(vm_id).await?;
        if !actor.can_operate(&vm) {
            return Err(VmError::PermissionDenied(format!(
                "user {} may not operate vm {}",
                actor.user_id, vm_id
            )));
        }
        Ok(vm)
    }

    /// VMs visible to the actor, newest first.
    pub async fn list(
        &self,
        actor: &Actor,
        course_id: Option<&str>,
    ) -> Result<Vec<VmRecord>, VmError> {
        let mut vms: Vec<VmRecord> = self
            .store
            .list_vms()
            .await
            .map_err(VmError::Store)?
            .into_iter()
            .filter(|vm| actor.can_view(vm))
            .filter(|vm| course_id.is_none() || vm.course_id.as_deref() == course_id)
            .collect();
        vms.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then_with(|| b.id.cmp(&a.id)));
        Ok(vms)
    }

    /// Create a VM and wait for provisioning to finish.
    pub async fn create(&self, actor: &Actor, spec: CreateVmSpec) -> Result<VmRecord, VmError> {
        let (record, template) = self.admit(actor, &spec).await?;
        self.provision(record, template).await
    }

    /// Validate and record the VM now, provision it on a background task.
    ///
    /// Validation errors are returned directly. Provisioning failures show up
    /// in the task result and as `error` status on the record.
    pub async fn submit_create(
        self: &Arc<Self>,
        actor: &Actor,
        spec: CreateVmSpec,
    ) -> Result<CreateTicket, VmError> {
        let (record, template) = self.admit(actor, &spec).await?;
        let vm_id = record.id.clone();
        let task_id = self.tasks.submit("create_vm", &vm_id).await;

        let manager = Arc::clone(self);
        let task = task_id.clone();
        let handle = tokio::spawn(async move {
            manager.tasks.mark_running(&task).await;
            let vm_id = record.id.clone();
            let result = match manager.provision(record, template).await {
                Ok(_) => OperationResult::ok(&vm_id),
                Err(e) => OperationResult::failed(&vm_id, &e),
            };
            manager.tasks.complete(&task, result.clone()).await;
            result
        });

        info!(vm_id = %vm_id, task_id = %task_id, "create submitted");
        Ok(CreateTicket {
            vm_id,
            task_id,
            handle,
        })
    }

    /// Checks that must pass before any side effect, then the `creating`
    /// insert. Quota is checked before the hypervisor is consulted.
    async fn admit(
        &self,
        actor: &Actor,
        spec: &CreateVmSpec,
    ) -> Result<(VmRecord, Template), VmError> {
        validate_spec(spec)?;

        if let Some(course_id) = &spec.course_id {
            if !actor.can_create_in_course(course_id) {
                return Err(VmError::PermissionDenied(format!(
                    "user {} may not create VMs in course {}",
                    actor.user_id, course_id
                )));
            }
        }

        let template = self
            .store
            .get_template(&spec.template_id)
            .await
            .map_err(VmError::Store)?
            .ok_or_else(|| VmError::TemplateNotFound(spec.template_id.clone()))?;

        let _admission = self.admission.lock().await;

        let existing = self
            .store
            .vms_for_owner(&actor.user_id)
            .await
            .map_err(VmError::Store)?;
        let user_quota = self
            .store
            .get_quota(&actor.user_id)
            .await
            .map_err(VmError::Store)?;
        quota::check_quota(
            user_quota.as_ref(),
            &existing,
            ResourceRequest {
                cpu_cores: spec.cpu_cores,
                memory_mb: spec.memory_mb,
                disk_gb: spec.disk_gb,
            },
        )
        .map_err(VmError::Quota)?;

        if self
            .hypervisor
            .lookup(&spec.name)
            .await
            .map_err(VmError::Hypervisor)?
            .is_some()
        {
            return Err(VmError::NameConflict(spec.name.clone()));
        }

        // a disk kept by an earlier delete still owns the name
        let disk_path = self.config.disk_path_for(&spec.name);
        if Path::new(&disk_path).exists() {
            warn!(name = %spec.name, disk = %disk_path, "disk from an earlier vm still present");
            return Err(VmError::NameConflict(spec.name.clone()));
        }

        let now = now_ms();
        let record = VmRecord {
            id: id::generate_id(id::VM_PREFIX),
            name: spec.name.clone(),
            uuid: None,
            owner_id: actor.user_id.clone(),
            course_id: spec.course_id.clone(),
            template_id: Some(template.id.clone()),
            cpu_cores: spec.cpu_cores,
            memory_mb: spec.memory_mb,
            disk_gb: spec.disk_gb,
            mac_address: None,
            ip_address: None,
            display_port: None,
            display_password: None,
            disk_path: None,
            status: VmStatus::Creating,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.store.insert_vm(record.clone()).await.map_err(|e| match e {
            StoreError::Conflict(_) => VmError::NameConflict(spec.name.clone()),
            other => VmError::Store(other),
        })?;

        info!(vm_id = %record.id, name = %record.name, owner = %record.owner_id, "vm admitted");
        Ok((record, template))
    }

    /// Run provisioning; any failure leaves the record in `error`.
    async fn provision(&self, mut record: VmRecord, template: Template) -> Result<VmRecord, VmError> {
        match self.provision_steps(&mut record, &template).await {
            Ok(vm) => Ok(vm),
            Err(e) => {
                error!(vm_id = %record.id, name = %record.name, error = %e, "vm creation failed");
                self.abandon_create(record).await;
                Err(e)
            }
        }
    }

    /// 1. Reserve display port and MAC, pick a display password
    /// 2. Copy the template disk
    /// 3. Define the domain
    /// 4. Apply the post-create policy
    async fn provision_steps(
        &self,
        record: &mut VmRecord,
        template: &Template,
    ) -> Result<VmRecord, VmError> {
        let port = self.ports.allocate().map_err(VmError::Ports)?;
        record.display_port = Some(port);
        let mac = self.macs.allocate().map_err(VmError::Mac)?;
        record.mac_address = Some(mac.clone());
        let password = id::generate_password(self.config.display_password_len);
        record.display_password = Some(password.clone());

        let disk_path = self.config.disk_path_for(&record.name);
        disk::clone_template(&template.disk_path, &disk_path)
            .await
            .map_err(VmError::Disk)?;
        record.disk_path = Some(disk_path.clone());
        self.store.save_vm(record.clone()).await.map_err(VmError::Store)?;

        let descriptor = DomainConfig {
            name: record.name.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
            memory_mib: record.memory_mb,
            vcpu_count: record.cpu_cores,
            disk_path,
            mac_address: mac,
            network: self.config.network_name.clone(),
            display_port: port,
            display_password: password,
        }
        .to_xml()
        .map_err(VmError::Descriptor)?;
        let domain = self
            .hypervisor
            .define(&descriptor)
            .await
            .map_err(VmError::Hypervisor)?;
        record.uuid = Some(domain.uuid);
        self.store.save_vm(record.clone()).await.map_err(VmError::Store)?;

        let vm = match self.config.post_create {
            PostCreatePolicy::Stopped => {
                self.set_status(&record.id, &[VmStatus::Creating], VmStatus::Stopped)
                    .await?
            }
            PostCreatePolicy::Running => {
                self.hypervisor
                    .start(&record.name)
                    .await
                    .map_err(VmError::Hypervisor)?;
                let vm = self
                    .set_status(&record.id, &[VmStatus::Creating], VmStatus::Running)
                    .await?;
                self.publish_display(&vm).await;
                vm
            }
        };

        info!(vm_id = %vm.id, name = %vm.name, port, status = %vm.status, "vm created");
        Ok(vm)
    }

    /// Undo what a failed create reserved and park the record in `error`.
    ///
    /// Before the domain is defined nothing outside the node refers to the
    /// port, MAC or disk, so they are released. Once defined they stay with
    /// the record so a later start or delete can use them.
    async fn abandon_create(&self, mut record: VmRecord) {
        if record.uuid.is_none() {
            if let Some(port) = record.display_port.take() {
                self.ports.release(port);
            }
            if let Some(mac) = record.mac_address.take() {
                self.macs.release(&mac);
            }
            record.display_password = None;
            if let Some(path) = record.disk_path.take() {
                if let Err(e) = disk::remove_disk(&path).await {
                    warn!(vm_id = %record.id, error = %e, "failed to remove disk of failed vm");
                }
            }
            if let Err(e) = self.store.save_vm(record.clone()).await {
                warn!(vm_id = %record.id, error = %e, "failed to clear artifacts of failed vm");
            }
        }
        if let Err(e) = self
            .store
            .transition(&record.id, &[VmStatus::Creating], VmStatus::Error)
            .await
        {
            warn!(vm_id = %record.id, error = %e, "failed to mark vm as error");
        }
    }

    pub async fn start(&self, vm_id: &str) -> Result<VmRecord, VmError> {
        let vm = self.get_record(vm_id).await?;
        if vm.status == VmStatus::Running {
            return Ok(vm);
        }
        require(&vm, &[VmStatus::Stopped, VmStatus::Error], "start")?;

        info!(vm_id = %vm_id, name = %vm.name, "starting vm");
        let started = match self.hypervisor.is_active(&vm.name).await {
            Ok(true) => {
                warn!(vm_id = %vm_id, "domain already active");
                Ok(())
            }
            Ok(false) => self.hypervisor.start(&vm.name).await,
            Err(e) => Err(e),
        };

        if let Err(e) = started {
            error!(vm_id = %vm_id, error = %e, "failed to start vm");
            if let Err(se) = self
                .store
                .transition(vm_id, &[VmStatus::Stopped, VmStatus::Error], VmStatus::Error)
                .await
            {
                warn!(vm_id = %vm_id, error = %se, "failed to mark vm as error");
            }
            return Err(VmError::Hypervisor(e));
        }

        let vm = self
            .set_status(vm_id, &[VmStatus::Stopped, VmStatus::Error], VmStatus::Running)
            .await?;
        self.publish_display(&vm).await;
        Ok(vm)
    }

    /// Stop a VM. A stopped VM is left alone without touching the hypervisor.
    pub async fn stop(&self, vm_id: &str, force: bool) -> Result<VmRecord, VmError> {
        let vm = self.get_record(vm_id).await?;
        if vm.status == VmStatus::Stopped {
            return Ok(vm);
        }
        require(&vm, &[VmStatus::Running, VmStatus::Paused], "stop")?;

        if let Some(port) = vm.display_port {
            self.proxies.stop_for_display(port).await;
        }

        info!(vm_id = %vm_id, name = %vm.name, force, "stopping vm");
        let result = if force {
            self.hypervisor.destroy(&vm.name).await
        } else {
            self.hypervisor.shutdown(&vm.name).await
        };
        result.map_err(|e| {
            error!(vm_id = %vm_id, error = %e, "failed to stop vm");
            VmError::Hypervisor(e)
        })?;

        self.set_status(vm_id, &[VmStatus::Running, VmStatus::Paused], VmStatus::Stopped)
            .await
    }

    /// Reboot a running VM. Status is not touched.
    pub async fn restart(&self, vm_id: &str) -> Result<VmRecord, VmError> {
        let vm = self.get_record(vm_id).await?;
        require(&vm, &[VmStatus::Running], "restart")?;

        info!(vm_id = %vm_id, name = %vm.name, "restarting vm");
        self.hypervisor.reboot(&vm.name).await.map_err(|e| {
            error!(vm_id = %vm_id, error = %e, "failed to restart vm");
            VmError::Hypervisor(e)
        })?;
        Ok(vm)
    }

    pub async fn pause(&self, vm_id: &str) -> Result<VmRecord, VmError> {
        let vm = self.get_record(vm_id).await?;
        require(&vm, &[VmStatus::Running], "pause")?;

        self.hypervisor.suspend(&vm.name).await.map_err(|e| {
            error!(vm_id = %vm_id, error = %e, "failed to pause vm");
            VmError::Hypervisor(e)
        })?;
        info!(vm_id = %vm_id, "vm paused");
        self.set_status(vm_id, &[VmStatus::Running], VmStatus::Paused)
            .await
    }

    pub async fn resume(&self, vm_id: &str) -> Result<VmRecord, VmError> {
        let vm = self.get_record(vm_id).await?;
        require(&vm, &[VmStatus::Paused], "resume")?;

        self.hypervisor.resume(&vm.name).await.map_err(|e| {
            error!(vm_id = %vm_id, error = %e, "failed to resume vm");
            VmError::Hypervisor(e)
        })?;
        info!(vm_id = %vm_id, "vm resumed");
        self.set_status(vm_id, &[VmStatus::Paused], VmStatus::Running)
            .await
    }

    /// Delete a VM: stop its proxy, tear the domain down, optionally remove
    /// the disk, then drop the record.
    ///
    /// A domain that is already gone counts as torn down. If teardown fails
    /// the record stays (in `error`) so the delete can be retried. A failed
    /// disk removal is only logged.
    pub async fn delete(&self, vm_id: &str, remove_disk: bool) -> Result<VmRecord, VmError> {
        let vm = self.get_record(vm_id).await?;
        let vm = self.set_status(vm_id, &[vm.status], VmStatus::Deleting).await?;

        if let Some(port) = vm.display_port {
            self.proxies.stop_for_display(port).await;
        }

        info!(vm_id = %vm_id, name = %vm.name, remove_disk, "deleting vm");
        let described_disk = match self.teardown(&vm.name).await {
            Ok(path) => path,
            Err(e) => {
                error!(vm_id = %vm_id, error = %e, "failed to tear down domain");
                if let Err(se) = self
                    .store
                    .transition(vm_id, &[VmStatus::Deleting], VmStatus::Error)
                    .await
                {
                    warn!(vm_id = %vm_id, error = %se, "failed to mark vm as error");
                }
                return Err(VmError::Hypervisor(e));
            }
        };

        if remove_disk {
            if let Some(path) = described_disk.or_else(|| vm.disk_path.clone()) {
                if let Err(e) = disk::remove_disk(&path).await {
                    warn!(vm_id = %vm_id, path = %path, error = %e, "failed to remove vm disk");
                }
            }
        }

        if let Some(port) = vm.display_port {
            self.ports.release(port);
        }
        if let Some(mac) = &vm.mac_address {
            self.macs.release(mac);
        }
        self.store.remove_vm(vm_id).await.map_err(VmError::Store)?;

        info!(vm_id = %vm_id, "vm deleted");
        Ok(vm)
    }

    /// Force off and undefine a domain, returning the disk path it used.
    async fn teardown(&self, name: &str) -> Result<Option<String>, HypervisorError> {
        if self.hypervisor.lookup(name).await?.is_none() {
            warn!(domain = %name, "domain already gone");
            return Ok(None);
        }

        let disk_path = self.describe_domain(name).await.and_then(|d| d.disk_path);

        if self.hypervisor.is_active(name).await? {
            ignore_not_found(self.hypervisor.destroy(name).await)?;
        }
        ignore_not_found(self.hypervisor.undefine(name).await)?;
        Ok(disk_path)
    }

    /// Live descriptor of a domain; `None` (logged) when it cannot be read.
    async fn describe_domain(&self, name: &str) -> Option<DomainDescription> {
        let xml = match self.hypervisor.describe(name).await {
            Ok(xml) => xml,
            Err(e) => {
                warn!(domain = %name, error = %e, "failed to describe domain");
                return None;
            }
        };
        match DomainDescription::parse(&xml) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!(domain = %name, error = %e, "unreadable domain descriptor");
                None
            }
        }
    }

    /// Hypervisor view of a VM.
    pub async fn status(&self, vm_id: &str) -> Result<VmStatusReport, VmError> {
        let vm = self.get_record(vm_id).await?;
        let (state, _reason) = self
            .hypervisor
            .state(&vm.name)
            .await
            .map_err(VmError::Hypervisor)?;

        let display_port = self
            .describe_domain(&vm.name)
            .await
            .and_then(|d| d.display_port)
            .or(vm.display_port);

        let ip_address = match self.hypervisor.interface_addresses(&vm.name).await {
            Ok(addrs) => addrs.into_iter().next(),
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "failed to query interface addresses");
                None
            }
        };

        Ok(VmStatusReport {
            state: state.to_string(),
            display_port,
            ip_address,
            is_active: state.is_active(),
        })
    }

    pub async fn metrics(&self, vm_id: &str) -> Result<VmMetrics, VmError> {
        let vm = self.get_record(vm_id).await?;
        if !self
            .hypervisor
            .is_active(&vm.name)
            .await
            .map_err(VmError::Hypervisor)?
        {
            return Ok(VmMetrics::default());
        }

        let cpu = self
            .hypervisor
            .cpu_stats(&vm.name)
            .await
            .map_err(VmError::Hypervisor)?;
        let memory = self
            .hypervisor
            .memory_stats(&vm.name)
            .await
            .map_err(VmError::Hypervisor)?;

        let desc = self.describe_domain(&vm.name).await.unwrap_or_default();

        let mut metrics = VmMetrics {
            cpu_usage: cpu.cpu_time_ns,
            memory_usage: memory.actual_kib,
            memory_available: memory.usable_kib,
            ..VmMetrics::default()
        };

        // block and interface counters are optional, as with an unplugged NIC
        let disk_dev = desc.disk_target.as_deref().unwrap_or("vda");
        match self.hypervisor.block_stats(&vm.name, disk_dev).await {
            Ok(block) => {
                metrics.disk_read = block.read_bytes;
                metrics.disk_write = block.write_bytes;
            }
            Err(e) => warn!(vm_id = %vm_id, error = %e, "no block stats"),
        }
        if let Some(dev) = &desc.interface_dev {
            match self.hypervisor.interface_stats(&vm.name, dev).await {
                Ok(net) => {
                    metrics.network_rx = net.rx_bytes;
                    metrics.network_tx = net.tx_bytes;
                }
                Err(e) => warn!(vm_id = %vm_id, error = %e, "no interface stats"),
            }
        }

        Ok(metrics)
    }

    /// Publish a running VM's display and hand out the credentials.
    pub async fn open_console(&self, vm_id: &str) -> Result<ConsoleAccess, VmError> {
        let vm = self.get_record(vm_id).await?;
        require(&vm, &[VmStatus::Running], "open a console on")?;

        let (Some(port), Some(password)) = (vm.display_port, vm.display_password) else {
            return Err(VmError::InvalidArgument(format!(
                "vm {} has no display channel",
                vm_id
            )));
        };
        let proxy_port = self.proxies.ensure(port).await.map_err(VmError::Proxy)?;
        Ok(ConsoleAccess {
            proxy_port,
            display_password: password,
        })
    }

    async fn get_record(&self, vm_id: &str) -> Result<VmRecord, VmError> {
        self.store
            .get_vm(vm_id)
            .await
            .map_err(VmError::Store)?
            .ok_or_else(|| VmError::NotFound(vm_id.to_string()))
    }

    async fn set_status(
        &self,
        vm_id: &str,
        from: &[VmStatus],
        to: VmStatus,
    ) -> Result<VmRecord, VmError> {
        self.store
            .transition(vm_id, from, to)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => VmError::NotFound(id),
                StoreError::InvalidTransition { id, from, to } => VmError::InvalidTransition {
                    vm_id: id,
                    status: from,
                    action: transition_verb(to),
                },
                other => VmError::Store(other),
            })
    }

    /// Best effort: a running VM without a proxy is still running.
    async fn publish_display(&self, vm: &VmRecord) {
        let Some(port) = vm.display_port else {
            return;
        };
        match self.proxies.ensure(port).await {
            Ok(public_port) => info!(vm_id = %vm.id, public_port, "display published"),
            Err(e) => warn!(vm_id = %vm.id, error = %e, "failed to start display proxy"),
        }
    }
}

fn require(vm: &VmRecord, allowed: &[VmStatus], action: &'static str) -> Result<(), VmError> {
    if allowed.contains(&vm.status) {
        Ok(())
    } else {
        Err(VmError::InvalidTransition {
            vm_id: vm.id.clone(),
            status: vm.status,
            action,
        })
    }
}

fn transition_verb(to: VmStatus) -> &'static str {
    match to {
        VmStatus::Running => "run",
        VmStatus::Stopped => "stop",
        VmStatus::Paused => "pause",
        VmStatus::Deleting => "delete",
        VmStatus::Error => "fail",
        VmStatus::Creating => "create",
    }
}

fn ignore_not_found(result: Result<(), HypervisorError>) -> Result<(), HypervisorError> {
    match result {
        Err(HypervisorError::NotFound(_)) => Ok(()),
        other => other,
    }
}

fn validate_spec(spec: &CreateVmSpec) -> Result<(), VmError> {
    let name = &spec.name;
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(VmError::InvalidArgument(format!(
            "vm name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    if name.starts_with(['.', '-'])
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(VmError::InvalidArgument(format!("invalid vm name: {}", name)));
    }
    if spec.cpu_cores == 0 || spec.memory_mb == 0 || spec.disk_gb == 0 {
        return Err(VmError::InvalidArgument(
            "cpu_cores, memory_mb and disk_gb must be positive".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug)]
pub enum VmError {
    NotFound(String),
    PermissionDenied(String),
    InvalidArgument(String),
    InvalidTransition {
        vm_id: String,
        status: VmStatus,
        action: &'static str,
    },
    NameConflict(String),
    TemplateNotFound(String),
    Quota(QuotaError),
    Ports(PortError),
    Mac(MacError),
    Disk(DiskError),
    Descriptor(DomainXmlError),
    Hypervisor(HypervisorError),
    Proxy(ProxyError),
    Store(StoreError),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::NotFound(id) => write!(f, "vm not found: {}", id),
            VmError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            VmError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            VmError::InvalidTransition {
                vm_id,
                status,
                action,
            } => write!(
                f,
                "invalid transition: cannot {} vm {} while {}",
                action, vm_id, status
            ),
            VmError::NameConflict(name) => write!(f, "vm name already in use: {}", name),
            VmError::TemplateNotFound(id) => write!(f, "template not found: {}", id),
            VmError::Quota(e) => write!(f, "{}", e),
            VmError::Ports(e) => write!(f, "{}", e),
            VmError::Mac(e) => write!(f, "{}", e),
            VmError::Disk(e) => write!(f, "{}", e),
            VmError::Descriptor(e) => write!(f, "{}", e),
            VmError::Hypervisor(e) => write!(f, "{}", e),
            VmError::Proxy(e) => write!(f, "{}", e),
            VmError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for VmError {}
