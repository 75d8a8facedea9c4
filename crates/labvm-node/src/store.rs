use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Lifecycle status of a VM record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Creating,
    Stopped,
    Running,
    Paused,
    Error,
    Deleting,
}

impl VmStatus {
    /// Whether the lifecycle state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: VmStatus) -> bool {
        use VmStatus::*;
        matches!(
            (self, next),
            (Creating, Stopped | Running | Error)
                | (Stopped | Error, Running | Error)
                | (Running | Paused, Stopped)
                | (Running, Paused)
                | (Paused, Running)
                | (Creating | Stopped | Running | Paused | Error, Deleting)
                | (Deleting, Error)
        )
    }

    /// States owned by an in-flight create or delete.
    pub fn is_transient(self) -> bool {
        matches!(self, VmStatus::Creating | VmStatus::Deleting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Creating => "creating",
            VmStatus::Stopped => "stopped",
            VmStatus::Running => "running",
            VmStatus::Paused => "paused",
            VmStatus::Error => "error",
            VmStatus::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One virtual machine as the node knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    /// Set once the hypervisor has defined the domain.
    pub uuid: Option<String>,
    pub owner_id: String,
    pub course_id: Option<String>,
    pub template_id: Option<String>,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub display_port: Option<u16>,
    pub display_password: Option<String>,
    pub disk_path: Option<String>,
    pub status: VmStatus,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Source image copied for every VM built from this template.
    pub disk_path: String,
}

/// Per-user resource ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub vm_limit: u32,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            cpu_cores: 4,
            memory_mb: 4096,
            disk_gb: 100,
            vm_limit: 5,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persistence for VM records, templates and quotas.
///
/// Status writes go through [`RecordStore::transition`], which checks the
/// current status and applies the change under one lock.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Fails if the id or name is already taken.
    async fn insert_vm(&self, record: VmRecord) -> Result<(), StoreError>;
    async fn get_vm(&self, id: &str) -> Result<Option<VmRecord>, StoreError>;
    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError>;
    async fn vms_for_owner(&self, owner_id: &str) -> Result<Vec<VmRecord>, StoreError>;
    /// Replace the fields of an existing record. The stored status is kept;
    /// status only moves through `transition` and `observe`.
    async fn save_vm(&self, record: VmRecord) -> Result<(), StoreError>;
    /// Move a record to `to` if its current status is one of `from`.
    async fn transition(
        &self,
        id: &str,
        from: &[VmStatus],
        to: VmStatus,
    ) -> Result<VmRecord, StoreError>;
    /// Overwrite status and IP with hypervisor-observed values. Records in a
    /// transient state are left alone; returns whether anything was written.
    async fn observe(
        &self,
        id: &str,
        status: VmStatus,
        ip_address: Option<String>,
    ) -> Result<bool, StoreError>;
    async fn remove_vm(&self, id: &str) -> Result<Option<VmRecord>, StoreError>;

    async fn put_template(&self, template: Template) -> Result<(), StoreError>;
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError>;

    async fn set_quota(&self, user_id: &str, quota: Quota) -> Result<(), StoreError>;
    async fn get_quota(&self, user_id: &str) -> Result<Option<Quota>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    vms: HashMap<String, VmRecord>,
    templates: HashMap<String, Template>,
    quotas: HashMap<String, Quota>,
}

/// In-memory store, optionally snapshotted to a JSON file after every write.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store that lives only as long as the process.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            path: None,
        }
    }

    /// Load the snapshot at `path` (if present) and persist to it from now on.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::Serde(format!("failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        info!(path = %path.display(), vms = state.vms.len(), "record store loaded");
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    /// Write the snapshot via a temp file and rename so a crash never leaves
    /// a torn file. Called with the write lock held.
    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(format!("failed to create {}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Serde(format!("failed to serialize store: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| StoreError::Io(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            StoreError::Io(format!("failed to rename into {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_vm(&self, record: VmRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.vms.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("vm id {} already exists", record.id)));
        }
        if state.vms.values().any(|vm| vm.name == record.name) {
            return Err(StoreError::Conflict(format!(
                "vm name {} already exists",
                record.name
            )));
        }
        state.vms.insert(record.id.clone(), record);
        self.persist(&state).await
    }

    async fn get_vm(&self, id: &str) -> Result<Option<VmRecord>, StoreError> {
        Ok(self.state.read().await.vms.get(id).cloned())
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError> {
        let mut vms: Vec<VmRecord> = self.state.read().await.vms.values().cloned().collect();
        vms.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(vms)
    }

    async fn vms_for_owner(&self, owner_id: &str) -> Result<Vec<VmRecord>, StoreError> {
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.owner_id == owner_id)
            .collect())
    }

    async fn save_vm(&self, mut record: VmRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let Some(current) = state.vms.get(&record.id) else {
            return Err(StoreError::NotFound(record.id));
        };
        record.status = current.status;
        record.updated_at_ms = now_ms();
        state.vms.insert(record.id.clone(), record);
        self.persist(&state).await
    }

    async fn transition(
        &self,
        id: &str,
        from: &[VmStatus],
        to: VmStatus,
    ) -> Result<VmRecord, StoreError> {
        let mut state = self.state.write().await;
        let vm = state
            .vms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !from.contains(&vm.status) || !vm.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: vm.status,
                to,
            });
        }
        vm.status = to;
        vm.updated_at_ms = now_ms();
        let updated = vm.clone();
        self.persist(&state).await?;
        Ok(updated)
    }

    async fn observe(
        &self,
        id: &str,
        status: VmStatus,
        ip_address: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let vm = state
            .vms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if vm.status.is_transient() {
            return Ok(false);
        }
        if vm.status == status && vm.ip_address == ip_address {
            return Ok(false);
        }
        if vm.status != status {
            warn!(vm_id = %id, from = %vm.status, to = %status, "correcting status drift");
        }
        vm.status = status;
        vm.ip_address = ip_address;
        vm.updated_at_ms = now_ms();
        self.persist(&state).await?;
        Ok(true)
    }

    async fn remove_vm(&self, id: &str) -> Result<Option<VmRecord>, StoreError> {
        let mut state = self.state.write().await;
        let removed = state.vms.remove(id);
        if removed.is_some() {
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    async fn put_template(&self, template: Template) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.templates.insert(template.id.clone(), template);
        self.persist(&state).await
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        Ok(self.state.read().await.templates.get(id).cloned())
    }

    async fn set_quota(&self, user_id: &str, quota: Quota) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.quotas.insert(user_id.to_string(), quota);
        self.persist(&state).await
    }

    async fn get_quota(&self, user_id: &str) -> Result<Option<Quota>, StoreError> {
        Ok(self.state.read().await.quotas.get(user_id).copied())
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Conflict(String),
    InvalidTransition {
        id: String,
        from: VmStatus,
        to: VmStatus,
    },
    Io(String),
    Serde(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "vm not found: {}", id),
            StoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            StoreError::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {}: {} -> {}", id, from, to)
            }
            StoreError::Io(msg) => write!(f, "store I/O error: {}", msg),
            StoreError::Serde(msg) => write!(f, "store serialization error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
pub fn sample_record(id: &str, name: &str, owner: &str, status: VmStatus) -> VmRecord {
    VmRecord {
        id: id.to_string(),
        name: name.to_string(),
        uuid: None,
        owner_id: owner.to_string(),
        course_id: None,
        template_id: Some("base".to_string()),
        cpu_cores: 1,
        memory_mb: 1024,
        disk_gb: 10,
        mac_address: None,
        ip_address: None,
        display_port: None,
        display_password: None,
        disk_path: None,
        status,
        created_at_ms: now_ms(),
        updated_at_ms: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_transitions() {
        use VmStatus::*;
        assert!(Creating.can_transition_to(Stopped));
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Error));
        assert!(Stopped.can_transition_to(Running));
        assert!(Error.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Paused.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Stopped.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Error));
    }

    #[test]
    fn undeclared_transitions() {
        use VmStatus::*;
        assert!(!Stopped.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Creating.can_transition_to(Paused));
        assert!(!Error.can_transition_to(Stopped));
        assert!(!Deleting.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Creating));
        assert!(!Deleting.can_transition_to(Deleting));
    }

    #[tokio::test]
    async fn second_delete_transition_is_rejected() {
        let store = MemoryStore::new();
        store
            .insert_vm(sample_record("vm_1", "lab01", "alice", VmStatus::Running))
            .await
            .unwrap();
        store
            .transition("vm_1", &[VmStatus::Running], VmStatus::Deleting)
            .await
            .unwrap();

        let err = store
            .transition("vm_1", &[VmStatus::Deleting], VmStatus::Deleting)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: VmStatus::Deleting,
                to: VmStatus::Deleting,
                ..
            }
        ));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&VmStatus::Running).unwrap(), "\"running\"");
        let s: VmStatus = serde_json::from_str("\"deleting\"").unwrap();
        assert_eq!(s, VmStatus::Deleting);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_name() {
        let store = MemoryStore::new();
        store
            .insert_vm(sample_record("vm_1", "lab01", "alice", VmStatus::Stopped))
            .await
            .unwrap();
        let err = store
            .insert_vm(sample_record("vm_2", "lab01", "bob", VmStatus::Stopped))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn transition_checks_current_status() {
        let store = MemoryStore::new();
        store
            .insert_vm(sample_record("vm_1", "lab01", "alice", VmStatus::Stopped))
            .await
            .unwrap();

        let err = store
            .transition("vm_1", &[VmStatus::Running], VmStatus::Paused)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: VmStatus::Stopped,
                to: VmStatus::Paused,
                ..
            }
        ));

        let vm = store
            .transition("vm_1", &[VmStatus::Stopped], VmStatus::Running)
            .await
            .unwrap();
        assert_eq!(vm.status, VmStatus::Running);
    }

    #[tokio::test]
    async fn save_keeps_stored_status() {
        let store = MemoryStore::new();
        store
            .insert_vm(sample_record("vm_1", "lab01", "alice", VmStatus::Creating))
            .await
            .unwrap();
        store
            .transition("vm_1", &[VmStatus::Creating], VmStatus::Deleting)
            .await
            .unwrap();

        let mut stale = sample_record("vm_1", "lab01", "alice", VmStatus::Creating);
        stale.display_port = Some(5900);
        store.save_vm(stale).await.unwrap();

        let vm = store.get_vm("vm_1").await.unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Deleting);
        assert_eq!(vm.display_port, Some(5900));

        let missing = sample_record("vm_2", "lab02", "alice", VmStatus::Stopped);
        assert!(matches!(store.save_vm(missing).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn transition_missing_vm() {
        let store = MemoryStore::new();
        let err = store
            .transition("vm_x", &[VmStatus::Stopped], VmStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn observe_skips_transient_records() {
        let store = MemoryStore::new();
        store
            .insert_vm(sample_record("vm_1", "lab01", "alice", VmStatus::Creating))
            .await
            .unwrap();
        store
            .insert_vm(sample_record("vm_2", "lab02", "alice", VmStatus::Running))
            .await
            .unwrap();

        assert!(!store.observe("vm_1", VmStatus::Error, None).await.unwrap());
        assert!(store
            .observe("vm_2", VmStatus::Running, Some("10.0.0.5".to_string()))
            .await
            .unwrap());
        // unchanged values write nothing
        assert!(!store
            .observe("vm_2", VmStatus::Running, Some("10.0.0.5".to_string()))
            .await
            .unwrap());

        let vm = store.get_vm("vm_2").await.unwrap().unwrap();
        assert_eq!(vm.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(
            store.get_vm("vm_1").await.unwrap().unwrap().status,
            VmStatus::Creating
        );
    }

    #[tokio::test]
    async fn vms_for_owner_filters() {
        let store = MemoryStore::new();
        for (id, name, owner) in [("vm_1", "a", "alice"), ("vm_2", "b", "bob"), ("vm_3", "c", "alice")] {
            store
                .insert_vm(sample_record(id, name, owner, VmStatus::Stopped))
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .vms_for_owner("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|vm| vm.id)
            .collect();
        assert_eq!(ids, vec!["vm_1".to_string(), "vm_3".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data").join("state.json");

        {
            let store = MemoryStore::open(&path).await.unwrap();
            store
                .insert_vm(sample_record("vm_1", "lab01", "alice", VmStatus::Stopped))
                .await
                .unwrap();
            store
                .put_template(Template {
                    id: "base".to_string(),
                    name: "Ubuntu".to_string(),
                    disk_path: "/templates/base.qcow2".to_string(),
                })
                .await
                .unwrap();
            store.set_quota("alice", Quota::default()).await.unwrap();
        }

        let store = MemoryStore::open(&path).await.unwrap();
        assert_eq!(store.get_vm("vm_1").await.unwrap().unwrap().name, "lab01");
        assert_eq!(
            store.get_template("base").await.unwrap().unwrap().disk_path,
            "/templates/base.qcow2"
        );
        assert_eq!(store.get_quota("alice").await.unwrap(), Some(Quota::default()));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            MemoryStore::open(&path).await,
            Err(StoreError::Serde(_))
        ));
    }

    #[tokio::test]
    async fn remove_returns_record_once() {
        let store = MemoryStore::new();
        store
            .insert_vm(sample_record("vm_1", "lab01", "alice", VmStatus::Stopped))
            .await
            .unwrap();
        assert!(store.remove_vm("vm_1").await.unwrap().is_some());
        assert!(store.remove_vm("vm_1").await.unwrap().is_none());
    }

    #[test]
    fn quota_defaults() {
        let q = Quota::default();
        assert_eq!((q.cpu_cores, q.memory_mb, q.disk_gb, q.vm_limit), (4, 4096, 100, 5));
    }
}
