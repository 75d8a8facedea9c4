use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::access::{Actor, Role};
use crate::health::{self, HostMonitor};
use crate::id;
use crate::proto;
use crate::reconcile::Reconciler;
use crate::store::{Quota, Template, VmRecord};
use crate::tasks::{TaskRecord, TaskStatus};
use crate::vm::{CreateVmSpec, OperationResult, VmError, VmManager};

/// gRPC server implementing the Node service for the lab web application.
pub struct NodeService {
    manager: Arc<VmManager>,
    reconciler: Arc<Reconciler>,
    monitor: HostMonitor,
}

impl NodeService {
    pub fn new(manager: Arc<VmManager>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            manager,
            reconciler,
            monitor: HostMonitor::new(),
        }
    }

    async fn authorize(
        &self,
        actor: Option<proto::Actor>,
        vm_id: &str,
    ) -> Result<VmRecord, Status> {
        let actor = actor_from_proto(actor)?;
        id::validate_id(vm_id, id::VM_PREFIX).map_err(Status::invalid_argument)?;
        self.manager
            .authorize(&actor, vm_id)
            .await
            .map_err(|e| status_for(&e))
    }

    /// Run a lifecycle operation on a VM the actor may operate. Access
    /// failures are gRPC errors; the operation's own outcome is reported in
    /// the result.
    async fn lifecycle<F, Fut>(
        &self,
        actor: Option<proto::Actor>,
        vm_id: &str,
        op: F,
    ) -> Result<Response<proto::OperationResult>, Status>
    where
        F: FnOnce(Arc<VmManager>, String) -> Fut,
        Fut: std::future::Future<Output = Result<VmRecord, VmError>>,
    {
        self.authorize(actor, vm_id).await?;
        let result = op(Arc::clone(&self.manager), vm_id.to_string()).await;
        Ok(Response::new(result_to_proto(OperationResult::from_result(
            vm_id, &result,
        ))))
    }
}

#[tonic::async_trait]
impl proto::node_server::Node for NodeService {
    async fn create_vm(
        &self,
        request: Request<proto::CreateVmRequest>,
    ) -> Result<Response<proto::CreateVmResponse>, Status> {
        let req = request.into_inner();
        let actor = actor_from_proto(req.actor)?;
        let ticket = self
            .manager
            .submit_create(
                &actor,
                CreateVmSpec {
                    name: req.name,
                    template_id: req.template_id,
                    course_id: req.course_id,
                    cpu_cores: req.cpu_cores,
                    memory_mb: req.memory_mb,
                    disk_gb: req.disk_gb,
                },
            )
            .await
            .map_err(|e| status_for(&e))?;

        Ok(Response::new(proto::CreateVmResponse {
            vm_id: ticket.vm_id,
            task_id: ticket.task_id,
        }))
    }

    async fn start_vm(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::OperationResult>, Status> {
        let req = request.into_inner();
        self.lifecycle(req.actor, &req.vm_id, |m, id| async move { m.start(&id).await })
            .await
    }

    async fn stop_vm(
        &self,
        request: Request<proto::StopVmRequest>,
    ) -> Result<Response<proto::OperationResult>, Status> {
        let req = request.into_inner();
        let force = req.force;
        self.lifecycle(req.actor, &req.vm_id, |m, id| async move {
            m.stop(&id, force).await
        })
        .await
    }

    async fn restart_vm(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::OperationResult>, Status> {
        let req = request.into_inner();
        self.lifecycle(req.actor, &req.vm_id, |m, id| async move { m.restart(&id).await })
            .await
    }

    async fn pause_vm(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::OperationResult>, Status> {
        let req = request.into_inner();
        self.lifecycle(req.actor, &req.vm_id, |m, id| async move { m.pause(&id).await })
            .await
    }

    async fn resume_vm(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::OperationResult>, Status> {
        let req = request.into_inner();
        self.lifecycle(req.actor, &req.vm_id, |m, id| async move { m.resume(&id).await })
            .await
    }

    async fn delete_vm(
        &self,
        request: Request<proto::DeleteVmRequest>,
    ) -> Result<Response<proto::OperationResult>, Status> {
        let req = request.into_inner();
        let remove_disk = req.remove_disk;
        self.lifecycle(req.actor, &req.vm_id, |m, id| async move {
            m.delete(&id, remove_disk).await
        })
        .await
    }

    async fn get_vm(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::VirtualMachine>, Status> {
        let req = request.into_inner();
        let vm = self.authorize(req.actor, &req.vm_id).await?;
        Ok(Response::new(vm_to_proto(&vm)))
    }

    async fn list_vms(
        &self,
        request: Request<proto::ListVmsRequest>,
    ) -> Result<Response<proto::ListVmsResponse>, Status> {
        let req = request.into_inner();
        let actor = actor_from_proto(req.actor)?;
        let vms = self
            .manager
            .list(&actor, req.course_id.as_deref())
            .await
            .map_err(|e| status_for(&e))?;
        Ok(Response::new(proto::ListVmsResponse {
            vms: vms.iter().map(vm_to_proto).collect(),
        }))
    }

    async fn get_vm_status(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::VmStatus>, Status> {
        let req = request.into_inner();
        self.authorize(req.actor, &req.vm_id).await?;
        let report = self
            .manager
            .status(&req.vm_id)
            .await
            .map_err(|e| status_for(&e))?;
        Ok(Response::new(proto::VmStatus {
            state: report.state,
            display_port: report.display_port.map(u32::from),
            ip_address: report.ip_address,
            is_active: report.is_active,
        }))
    }

    async fn get_vm_metrics(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::VmMetrics>, Status> {
        let req = request.into_inner();
        self.authorize(req.actor, &req.vm_id).await?;
        let m = self
            .manager
            .metrics(&req.vm_id)
            .await
            .map_err(|e| status_for(&e))?;
        Ok(Response::new(proto::VmMetrics {
            cpu_usage: m.cpu_usage,
            memory_usage: m.memory_usage,
            memory_available: m.memory_available,
            disk_read: m.disk_read,
            disk_write: m.disk_write,
            network_rx: m.network_rx,
            network_tx: m.network_tx,
        }))
    }

    async fn open_console(
        &self,
        request: Request<proto::VmRequest>,
    ) -> Result<Response<proto::ConsoleAccess>, Status> {
        let req = request.into_inner();
        self.authorize(req.actor, &req.vm_id).await?;
        let console = self
            .manager
            .open_console(&req.vm_id)
            .await
            .map_err(|e| status_for(&e))?;
        Ok(Response::new(proto::ConsoleAccess {
            proxy_port: u32::from(console.proxy_port),
            display_password: console.display_password,
        }))
    }

    async fn get_task(
        &self,
        request: Request<proto::GetTaskRequest>,
    ) -> Result<Response<proto::Task>, Status> {
        let req = request.into_inner();
        id::validate_id(&req.task_id, id::TASK_PREFIX).map_err(Status::invalid_argument)?;
        let task = self
            .manager
            .tasks()
            .get(&req.task_id)
            .await
            .ok_or_else(|| Status::not_found(format!("task not found: {}", req.task_id)))?;
        Ok(Response::new(task_to_proto(task)))
    }

    async fn sync_status(
        &self,
        request: Request<proto::SyncStatusRequest>,
    ) -> Result<Response<proto::SyncStatusResponse>, Status> {
        let actor = actor_from_proto(request.into_inner().actor)?;
        require_admin(&actor)?;
        let report = self
            .reconciler
            .sweep()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Response::new(proto::SyncStatusResponse {
            synced: report.synced,
            missing: report.missing,
            failed: report.failed,
        }))
    }

    async fn register_template(
        &self,
        request: Request<proto::RegisterTemplateRequest>,
    ) -> Result<Response<proto::Template>, Status> {
        let req = request.into_inner();
        let actor = actor_from_proto(req.actor)?;
        require_admin(&actor)?;
        if req.template_id.is_empty() || req.disk_path.is_empty() {
            return Err(Status::invalid_argument(
                "template_id and disk_path are required",
            ));
        }

        let template = Template {
            id: req.template_id,
            name: req.name,
            disk_path: req.disk_path,
        };
        self.manager
            .store()
            .put_template(template.clone())
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        info!(template_id = %template.id, disk_path = %template.disk_path, "template registered");

        Ok(Response::new(proto::Template {
            template_id: template.id,
            name: template.name,
            disk_path: template.disk_path,
        }))
    }

    async fn set_quota(
        &self,
        request: Request<proto::SetQuotaRequest>,
    ) -> Result<Response<proto::Quota>, Status> {
        let req = request.into_inner();
        let actor = actor_from_proto(req.actor)?;
        require_admin(&actor)?;
        let q = req
            .quota
            .ok_or_else(|| Status::invalid_argument("quota is required"))?;
        let quota = Quota {
            cpu_cores: q.cpu_cores,
            memory_mb: q.memory_mb,
            disk_gb: q.disk_gb,
            vm_limit: q.vm_limit,
        };
        self.manager
            .store()
            .set_quota(&req.user_id, quota)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        info!(user_id = %req.user_id, ?quota, "quota updated");
        Ok(Response::new(quota_to_proto(quota)))
    }

    async fn get_quota(
        &self,
        request: Request<proto::GetQuotaRequest>,
    ) -> Result<Response<proto::Quota>, Status> {
        let req = request.into_inner();
        let actor = actor_from_proto(req.actor)?;
        if actor.user_id != req.user_id {
            require_admin(&actor)?;
        }
        let quota = self
            .manager
            .store()
            .get_quota(&req.user_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .ok_or_else(|| Status::not_found(format!("no quota for user {}", req.user_id)))?;
        Ok(Response::new(quota_to_proto(quota)))
    }

    async fn health(
        &self,
        _request: Request<proto::HealthRequest>,
    ) -> Result<Response<proto::HealthResponse>, Status> {
        let report = health::check(&self.manager, &self.monitor).await;
        let host = report.host;
        Ok(Response::new(proto::HealthResponse {
            hypervisor_alive: report.hypervisor_alive,
            active_proxies: report.active_proxies as u32,
            metrics: Some(proto::NodeMetrics {
                cpu_percent: host.cpu_percent,
                memory_used_bytes: host.memory_used_bytes,
                memory_total_bytes: host.memory_total_bytes,
                disk_used_bytes: host.disk_used_bytes,
                disk_total_bytes: host.disk_total_bytes,
                load_avg_1: host.load_avg_1,
                load_avg_5: host.load_avg_5,
                load_avg_15: host.load_avg_15,
            }),
        }))
    }
}

// --- Type conversions ---

fn actor_from_proto(actor: Option<proto::Actor>) -> Result<Actor, Status> {
    let actor = actor.ok_or_else(|| Status::unauthenticated("actor is required"))?;
    if actor.user_id.is_empty() {
        return Err(Status::unauthenticated("actor user_id is required"));
    }
    let role = match proto::Role::try_from(actor.role) {
        Ok(proto::Role::Student) => Some(Role::Student),
        Ok(proto::Role::Teacher) => Some(Role::Teacher),
        Ok(proto::Role::Admin) => Some(Role::Admin),
        Ok(proto::Role::Unspecified) | Err(_) => None,
    };
    Ok(Actor {
        user_id: actor.user_id,
        role,
        is_staff: actor.is_staff,
        teaching_course_ids: actor.teaching_course_ids,
        enrolled_course_ids: actor.enrolled_course_ids,
    })
}

fn require_admin(actor: &Actor) -> Result<(), Status> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(Status::permission_denied("administrator role required"))
    }
}

pub fn status_for(e: &VmError) -> Status {
    let msg = e.to_string();
    match e {
        VmError::NotFound(_) | VmError::TemplateNotFound(_) => Status::not_found(msg),
        VmError::PermissionDenied(_) => Status::permission_denied(msg),
        VmError::InvalidArgument(_) => Status::invalid_argument(msg),
        VmError::NameConflict(_) => Status::already_exists(msg),
        VmError::InvalidTransition { .. } => Status::failed_precondition(msg),
        VmError::Quota(_) | VmError::Ports(_) | VmError::Mac(_) => {
            Status::resource_exhausted(msg)
        }
        VmError::Hypervisor(_) | VmError::Proxy(_) => Status::unavailable(msg),
        VmError::Disk(_) | VmError::Descriptor(_) | VmError::Store(_) => Status::internal(msg),
    }
}

fn vm_to_proto(vm: &VmRecord) -> proto::VirtualMachine {
    proto::VirtualMachine {
        vm_id: vm.id.clone(),
        name: vm.name.clone(),
        uuid: vm.uuid.clone(),
        owner_id: vm.owner_id.clone(),
        course_id: vm.course_id.clone(),
        template_id: vm.template_id.clone(),
        cpu_cores: vm.cpu_cores,
        memory_mb: vm.memory_mb,
        disk_gb: vm.disk_gb,
        status: vm.status.to_string(),
        mac_address: vm.mac_address.clone(),
        ip_address: vm.ip_address.clone(),
        display_port: vm.display_port.map(u32::from),
        created_at_ms: vm.created_at_ms,
        updated_at_ms: vm.updated_at_ms,
    }
}

fn result_to_proto(result: OperationResult) -> proto::OperationResult {
    proto::OperationResult {
        success: result.success,
        vm_id: result.vm_id,
        error: result.error,
    }
}

fn task_to_proto(task: TaskRecord) -> proto::Task {
    let status = match task.status {
        TaskStatus::Pending => proto::TaskStatus::Pending,
        TaskStatus::Running => proto::TaskStatus::Running,
        TaskStatus::Succeeded => proto::TaskStatus::Succeeded,
        TaskStatus::Failed => proto::TaskStatus::Failed,
    };
    proto::Task {
        task_id: task.task_id,
        name: task.name,
        vm_id: task.vm_id,
        status: status as i32,
        result: task.result.map(result_to_proto),
        created_at_ms: task.created_at_ms,
        completed_at_ms: task.completed_at_ms,
    }
}

fn quota_to_proto(quota: Quota) -> proto::Quota {
    proto::Quota {
        cpu_cores: quota.cpu_cores,
        memory_mb: quota.memory_mb,
        disk_gb: quota.disk_gb,
        vm_limit: quota.vm_limit,
    }
}
