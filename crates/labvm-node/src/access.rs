use crate::store::VmRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

/// The authenticated caller, as vouched for by the web layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    /// `None` for users without an assigned role.
    pub role: Option<Role>,
    pub is_staff: bool,
    pub teaching_course_ids: Vec<String>,
    pub enrolled_course_ids: Vec<String>,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.is_staff || self.role == Some(Role::Admin)
    }

    fn teaches(&self, course_id: &str) -> bool {
        self.role == Some(Role::Teacher) && self.teaching_course_ids.iter().any(|c| c == course_id)
    }

    /// Admins and staff, the owner, or a teacher of the VM's course.
    pub fn can_operate(&self, vm: &VmRecord) -> bool {
        self.is_admin()
            || vm.owner_id == self.user_id
            || vm.course_id.as_deref().is_some_and(|c| self.teaches(c))
    }

    /// Visibility follows the same rule as operating.
    pub fn can_view(&self, vm: &VmRecord) -> bool {
        self.can_operate(vm)
    }

    /// Creating inside a course requires teaching or attending it.
    pub fn can_create_in_course(&self, course_id: &str) -> bool {
        self.is_staff
            || self.teaching_course_ids.iter().any(|c| c == course_id)
            || self.enrolled_course_ids.iter().any(|c| c == course_id)
    }
}

#[cfg(test)]
pub fn actor(user_id: &str, role: Role) -> Actor {
    Actor {
        user_id: user_id.to_string(),
        role: Some(role),
        is_staff: false,
        teaching_course_ids: Vec::new(),
        enrolled_course_ids: Vec::new(),
    }
}
