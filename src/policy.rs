use crate::errors::{AppError, AppResult};
use crate::models::{Notebook, NotebookMember, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_edit_structure: bool,
    pub can_manage_members: bool,
    pub can_manage_notebook: bool,
    pub can_complete: bool,
    pub can_comment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    EditStructure,
    ManageMembers,
    ManageNotebook,
    Complete,
    Comment,
}

impl Capability {
    fn describe(self) -> &'static str {
        match self {
            Self::EditStructure => "edit notes, folders and tasks",
            Self::ManageMembers => "manage members",
            Self::ManageNotebook => "manage notebook sharing and settings",
            Self::Complete => "complete tasks",
            Self::Comment => "comment",
        }
    }
}

pub fn capabilities(role: Role) -> Capabilities {
    match role {
        Role::Owner => Capabilities {
            can_edit_structure: true,
            can_manage_members: true,
            can_manage_notebook: true,
            can_complete: true,
            can_comment: true,
        },
        Role::Admin => Capabilities {
            can_edit_structure: true,
            can_manage_members: false,
            can_manage_notebook: false,
            can_complete: true,
            can_comment: true,
        },
        Role::Reader => Capabilities {
            can_edit_structure: false,
            can_manage_members: false,
            can_manage_notebook: false,
            can_complete: true,
            can_comment: true,
        },
    }
}

impl Capabilities {
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::EditStructure => self.can_edit_structure,
            Capability::ManageMembers => self.can_manage_members,
            Capability::ManageNotebook => self.can_manage_notebook,
            Capability::Complete => self.can_complete,
            Capability::Comment => self.can_comment,
        }
    }
}

/// The owner column wins over membership rows; the owner may have no member row at all.
pub fn resolve_role<'a>(
    notebook: &Notebook,
    members: impl IntoIterator<Item = &'a NotebookMember>,
    viewer_id: &str,
) -> Option<Role> {
    if notebook.owner_id == viewer_id {
        return Some(Role::Owner);
    }
    members
        .into_iter()
        .filter(|member| member.notebook_id == notebook.id && member.user_id == viewer_id)
        .map(|member| member.role)
        .max()
}

pub fn require(role: Option<Role>, capability: Capability) -> AppResult<Role> {
    let Some(role) = role else {
        return Err(AppError::Authorization(format!(
            "Not a member of this notebook; cannot {}",
            capability.describe()
        )));
    };
    if !capabilities(role).allows(capability) {
        return Err(AppError::Authorization(format!(
            "Role '{}' cannot {}",
            role.as_str(),
            capability.describe()
        )));
    }
    Ok(role)
}
