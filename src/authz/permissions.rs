use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::GateError;

/// What a permission level allows on a single resource.
///
/// The tuples are fixed per level and are not required to nest: a level may
/// allow `update` without allowing `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub can_read: bool,
    pub can_update: bool,
    pub can_delete: bool,
    pub can_manage: bool,
}

impl Capabilities {
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Read => self.can_read,
            Capability::Update => self.can_update,
            Capability::Delete => self.can_delete,
            Capability::Manage => self.can_manage,
        }
    }
}

/// A single capability a route can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Read,
    Update,
    Delete,
    Manage,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Read => "read",
            Capability::Update => "update",
            Capability::Delete => "delete",
            Capability::Manage => "manage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    Read,
    Edit,
    Update,
    Manage,
    NoPermissions,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::Read,
        Permission::Edit,
        Permission::Update,
        Permission::Manage,
        Permission::NoPermissions,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Permission::Read => "READ",
            Permission::Edit => "EDIT",
            Permission::Update => "UPDATE",
            Permission::Manage => "MANAGE",
            Permission::NoPermissions => "NO_PERMISSIONS",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, GateError> {
        Permission::ALL
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| GateError::InvalidPermissionLevel(name.to_string()))
    }

    pub const fn capabilities(&self) -> Capabilities {
        match self {
            Permission::Read => Capabilities {
                can_read: true,
                can_update: false,
                can_delete: false,
                can_manage: false,
            },
            Permission::Edit | Permission::Update => Capabilities {
                can_read: true,
                can_update: true,
                can_delete: false,
                can_manage: false,
            },
            Permission::Manage => Capabilities {
                can_read: true,
                can_update: true,
                can_delete: true,
                can_manage: true,
            },
            Permission::NoPermissions => Capabilities {
                can_read: false,
                can_update: false,
                can_delete: false,
                can_manage: false,
            },
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities().allows(capability)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Permission {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::from_name(s)
    }
}

impl TryFrom<String> for Permission {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Permission::from_name(&value)
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.name().to_string()
    }
}
