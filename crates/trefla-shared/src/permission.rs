//! Typed back-office permissions.
//!
//! Employees carry a [`PermissionSet`]; every admin endpoint names the
//! [`Permission`] it needs and the check is a plain field lookup.

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminRole {
    Super,
    Employee,
}

impl AdminRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminRole::Super => "SUPER",
            AdminRole::Employee => "EMPLOYEE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypeError> {
        match s {
            "SUPER" => Ok(AdminRole::Super),
            "EMPLOYEE" => Ok(AdminRole::Employee),
            other => Err(TypeError::UnknownAdminRole(other.to_string())),
        }
    }
}

/// Every permission an admin endpoint can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    IdentityView,
    IdentityVerify,
    DriverIdReject,
    IdTransferShow,
    SendNotificationShow,
    SettingsConfig,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Permission::IdentityView,
        Permission::IdentityVerify,
        Permission::DriverIdReject,
        Permission::IdTransferShow,
        Permission::SendNotificationShow,
        Permission::SettingsConfig,
    ];

    /// Dotted path used by the back-office UI.
    pub fn path(self) -> &'static str {
        match self {
            Permission::IdentityView => "identity.view",
            Permission::IdentityVerify => "identity.verify",
            Permission::DriverIdReject => "driver-id.reject",
            Permission::IdTransferShow => "user.idTransfer.show",
            Permission::SendNotificationShow => "user.sendNotification.show",
            Permission::SettingsConfig => "settings.config",
        }
    }

    pub fn from_path(path: &str) -> Result<Self, TypeError> {
        Self::ALL
            .into_iter()
            .find(|p| p.path() == path)
            .ok_or_else(|| TypeError::UnknownPermission(path.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityPermissions {
    #[serde(default)]
    pub view: bool,
    #[serde(default)]
    pub verify: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverIdPermissions {
    #[serde(default)]
    pub reject: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPermissions {
    #[serde(default)]
    pub id_transfer_show: bool,
    #[serde(default)]
    pub send_notification_show: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsPermissions {
    #[serde(default)]
    pub config: bool,
}

/// Permissions granted to an employee admin.  Missing fields deny.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    #[serde(default)]
    pub identity: IdentityPermissions,
    #[serde(default)]
    pub driver_id: DriverIdPermissions,
    #[serde(default)]
    pub user: UserPermissions,
    #[serde(default)]
    pub settings: SettingsPermissions,
}

impl PermissionSet {
    /// Every permission granted.
    pub fn all() -> Self {
        let mut set = Self::default();
        for permission in Permission::ALL {
            set.grant(permission);
        }
        set
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::IdentityView => self.identity.view,
            Permission::IdentityVerify => self.identity.verify,
            Permission::DriverIdReject => self.driver_id.reject,
            Permission::IdTransferShow => self.user.id_transfer_show,
            Permission::SendNotificationShow => self.user.send_notification_show,
            Permission::SettingsConfig => self.settings.config,
        }
    }

    pub fn grant(&mut self, permission: Permission) {
        let slot = match permission {
            Permission::IdentityView => &mut self.identity.view,
            Permission::IdentityVerify => &mut self.identity.verify,
            Permission::DriverIdReject => &mut self.driver_id.reject,
            Permission::IdTransferShow => &mut self.user.id_transfer_show,
            Permission::SendNotificationShow => &mut self.user.send_notification_show,
            Permission::SettingsConfig => &mut self.settings.config,
        };
        *slot = true;
    }
}

/// Role plus permissions, resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminGrant {
    pub role: AdminRole,
    pub permissions: PermissionSet,
}

impl AdminGrant {
    pub fn superuser() -> Self {
        Self {
            role: AdminRole::Super,
            permissions: PermissionSet::all(),
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.role == AdminRole::Super || self.permissions.allows(permission)
    }
}
