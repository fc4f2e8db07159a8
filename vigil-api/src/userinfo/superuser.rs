//! Superuser resolution.
//!
//! An account may act as superuser when its group or its license is on the
//! configured allow lists. The stored superuser flag only counts for such
//! accounts, and only an active superuser sees the override job.

use std::collections::HashSet;
use vigil_core::UserInfo;

use crate::db::UserInfoRow;

/// Allow lists deciding who may be superuser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperuserPolicy {
    groups: HashSet<String>,
    users: HashSet<String>,
}

impl SuperuserPolicy {
    pub fn new<G, U>(groups: G, users: U) -> Self
    where
        G: IntoIterator,
        G::Item: Into<String>,
        U: IntoIterator,
        U::Item: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            users: users.into_iter().map(Into::into).collect(),
        }
    }

    pub fn can_be_superuser(&self, group: &str, license: &str) -> bool {
        self.groups.contains(group) || self.users.contains(license)
    }

    /// Turn a raw row into resolved user info.
    pub fn resolve(&self, row: UserInfoRow) -> UserInfo {
        let can_be_superuser = self.can_be_superuser(&row.group, &row.license);
        let mut info = row.into_user_info(can_be_superuser);

        if info.superuser {
            if let Some(job) = info.override_job.clone() {
                info.job = job;
                info.job_grade = info.override_job_grade.unwrap_or(info.job_grade);
            }
        }
        info
    }
}
