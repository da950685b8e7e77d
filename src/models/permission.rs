// src/models/permission.rs

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    FillWork,
    OnsiteReporting,
    Both,
}

impl PermissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FillWork => "fill_work",
            Self::OnsiteReporting => "onsite_reporting",
            Self::Both => "both",
        }
    }

    /// Whether a row of this type grants `wanted`.
    pub fn grants(self, wanted: PermissionType) -> bool {
        self == Self::Both || self == wanted
    }
}

impl FromStr for PermissionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fill_work" => Ok(Self::FillWork),
            "onsite_reporting" => Ok(Self::OnsiteReporting),
            "both" => Ok(Self::Both),
            other => Err(UnknownVariant::new("permission type", other)),
        }
    }
}

text_enum!(PermissionType);

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserWorkPermission {
    pub permission_id: i64,
    pub username: String,
    pub permission_type: PermissionType,
    pub operator_codes: String, // comma-separated; empty = all
    pub process_names: String,  // comma-separated; empty = all
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl UserWorkPermission {
    pub fn operator_list(&self) -> Vec<String> {
        split_list(&self.operator_codes)
    }

    pub fn process_list(&self) -> Vec<String> {
        split_list(&self.process_names)
    }
}

/// Splits a comma-separated column, accepting the full-width comma operators tend to type.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', '，'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_ignores_blanks_and_full_width_commas() {
        assert_eq!(
            split_list(" OP-1, OP-2，OP-3 ,, "),
            vec!["OP-1".to_string(), "OP-2".into(), "OP-3".into()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn both_grants_every_kind() {
        assert!(PermissionType::Both.grants(PermissionType::FillWork));
        assert!(PermissionType::Both.grants(PermissionType::OnsiteReporting));
        assert!(!PermissionType::FillWork.grants(PermissionType::OnsiteReporting));
    }
}
