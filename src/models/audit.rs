// src/models/audit.rs

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Report,
    Workorder,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Workorder => "workorder",
        }
    }
}

impl FromStr for TargetKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(Self::Report),
            "workorder" => Ok(Self::Workorder),
            other => Err(UnknownVariant::new("audit target", other)),
        }
    }
}

text_enum!(TargetKind);
