//! Session and attachment records shared by the wire protocol, the REST
//! client and the reducers.

use serde::{Deserialize, Serialize};

/// Session role of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Elevated privileges: kick, rotate codes, manage the campaign list.
    Coordinator,
    /// Regular member.
    Line,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Line => "line",
        }
    }
}

/// Which side of a campaign a session is working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Offense,
    Defense,
}

/// A campaign picked for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSelection {
    pub campaign_id: i64,
    pub side: Side,
}

/// A session member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub character_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub online: bool,
}

impl Member {
    pub fn new(character_id: i64, name: impl Into<String>, role: Role) -> Self {
        Self {
            character_id,
            name: Some(name.into()),
            role,
            online: false,
        }
    }

    /// Name for notices, falling back to `#<id>`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("#{}", self.character_id),
        }
    }
}

/// Session metadata as carried by `session.snapshot` and the session fetch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub campaigns: Vec<CampaignSelection>,
}

/// Entosis module tier of an attached character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntosisTier {
    T1,
    T2,
}

/// User that owns an attached character.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OwnerUser {
    pub id: i64,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A character attached to a session ("toaster").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toaster {
    pub character_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub portrait_url: Option<String>,
    #[serde(default)]
    pub alliance_id: Option<i64>,
    #[serde(default)]
    pub alliance_icon_url: Option<String>,
    #[serde(default)]
    pub owner_user: OwnerUser,
    pub entosis_tier: EntosisTier,
    #[serde(default)]
    pub system_id: Option<i64>,
    #[serde(default)]
    pub ship_type_id: Option<i64>,
    #[serde(default)]
    pub ship_type_name: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen_at: Option<i64>,
}
