//! Member selection per model family.
//!
//! NAEFS numbers its 43 members as: 1..=21 regional ensemble (1 is the
//! control), 22 the deterministic run, 23..=43 global ensemble (23 is the
//! control).

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::errors::WeatherError;
use crate::models::MemberId;

/// Member id of the deterministic run.
pub const DETERMINISTIC_MEMBER: MemberId = 22;

/// Regional ensemble members.
pub const REGIONAL_MEMBERS: std::ops::RangeInclusive<MemberId> = 1..=21;

/// Global ensemble members.
pub const GLOBAL_MEMBERS: std::ops::RangeInclusive<MemberId> = 23..=43;

/// Highest member id published.
pub const MAX_MEMBER: MemberId = 43;

/// Named selection policy for which members take part in the reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ModelFamily {
    Deterministic,
    RegionalEnsemble,
    GlobalEnsemble,
    #[default]
    Combined,
    Custom,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Deterministic => "deterministic",
            ModelFamily::RegionalEnsemble => "regional",
            ModelFamily::GlobalEnsemble => "global",
            ModelFamily::Combined => "combined",
            ModelFamily::Custom => "custom",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = WeatherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deterministic" | "gem_deter" => Ok(ModelFamily::Deterministic),
            "regional" | "gem" => Ok(ModelFamily::RegionalEnsemble),
            "global" | "ncep" => Ok(ModelFamily::GlobalEnsemble),
            "combined" | "both" => Ok(ModelFamily::Combined),
            "custom" => Ok(ModelFamily::Custom),
            other => Err(WeatherError::InvalidRequest(format!(
                "unknown model family '{}'",
                other
            ))),
        }
    }
}

/// Ordered member ids fixed for the duration of one calculation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemberSelection(Vec<MemberId>);

impl MemberSelection {
    pub fn ids(&self) -> &[MemberId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.0.contains(&member)
    }
}

/// Resolve the member ids for a family.
///
/// `custom` is only consulted for `ModelFamily::Custom`; repeated ids keep
/// their first position. An empty result means the calculation cannot proceed.
pub fn select_members(family: ModelFamily, custom: &[MemberId]) -> MemberSelection {
    let ids = match family {
        ModelFamily::Custom => custom.iter().fold(Vec::new(), |mut ids, id| {
            if !ids.contains(id) {
                ids.push(*id);
            }
            ids
        }),
        ModelFamily::Deterministic => vec![DETERMINISTIC_MEMBER],
        ModelFamily::RegionalEnsemble => REGIONAL_MEMBERS.collect(),
        ModelFamily::GlobalEnsemble => GLOBAL_MEMBERS.collect(),
        ModelFamily::Combined => (1..=MAX_MEMBER).collect(),
    };
    MemberSelection(ids)
}

/// Like `select_members`, but an empty selection or an unknown id is an error.
pub fn require_members(
    family: ModelFamily,
    custom: &[MemberId],
) -> Result<MemberSelection, WeatherError> {
    let selection = select_members(family, custom);
    if let Some(id) = selection.ids().iter().find(|id| !(1..=MAX_MEMBER).contains(*id)) {
        return Err(WeatherError::InvalidRequest(format!(
            "member {} is outside 1..={}",
            id, MAX_MEMBER
        )));
    }
    if selection.is_empty() {
        return Err(WeatherError::EmptyMemberSelection(family.to_string()));
    }
    Ok(selection)
}
