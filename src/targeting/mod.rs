//! Target resolution: turning a target expression into the set of minion ids
//! a job is published to.
//!
//! The dispatcher only sees the [`TargetResolver`] trait. [`RosterResolver`]
//! is the built-in implementation over the minions the master knows about
//! (their ids, grains and pillar).
//!
//! | Type          | Expression                         |
//! |---------------|------------------------------------|
//! | `glob`        | `web*`                             |
//! | `list`        | `web1,web2`                        |
//! | `pcre`        | `web\d+`                           |
//! | `grain`       | `os:Ubuntu`                        |
//! | `grain_pcre`  | `os:(Ubuntu\|Debian)`              |
//! | `pillar`      | `role:web`                         |
//! | `pillar_pcre` | `role:w.*`                         |
//! | `nodegroup`   | name from the master configuration |
//! | `compound`    | `G@os:Ubuntu and not web3`         |
//! | `range`       | not supported                      |

mod compound;
mod matcher;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TargetResolutionError;
use crate::protocol::MinionId;
use compound::CompoundEngine;
use matcher::{compile_glob, compile_pcre, match_data, LeafMode, DEFAULT_DELIMITER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Glob,
    List,
    Grain,
    GrainPcre,
    Pillar,
    PillarPcre,
    Pcre,
    Nodegroup,
    Compound,
    Range,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetType::Glob => "glob",
            TargetType::List => "list",
            TargetType::Grain => "grain",
            TargetType::GrainPcre => "grain_pcre",
            TargetType::Pillar => "pillar",
            TargetType::PillarPcre => "pillar_pcre",
            TargetType::Pcre => "pcre",
            TargetType::Nodegroup => "nodegroup",
            TargetType::Compound => "compound",
            TargetType::Range => "range",
        };
        f.write_str(name)
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(TargetType::Glob),
            "list" => Ok(TargetType::List),
            "grain" => Ok(TargetType::Grain),
            "grain_pcre" => Ok(TargetType::GrainPcre),
            "pillar" => Ok(TargetType::Pillar),
            "pillar_pcre" => Ok(TargetType::PillarPcre),
            "pcre" => Ok(TargetType::Pcre),
            "nodegroup" => Ok(TargetType::Nodegroup),
            "compound" => Ok(TargetType::Compound),
            "range" => Ok(TargetType::Range),
            other => Err(format!("unknown target type: {other}")),
        }
    }
}

/// Outcome of resolving a target expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Known minions matched by the expression
    pub minions: BTreeSet<MinionId>,
    /// Ids named explicitly (list targets) that the master does not know
    pub missing: BTreeSet<MinionId>,
}

pub trait TargetResolver: Send + Sync {
    fn resolve(
        &self,
        expression: &str,
        target_type: TargetType,
    ) -> Result<Resolution, TargetResolutionError>;
}

/// Targeting facts about one minion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinionData {
    pub grains: Value,
    pub pillar: Value,
}

impl MinionData {
    pub fn new(grains: Value, pillar: Value) -> Self {
        Self { grains, pillar }
    }
}

/// Resolves targets against the set of minions registered with the master.
#[derive(Debug, Default)]
pub struct RosterResolver {
    minions: RwLock<BTreeMap<MinionId, MinionData>>,
    nodegroups: BTreeMap<String, String>,
}

impl RosterResolver {
    pub fn new(nodegroups: BTreeMap<String, String>) -> Self {
        Self {
            minions: RwLock::new(BTreeMap::new()),
            nodegroups,
        }
    }

    pub fn register(&self, minion_id: impl Into<MinionId>, data: MinionData) {
        let minion_id = minion_id.into();
        tracing::debug!(minion_id = %minion_id, "Minion added to roster");
        self.minions.write().insert(minion_id, data);
    }

    pub fn remove(&self, minion_id: &str) -> Option<MinionData> {
        self.minions.write().remove(minion_id)
    }

    pub fn minion_ids(&self) -> Vec<MinionId> {
        self.minions.read().keys().cloned().collect()
    }

    fn filter(
        minions: &BTreeMap<MinionId, MinionData>,
        mut pred: impl FnMut(&MinionId, &MinionData) -> Result<bool, TargetResolutionError>,
    ) -> Result<Resolution, TargetResolutionError> {
        let mut matched = BTreeSet::new();
        for (id, data) in minions {
            if pred(id, data)? {
                matched.insert(id.clone());
            }
        }
        Ok(Resolution {
            minions: matched,
            missing: BTreeSet::new(),
        })
    }
}

impl TargetResolver for RosterResolver {
    fn resolve(
        &self,
        expression: &str,
        target_type: TargetType,
    ) -> Result<Resolution, TargetResolutionError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(TargetResolutionError::Empty);
        }
        let minions = self.minions.read();

        match target_type {
            TargetType::Glob => {
                let glob = compile_glob(expression)?;
                Self::filter(&minions, |id, _| Ok(glob.is_match(id)))
            }
            TargetType::Pcre => {
                let re = compile_pcre(expression)?;
                Self::filter(&minions, |id, _| Ok(re.is_match(id)))
            }
            TargetType::List => {
                let mut resolution = Resolution::default();
                for id in expression
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                {
                    if minions.contains_key(id) {
                        resolution.minions.insert(id.to_string());
                    } else {
                        resolution.missing.insert(id.to_string());
                    }
                }
                Ok(resolution)
            }
            TargetType::Grain => Self::filter(&minions, |_, d| {
                match_data(&d.grains, expression, DEFAULT_DELIMITER, LeafMode::Glob)
            }),
            TargetType::GrainPcre => Self::filter(&minions, |_, d| {
                match_data(&d.grains, expression, DEFAULT_DELIMITER, LeafMode::Pcre)
            }),
            TargetType::Pillar => Self::filter(&minions, |_, d| {
                match_data(&d.pillar, expression, DEFAULT_DELIMITER, LeafMode::Glob)
            }),
            TargetType::PillarPcre => Self::filter(&minions, |_, d| {
                match_data(&d.pillar, expression, DEFAULT_DELIMITER, LeafMode::Pcre)
            }),
            TargetType::Nodegroup => CompoundEngine::new(&minions, &self.nodegroups).nodegroup(expression),
            TargetType::Compound => CompoundEngine::new(&minions, &self.nodegroups).evaluate(expression),
            TargetType::Range => Err(TargetResolutionError::Unsupported(TargetType::Range)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_type_parse_and_display() {
        for name in [
            "glob",
            "list",
            "grain",
            "grain_pcre",
            "pillar",
            "pillar_pcre",
            "pcre",
            "nodegroup",
            "compound",
            "range",
        ] {
            let parsed: TargetType = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
        assert!("ipcidr".parse::<TargetType>().is_err());
    }

    #[test]
    fn target_type_serde_uses_snake_case() {
        let json = serde_json::to_string(&TargetType::GrainPcre).unwrap();
        assert_eq!(json, "\"grain_pcre\"");
    }
}
