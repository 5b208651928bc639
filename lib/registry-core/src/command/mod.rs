//! Routing command document
//!
//! ```json
//! { "clientCommandList": [
//!     { "index": 1, "pattern": "/v1/*",
//!       "mergeGroups": ["g1:70", "g2:30"],
//!       "routeRules": ["10.75.* to 10.75.*"] } ] }
//! ```

pub mod expression;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{RegistryError, Result};

pub use expression::{matches, Expr, ExpressionError};

/// Weight given to a merge group listed without one
pub const DEFAULT_GROUP_WEIGHT: u32 = 1;
pub const MAX_GROUP_WEIGHT: u32 = 100;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCommand {
    #[serde(default)]
    pub client_command_list: Vec<ClientCommand>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCommand {
    #[serde(default)]
    pub index: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<i32>,

    /// Expression selecting the service paths this command applies to
    #[serde(default)]
    pub pattern: String,

    /// `group:weight` entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_groups: Vec<String>,

    /// `fromIpPattern to toIpPattern` entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route_rules: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl RpcCommand {
    /// Decode the external form. Blank or malformed input means "no
    /// command"; commands come back ordered by `index`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<RpcCommand>(raw) {
            Ok(mut command) => {
                command.sort();
                Some(command)
            }
            Err(e) => {
                warn!("ignoring malformed routing command: {}", e);
                None
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn sort(&mut self) {
        self.client_command_list.sort_by_key(|c| c.index);
    }

    pub fn is_empty(&self) -> bool {
        self.client_command_list.is_empty()
    }

    /// First command in document order whose pattern selects `path`
    pub fn select(&self, path: &str) -> Result<Option<&ClientCommand>> {
        for command in &self.client_command_list {
            if command.matches(path)? {
                return Ok(Some(command));
            }
        }
        Ok(None)
    }
}

impl ClientCommand {
    pub fn matches(&self, path: &str) -> Result<bool> {
        Ok(expression::matches(&self.pattern, path)?)
    }

    /// Parsed merge groups in document order. A later entry for the same
    /// group replaces the earlier weight.
    pub fn group_weights(&self) -> Result<Vec<(String, u32)>> {
        let mut weights: Vec<(String, u32)> = Vec::with_capacity(self.merge_groups.len());
        for entry in &self.merge_groups {
            let (group, weight) = parse_merge_group(entry)?;
            match weights.iter_mut().find(|(g, _)| *g == group) {
                Some(existing) => existing.1 = weight,
                None => weights.push((group, weight)),
            }
        }
        Ok(weights)
    }

    /// Valid route rules; invalid ones are logged and skipped
    pub fn parsed_route_rules(&self) -> Vec<RouteRule> {
        self.route_rules
            .iter()
            .filter_map(|rule| match RouteRule::parse(rule) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(rule = %rule, "skipping route rule: {}", e);
                    None
                }
            })
            .collect()
    }
}

fn parse_merge_group(entry: &str) -> Result<(String, u32)> {
    let entry = entry.trim();
    let (group, weight) = match entry.split_once(':') {
        Some((group, weight)) => {
            let weight: i64 = weight.trim().parse().map_err(|_| {
                RegistryError::InvalidConfiguration(format!(
                    "merge group weight is not a number: {}",
                    entry
                ))
            })?;
            if !(0..=MAX_GROUP_WEIGHT as i64).contains(&weight) {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "merge group weight out of range [0,{}]: {}",
                    MAX_GROUP_WEIGHT, entry
                )));
            }
            (group.trim(), weight as u32)
        }
        None => (entry, DEFAULT_GROUP_WEIGHT),
    };
    if group.is_empty() {
        return Err(RegistryError::InvalidConfiguration(format!(
            "merge group without a name: {}",
            entry
        )));
    }
    Ok((group.to_string(), weight))
}

/// Address pattern: optional leading `!`, digits and dots, optional
/// trailing `*`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpPattern {
    negate: bool,
    prefix: String,
    wildcard: bool,
}

impl IpPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || RegistryError::InvalidConfiguration(format!("invalid ip pattern: {}", raw));
        let (negate, rest) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (wildcard, prefix) = match rest.strip_suffix('*') {
            Some(prefix) => (true, prefix),
            None => (false, rest),
        };
        if rest.is_empty() || !prefix.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(invalid());
        }
        Ok(Self {
            negate,
            prefix: prefix.to_string(),
            wildcard,
        })
    }

    pub fn matches(&self, address: &str) -> bool {
        let hit = if self.wildcard {
            address.starts_with(&self.prefix)
        } else {
            address == self.prefix
        };
        hit != self.negate
    }
}

/// `from to to`: callers at `from` may only reach hosts matching `to`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRule {
    pub from: IpPattern,
    pub to: IpPattern,
}

impl RouteRule {
    pub fn parse(rule: &str) -> Result<Self> {
        let compact: String = rule.chars().filter(|c| !c.is_whitespace()).collect();
        let sides: Vec<&str> = compact.split("to").collect();
        if sides.len() != 2 {
            return Err(RegistryError::InvalidConfiguration(format!(
                "route rule must be 'from to to': {}",
                rule
            )));
        }
        Ok(Self {
            from: IpPattern::parse(sides[0])?,
            to: IpPattern::parse(sides[1])?,
        })
    }

    pub fn applies_to(&self, local_ip: &str) -> bool {
        self.from.matches(local_ip)
    }

    pub fn admits(&self, host: &str) -> bool {
        self.to.matches(host)
    }
}
