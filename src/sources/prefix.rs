//! Parsing of the rule prefix attached to deny-path notifications.
//!
//! Format: `<export>/<action>/<rule>/<policy>[/<tier>]`
//! - `export`: `true` or `false`
//! - `action`: `A` (allow), `D` (deny) or `N` (next tier), case-insensitive
//! - four fields denote a profile match, five a tiered policy

use crate::error::FlowError;
use crate::rule_trace::PROFILE_TIER;
use crate::types::RuleAction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePrefix {
    pub export: bool,
    pub action: RuleAction,
    pub rule: String,
    pub policy: String,
    pub tier: String,
}

impl RulePrefix {
    pub fn parse(prefix: &str) -> Result<Self, FlowError> {
        let fields: Vec<&str> = prefix.split('/').collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(FlowError::malformed_prefix(
                prefix,
                format!("expected 4 or 5 fields, found {}", fields.len()),
            ));
        }

        let export = match fields[0] {
            "true" => true,
            "false" => false,
            other => {
                return Err(FlowError::malformed_prefix(
                    prefix,
                    format!("invalid export flag {:?}", other),
                ))
            }
        };

        let action = match fields[1] {
            "A" | "a" => RuleAction::Allow,
            "D" | "d" => RuleAction::Deny,
            "N" | "n" => RuleAction::NextTier,
            other => {
                return Err(FlowError::malformed_prefix(
                    prefix,
                    format!("invalid action {:?}", other),
                ))
            }
        };

        if fields[2..].iter().any(|f| f.is_empty()) {
            return Err(FlowError::malformed_prefix(prefix, "empty rule, policy or tier"));
        }

        let tier = fields.get(4).copied().unwrap_or(PROFILE_TIER);

        Ok(RulePrefix {
            export,
            action,
            rule: fields[2].to_string(),
            policy: fields[3].to_string(),
            tier: tier.to_string(),
        })
    }
}
