//! # Rule Trace
//!
//! The ordered list of policy rules a connection matched in one direction.
//!
//! Points are stored at their absolute evaluation index, so points produced by
//! different data sources for the same endpoint line up without colliding.
//! Storage is a growable arena of slots: unoccupied slots are `None`, and the
//! arena only ever grows in whole [`CHUNK_SIZE`] steps.
//!
//! The resolved (verdict) action of a trace is the action of the last point
//! recorded with a terminal action. `NextTier` points only chain tiers together
//! and never change the verdict.

use std::fmt;

use crate::types::RuleAction;

/// Number of slots added each time the trace grows.
pub const CHUNK_SIZE: usize = 10;

/// Tier name used for profile-level matches that sit after all tiers.
pub const PROFILE_TIER: &str = "profile";

// ================================================================================================
// TRACE POINT
// ================================================================================================

/// One step in a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleTracePoint {
    pub tier: String,
    pub policy: String,
    /// Rule identifier within the policy. Not necessarily numeric.
    pub rule: String,
    pub action: RuleAction,
    /// Whether flows resolved by this point may be sent to the exporter.
    pub export: bool,
    /// Absolute position in the endpoint's evaluation order.
    pub index: usize,
}

impl fmt::Display for RuleTracePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}@{}",
            self.tier, self.policy, self.rule, self.action, self.index
        )
    }
}

/// Result of [`RuleTrace::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum InsertOutcome {
    /// The slot was empty and now holds the point.
    Inserted,
    /// The slot already held an identical point. Nothing changed.
    Exists,
    /// The slot holds a different point. Nothing changed; the caller decides
    /// whether to drop the point or [`RuleTrace::replace`] it.
    Conflict,
}

// ================================================================================================
// RULE TRACE
// ================================================================================================

#[derive(Debug, Clone)]
pub struct RuleTrace {
    slots: Vec<Option<RuleTracePoint>>,
    /// Slot of the point that decided the current verdict.
    verdict: Option<usize>,
}

impl Default for RuleTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTrace {
    pub fn new() -> Self {
        RuleTrace {
            slots: vec![None; CHUNK_SIZE],
            verdict: None,
        }
    }

    /// Current slot capacity. Always a multiple of [`CHUNK_SIZE`].
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Inserts `point` at `point.index`.
    pub fn insert(&mut self, point: RuleTracePoint) -> InsertOutcome {
        let idx = point.index;
        self.grow_to_fit(idx);

        match &self.slots[idx] {
            Some(existing) if *existing == point => return InsertOutcome::Exists,
            Some(_) => return InsertOutcome::Conflict,
            None => {}
        }

        let terminal = point.action.is_terminal();
        self.slots[idx] = Some(point);
        if terminal {
            self.verdict = Some(idx);
        }
        InsertOutcome::Inserted
    }

    /// Stores `point` at its index regardless of what is there.
    ///
    /// A terminal action at this index makes every later point stale, so the
    /// trace is truncated after it. A `NextTier` point leaves later points intact.
    pub fn replace(&mut self, point: RuleTracePoint) {
        let idx = point.index;
        self.grow_to_fit(idx);

        let terminal = point.action.is_terminal();
        self.slots[idx] = Some(point);
        if terminal {
            self.slots.truncate(chunked_len(idx));
            for slot in &mut self.slots[idx + 1..] {
                *slot = None;
            }
        }

        self.verdict = self
            .slots
            .iter()
            .rposition(|slot| matches!(slot, Some(p) if p.action.is_terminal()));
    }

    /// Occupied slots in evaluation order.
    pub fn path(&self) -> impl Iterator<Item = &RuleTracePoint> + '_ {
        self.slots.iter().flatten()
    }

    /// The point that decided the verdict, if any.
    pub fn verdict_point(&self) -> Option<&RuleTracePoint> {
        self.verdict.and_then(|idx| self.slots[idx].as_ref())
    }

    /// Resolved action. `None` until a terminal point has been recorded.
    pub fn action(&self) -> Option<RuleAction> {
        self.verdict_point().map(|p| p.action)
    }

    /// Export flag of the verdict point. False while the verdict is undetermined.
    pub fn export(&self) -> bool {
        self.verdict_point().map(|p| p.export).unwrap_or(false)
    }

    /// Aggregation key for the verdict point: `<tier>/<policy>/<rule>/<action>`.
    pub fn rule_string(&self) -> Option<String> {
        self.verdict_point()
            .map(|p| format!("{}/{}/{}/{}", p.tier, p.policy, p.rule, p.action))
    }

    fn grow_to_fit(&mut self, idx: usize) {
        if idx >= self.slots.len() {
            self.slots.resize(chunked_len(idx), None);
        }
    }
}

/// Smallest multiple of [`CHUNK_SIZE`] strictly greater than `idx`.
fn chunked_len(idx: usize) -> usize {
    (idx / CHUNK_SIZE + 1) * CHUNK_SIZE
}

impl fmt::Display for RuleTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path=[")?;
        for (i, point) in self.path().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "({})", point)?;
        }
        match self.action() {
            Some(action) => write!(f, "], action={}", action),
            None => write!(f, "], action=<undetermined>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(index: usize, action: RuleAction, policy: &str) -> RuleTracePoint {
        RuleTracePoint {
            tier: "tier1".to_string(),
            policy: policy.to_string(),
            rule: "0".to_string(),
            action,
            export: true,
            index,
        }
    }

    #[test]
    fn test_new_trace_is_empty_with_one_chunk() {
        let trace = RuleTrace::new();
        assert!(trace.is_empty());
        assert_eq!(trace.capacity(), CHUNK_SIZE);
        assert_eq!(trace.action(), None);
        assert!(!trace.export());
    }

    #[test]
    fn test_idempotent_insert() {
        let mut trace = RuleTrace::new();
        let p = point(2, RuleAction::Deny, "pol-a");

        assert_eq!(trace.insert(p.clone()), InsertOutcome::Inserted);
        assert_eq!(trace.insert(p.clone()), InsertOutcome::Exists);

        assert_eq!(trace.len(), 1);
        assert_eq!(trace.path().next(), Some(&p));
        assert_eq!(trace.action(), Some(RuleAction::Deny));
    }

    #[test]
    fn test_conflict_leaves_trace_unchanged() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(1, RuleAction::Deny, "pol-a"));
        let before: Vec<_> = trace.path().cloned().collect();

        let outcome = trace.insert(point(1, RuleAction::Allow, "pol-a"));

        assert_eq!(outcome, InsertOutcome::Conflict);
        assert_eq!(trace.path().cloned().collect::<Vec<_>>(), before);
        assert_eq!(trace.action(), Some(RuleAction::Deny));
    }

    #[test]
    fn test_next_tier_is_transparent() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(0, RuleAction::NextTier, "pol-a"));
        assert_eq!(trace.action(), None);

        let _ = trace.insert(point(3, RuleAction::Allow, "pol-b"));
        let _ = trace.insert(point(5, RuleAction::NextTier, "pol-c"));
        assert_eq!(trace.action(), Some(RuleAction::Allow));
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn test_growth_is_chunked() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(10, RuleAction::Allow, "pol-a"));
        assert_eq!(trace.capacity(), 20);

        let _ = trace.insert(point(25, RuleAction::Allow, "pol-b"));
        assert_eq!(trace.capacity(), 30);

        let _ = trace.insert(point(29, RuleAction::Allow, "pol-c"));
        assert_eq!(trace.capacity(), 30);

        let _ = trace.insert(point(30, RuleAction::Allow, "pol-d"));
        assert_eq!(trace.capacity(), 40);
    }

    #[test]
    fn test_replace_terminal_truncates_forward() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(0, RuleAction::NextTier, "pol-a"));
        let _ = trace.insert(point(1, RuleAction::NextTier, "pol-b"));
        let _ = trace.insert(point(14, RuleAction::Allow, "pol-c"));
        assert_eq!(trace.capacity(), 20);

        trace.replace(point(1, RuleAction::Deny, "pol-b"));

        let path: Vec<_> = trace.path().map(|p| p.index).collect();
        assert_eq!(path, vec![0, 1]);
        assert_eq!(trace.action(), Some(RuleAction::Deny));
        assert_eq!(trace.capacity(), CHUNK_SIZE);
    }

    #[test]
    fn test_replace_next_tier_keeps_later_points() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(0, RuleAction::Deny, "pol-a"));
        let _ = trace.insert(point(4, RuleAction::Allow, "pol-b"));

        trace.replace(point(0, RuleAction::NextTier, "pol-a"));

        let path: Vec<_> = trace.path().map(|p| p.index).collect();
        assert_eq!(path, vec![0, 4]);
        assert_eq!(trace.action(), Some(RuleAction::Allow));
    }

    #[test]
    fn test_replace_recomputes_verdict_when_terminal_removed() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(2, RuleAction::Deny, "pol-a"));

        trace.replace(point(2, RuleAction::NextTier, "pol-a"));

        assert_eq!(trace.action(), None);
        assert_eq!(trace.rule_string(), None);
    }

    #[test]
    fn test_path_is_restartable() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(7, RuleAction::Allow, "pol-b"));
        let _ = trace.insert(point(2, RuleAction::NextTier, "pol-a"));

        let first: Vec<_> = trace.path().map(|p| p.index).collect();
        let second: Vec<_> = trace.path().map(|p| p.index).collect();
        assert_eq!(first, vec![2, 7]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rule_string_uses_verdict_point() {
        let mut trace = RuleTrace::new();
        let _ = trace.insert(point(0, RuleAction::NextTier, "pol-a"));
        let _ = trace.insert(point(1, RuleAction::Deny, "pol-b"));
        assert_eq!(trace.rule_string().as_deref(), Some("tier1/pol-b/0/deny"));
    }
}
