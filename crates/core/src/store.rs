use std::collections::BTreeMap;
use std::sync::Arc;

use conntracker_common::FilterRuleRecord;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::codec;
use crate::error::{StoreError, TableError};
use crate::metrics::{Metrics, Outcome, RuleOp};
use crate::rule::{FilterRule, RULE_CAPACITY, RuleSpec};

/// How a record is written into its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Create or overwrite (BPF_ANY).
    Insert,
    /// The slot must already hold a record (BPF_EXIST).
    MustExist,
}

/// The kernel-side enforcement table, indexed by rule id.
pub trait RuleTable: Send + Sync {
    fn publish(
        &mut self,
        slot: u32,
        record: &FilterRuleRecord,
        mode: PublishMode,
    ) -> Result<(), TableError>;
}

impl<T: RuleTable + ?Sized> RuleTable for Box<T> {
    fn publish(
        &mut self,
        slot: u32,
        record: &FilterRuleRecord,
        mode: PublishMode,
    ) -> Result<(), TableError> {
        (**self).publish(slot, record, mode)
    }
}

/// Rule table kept in process memory. Backs the agent's dry-run mode and
/// the tests; it enforces the same slot bounds and `MustExist` semantics
/// as the kernel array.
#[derive(Debug)]
pub struct MemoryTable {
    slots: Vec<Option<FilterRuleRecord>>,
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; RULE_CAPACITY as usize],
        }
    }

    pub fn slot(&self, slot: u32) -> Option<&FilterRuleRecord> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }
}

impl RuleTable for MemoryTable {
    fn publish(
        &mut self,
        slot: u32,
        record: &FilterRuleRecord,
        mode: PublishMode,
    ) -> Result<(), TableError> {
        let entry = self.slots.get_mut(slot as usize).ok_or_else(|| TableError {
            slot,
            detail: "index out of bounds".to_string(),
        })?;
        if mode == PublishMode::MustExist && entry.is_none() {
            return Err(TableError {
                slot,
                detail: "slot holds no record".to_string(),
            });
        }
        *entry = Some(*record);
        Ok(())
    }
}

struct Inner<T> {
    rules: BTreeMap<u32, FilterRule>,
    table: T,
}

/// Authoritative rule catalogue, kept in lockstep with the enforcement
/// table.
///
/// Every mutation holds the write lock across encode and publish, so the
/// catalogue only ever reflects records the table accepted. Reads take the
/// shared lock and never touch the table.
pub struct RuleStore<T> {
    inner: RwLock<Inner<T>>,
    metrics: Arc<Metrics>,
}

impl<T: RuleTable> RuleStore<T> {
    pub fn new(table: T, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                rules: BTreeMap::new(),
                table,
            }),
            metrics,
        }
    }

    /// Insert a new rule. Id 0 asks for the lowest free slot.
    pub fn add(&self, spec: &RuleSpec) -> Result<FilterRule, StoreError> {
        let result = self.try_add(spec);
        self.record(RuleOp::Add, &result);
        result
    }

    /// Replace an existing rule wholesale.
    pub fn update(&self, spec: &RuleSpec) -> Result<FilterRule, StoreError> {
        let result = self.try_update(spec);
        self.record(RuleOp::Update, &result);
        result
    }

    /// Remove a rule and free its id. The slot is overwritten with a
    /// disabled tombstone first; a failed overwrite is logged and the rule
    /// is evicted regardless.
    pub fn remove(&self, id: u32) -> Result<FilterRule, StoreError> {
        let result = self.try_remove(id);
        self.record(RuleOp::Remove, &result);
        result
    }

    pub fn enable(&self, id: u32) -> Result<FilterRule, StoreError> {
        let result = self.set_enabled(id, true);
        self.record(RuleOp::Enable, &result);
        result
    }

    pub fn disable(&self, id: u32) -> Result<FilterRule, StoreError> {
        let result = self.set_enabled(id, false);
        self.record(RuleOp::Disable, &result);
        result
    }

    pub fn get(&self, id: u32) -> Option<FilterRule> {
        self.inner.read().rules.get(&id).cloned()
    }

    /// All rules, ordered by id.
    pub fn list(&self) -> Vec<FilterRule> {
        self.inner.read().rules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().rules.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        RULE_CAPACITY
    }

    fn try_add(&self, spec: &RuleSpec) -> Result<FilterRule, StoreError> {
        let mut rule = codec::parse(spec)?;

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let id = if rule.id == 0 {
            (0..RULE_CAPACITY)
                .find(|id| !inner.rules.contains_key(id))
                .ok_or(StoreError::CapacityExceeded(RULE_CAPACITY))?
        } else {
            check_range(rule.id)?;
            if inner.rules.contains_key(&rule.id) {
                return Err(StoreError::AlreadyExists(rule.id));
            }
            rule.id
        };
        rule.id = id;

        inner
            .table
            .publish(id, &codec::encode(&rule), PublishMode::Insert)?;
        inner.rules.insert(id, rule.clone());
        self.metrics.active_rules.set(inner.rules.len() as i64);

        info!(id, action = rule.action.as_str(), enabled = rule.enabled, "rule added");
        Ok(rule)
    }

    fn try_update(&self, spec: &RuleSpec) -> Result<FilterRule, StoreError> {
        let rule = codec::parse(spec)?;

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if !inner.rules.contains_key(&rule.id) {
            return Err(StoreError::NotFound(rule.id));
        }
        inner
            .table
            .publish(rule.id, &codec::encode(&rule), PublishMode::MustExist)?;
        inner.rules.insert(rule.id, rule.clone());

        info!(id = rule.id, "rule updated");
        Ok(rule)
    }

    fn try_remove(&self, id: u32) -> Result<FilterRule, StoreError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let rule = inner.rules.remove(&id).ok_or(StoreError::NotFound(id))?;
        if let Err(e) = inner
            .table
            .publish(id, &codec::tombstone(), PublishMode::MustExist)
        {
            warn!(id, "failed to clear filter slot, evicting rule anyway: {e}");
        }
        self.metrics.active_rules.set(inner.rules.len() as i64);

        info!(id, "rule removed");
        Ok(rule)
    }

    fn set_enabled(&self, id: u32, enabled: bool) -> Result<FilterRule, StoreError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let mut rule = inner
            .rules
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        rule.enabled = enabled;

        inner
            .table
            .publish(id, &codec::encode(&rule), PublishMode::MustExist)?;
        inner.rules.insert(id, rule.clone());

        info!(id, enabled, "rule toggled");
        Ok(rule)
    }

    fn record(&self, op: RuleOp, result: &Result<FilterRule, StoreError>) {
        let outcome = match result {
            Ok(_) => Outcome::Ok,
            Err(StoreError::Publish(_)) => Outcome::PublishFailed,
            Err(_) => Outcome::Rejected,
        };
        self.metrics.record_rule_op(op, outcome);
    }
}

fn check_range(id: u32) -> Result<(), StoreError> {
    if id >= RULE_CAPACITY {
        return Err(StoreError::IdOutOfRange {
            id,
            capacity: RULE_CAPACITY,
        });
    }
    Ok(())
}
