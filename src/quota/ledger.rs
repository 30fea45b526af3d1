//! Per-tenant quota ledger.
//!
//! Every (tenant, quota name) pair has its own entry behind its own mutex, so
//! admission for one pair never waits on another. The map of entries is only
//! locked long enough to find or insert an entry handle.
//!
//! Usage lives in memory only; it is rebuilt from live mappings at startup.
//! Limits set through [`QuotaLedger::update`] are persisted in the
//! `QuotaLimits` collection.

use crate::core::error::{WardenError, WardenResult};
use crate::quota::limit::{LimitRecord, QuotaDetails, QuotaKind, QuotaLimit};
use crate::storage::{encode, load_all, Collection, EntityStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    /// Create quotas with unknown names on update instead of rejecting them.
    pub allow_custom_names: bool,
    /// Limits reported for quotas a tenant has not configured.
    pub defaults: BTreeMap<String, QuotaLimit>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            allow_custom_names: true,
            defaults: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    /// Explicitly configured limit; falls back to the policy default.
    limit: Option<QuotaLimit>,
    usage: u64,
    /// Store version of the persisted limit.
    version: Option<u64>,
}

type EntryRef = Arc<Mutex<Entry>>;

/// Tenants with an update in flight, released on drop.
struct UpdateClaim<'a> {
    ledger: &'a QuotaLedger,
    tenant_id: String,
}

impl Drop for UpdateClaim<'_> {
    fn drop(&mut self) {
        self.ledger.updating.lock().remove(&self.tenant_id);
    }
}

/// Limit change applied in memory, kept for revert.
struct AppliedChange {
    name: String,
    entry: EntryRef,
    previous_limit: Option<QuotaLimit>,
    previous_version: Option<u64>,
    new_limit: QuotaLimit,
}

/// Quota ledger.
pub struct QuotaLedger {
    entries: RwLock<HashMap<String, HashMap<String, EntryRef>>>,
    updating: Mutex<HashSet<String>>,
    policy: QuotaPolicy,
    store: Arc<dyn EntityStore>,
}

impl QuotaLedger {
    /// Create a ledger.
    pub fn new(store: Arc<dyn EntityStore>, policy: QuotaPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            updating: Mutex::new(HashSet::new()),
            policy,
            store,
        }
    }

    /// Ledger configuration.
    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Load persisted limits. Returns the number of limits loaded.
    pub fn restore_limits(&self) -> WardenResult<usize> {
        let records: Vec<(LimitRecord, u64)> =
            load_all(self.store.as_ref(), Collection::QuotaLimits)?;
        for (record, version) in &records {
            let limit = QuotaLimit::from_wire(record.limit).map_err(|reason| {
                WardenError::storage(format!(
                    "stored limit for {}: {}",
                    LimitRecord::key(&record.tenant_id, &record.name),
                    reason
                ))
            })?;
            let entry = self.entry(&record.tenant_id, &record.name);
            let mut entry = entry.lock();
            entry.limit = Some(limit);
            entry.version = Some(*version);
        }
        tracing::info!(limits = records.len(), "restored quota limits");
        Ok(records.len())
    }

    /// Count usage held by a resource that already existed at startup.
    ///
    /// Unlike [`check_and_reserve`](Self::check_and_reserve) this does not
    /// consult the limit: the resource exists whatever the limit says now.
    pub fn restore_usage(&self, tenant_id: &str, name: &str, amount: u64) {
        let entry = self.entry(tenant_id, name);
        entry.lock().usage += amount;
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Atomically check headroom and add `amount` to usage.
    pub fn check_and_reserve(&self, tenant_id: &str, name: &str, amount: u64) -> WardenResult<()> {
        if QuotaKind::of(name) == QuotaKind::LimitOnly {
            return Err(WardenError::InvalidQuota {
                name: name.to_string(),
                reason: "limit-only quotas carry no usage".to_string(),
            });
        }

        let entry = self.entry(tenant_id, name);
        let mut entry = entry.lock();
        let limit = self.effective_limit(name, &entry);
        let wanted = entry.usage.saturating_add(amount);
        if !limit.admits(wanted) {
            return Err(WardenError::QuotaExceeded {
                tenant_id: tenant_id.to_string(),
                quota: name.to_string(),
                limit: limit.ceiling(),
                usage: entry.usage,
                requested: amount,
            });
        }
        entry.usage = wanted;
        Ok(())
    }

    /// Return `amount` to the tenant. Usage never drops below zero.
    pub fn release(&self, tenant_id: &str, name: &str, amount: u64) {
        let Some(entry) = self.lookup(tenant_id, name) else {
            tracing::warn!(tenant_id, quota = name, amount, "release of untracked quota");
            return;
        };
        let mut entry = entry.lock();
        if entry.usage < amount {
            tracing::warn!(
                tenant_id,
                quota = name,
                usage = entry.usage,
                amount,
                "quota release exceeds usage"
            );
        }
        entry.usage = entry.usage.saturating_sub(amount);
    }

    /// Check a single value against a limit-only quota.
    pub fn check_limit(&self, tenant_id: &str, name: &str, value: u64) -> WardenResult<()> {
        let limit = self.limit(tenant_id, name);
        if limit.admits(value) {
            Ok(())
        } else {
            Err(WardenError::QuotaExceeded {
                tenant_id: tenant_id.to_string(),
                quota: name.to_string(),
                limit: limit.ceiling(),
                usage: 0,
                requested: value,
            })
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current usage.
    pub fn usage(&self, tenant_id: &str, name: &str) -> u64 {
        self.lookup(tenant_id, name)
            .map(|e| e.lock().usage)
            .unwrap_or(0)
    }

    /// Effective limit.
    pub fn limit(&self, tenant_id: &str, name: &str) -> QuotaLimit {
        match self.lookup(tenant_id, name) {
            Some(entry) => self.effective_limit(name, &entry.lock()),
            None => self.default_limit(name),
        }
    }

    /// Snapshot of every quota known for the tenant, ordered by name.
    ///
    /// Includes policy defaults the tenant never touched.
    pub fn list(&self, tenant_id: &str) -> Vec<QuotaDetails> {
        let handles: Vec<(String, EntryRef)> = self
            .entries
            .read()
            .get(tenant_id)
            .map(|names| names.iter().map(|(n, e)| (n.clone(), e.clone())).collect())
            .unwrap_or_default();

        let mut details: BTreeMap<String, QuotaDetails> = self
            .policy
            .defaults
            .iter()
            .map(|(name, limit)| (name.clone(), Self::details(name, *limit, 0)))
            .collect();
        for (name, entry) in handles {
            let entry = entry.lock();
            let limit = self.effective_limit(&name, &entry);
            details.insert(name.clone(), Self::details(&name, limit, entry.usage));
        }
        details.into_values().collect()
    }

    /// Tenants with any ledger entry.
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.entries.read().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Replace limits for the named quotas.
    ///
    /// The whole batch is validated before any limit changes. A finite limit
    /// below current usage is rejected, as are unknown names unless the
    /// policy allows custom names. Usage is never touched. Concurrent
    /// updates for the same tenant fail with `Conflict`.
    pub fn update(&self, tenant_id: &str, quotas: &[QuotaDetails]) -> WardenResult<()> {
        let mut seen = HashSet::new();
        for quota in quotas {
            if quota.name.is_empty() {
                return Err(WardenError::InvalidQuota {
                    name: quota.name.clone(),
                    reason: "empty name".to_string(),
                });
            }
            if !seen.insert(quota.name.as_str()) {
                return Err(WardenError::InvalidQuota {
                    name: quota.name.clone(),
                    reason: "listed twice".to_string(),
                });
            }
            if !self.policy.allow_custom_names
                && !self.policy.defaults.contains_key(&quota.name)
                && self.lookup(tenant_id, &quota.name).is_none()
            {
                return Err(WardenError::InvalidQuota {
                    name: quota.name.clone(),
                    reason: "unknown quota".to_string(),
                });
            }
        }
        if quotas.is_empty() {
            return Ok(());
        }

        let _claim = self.claim_update(tenant_id)?;
        let applied = self.apply_limits(tenant_id, quotas)?;

        let mut persisted: Vec<(&AppliedChange, u64)> = Vec::with_capacity(applied.len());
        for change in &applied {
            match self.persist_limit(tenant_id, change) {
                Ok(version) => persisted.push((change, version)),
                Err(e) => {
                    tracing::warn!(
                        tenant_id,
                        quota = %change.name,
                        error = %e,
                        "quota limit persist failed, reverting update"
                    );
                    self.revert(tenant_id, &applied, &persisted);
                    return Err(e);
                }
            }
        }

        for (change, version) in &persisted {
            change.entry.lock().version = Some(*version);
        }
        tracing::info!(tenant_id, quotas = applied.len(), "quota limits updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn details(name: &str, limit: QuotaLimit, usage: u64) -> QuotaDetails {
        QuotaDetails {
            name: name.to_string(),
            limit,
            usage: match QuotaKind::of(name) {
                QuotaKind::Counted => Some(usage),
                QuotaKind::LimitOnly => None,
            },
        }
    }

    fn default_limit(&self, name: &str) -> QuotaLimit {
        self.policy.defaults.get(name).copied().unwrap_or_default()
    }

    fn effective_limit(&self, name: &str, entry: &Entry) -> QuotaLimit {
        entry.limit.unwrap_or_else(|| self.default_limit(name))
    }

    fn lookup(&self, tenant_id: &str, name: &str) -> Option<EntryRef> {
        self.entries
            .read()
            .get(tenant_id)
            .and_then(|names| names.get(name))
            .cloned()
    }

    fn entry(&self, tenant_id: &str, name: &str) -> EntryRef {
        if let Some(entry) = self.lookup(tenant_id, name) {
            return entry;
        }
        self.entries
            .write()
            .entry(tenant_id.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn claim_update(&self, tenant_id: &str) -> WardenResult<UpdateClaim<'_>> {
        if !self.updating.lock().insert(tenant_id.to_string()) {
            return Err(WardenError::Conflict {
                key: format!("quotas/{}", tenant_id),
                expected: None,
                found: None,
            });
        }
        Ok(UpdateClaim {
            ledger: self,
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Validate against usage and set the new limits, holding every affected
    /// entry lock at once. Entries are locked in name order.
    fn apply_limits(&self, tenant_id: &str, quotas: &[QuotaDetails]) -> WardenResult<Vec<AppliedChange>> {
        let mut ordered: Vec<&QuotaDetails> = quotas.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        let handles: Vec<EntryRef> = ordered.iter().map(|q| self.entry(tenant_id, &q.name)).collect();
        let mut guards: Vec<_> = handles.iter().map(|h| h.lock()).collect();

        for (quota, guard) in ordered.iter().zip(guards.iter()) {
            if QuotaKind::of(&quota.name) == QuotaKind::Counted && !quota.limit.admits(guard.usage) {
                return Err(WardenError::InvalidQuota {
                    name: quota.name.clone(),
                    reason: format!("limit {} is below current usage {}", quota.limit, guard.usage),
                });
            }
        }

        let mut applied = Vec::with_capacity(ordered.len());
        for ((quota, guard), handle) in ordered.iter().zip(guards.iter_mut()).zip(handles.iter()) {
            applied.push(AppliedChange {
                name: quota.name.clone(),
                entry: handle.clone(),
                previous_limit: guard.limit,
                previous_version: guard.version,
                new_limit: quota.limit,
            });
            guard.limit = Some(quota.limit);
        }
        Ok(applied)
    }

    fn persist_limit(&self, tenant_id: &str, change: &AppliedChange) -> WardenResult<u64> {
        let record = LimitRecord {
            tenant_id: tenant_id.to_string(),
            name: change.name.clone(),
            limit: change.new_limit.to_wire(),
        };
        self.store.compare_and_swap(
            Collection::QuotaLimits,
            &LimitRecord::key(tenant_id, &change.name),
            change.previous_version,
            Some(encode(&record)?),
        )
    }

    fn revert(&self, tenant_id: &str, applied: &[AppliedChange], persisted: &[(&AppliedChange, u64)]) {
        for change in applied {
            let stored = persisted
                .iter()
                .find(|(p, _)| p.name == change.name)
                .map(|(_, version)| *version);

            let mut entry = change.entry.lock();
            if let Some(version) = stored {
                match self.restore_stored_limit(tenant_id, change, version) {
                    Ok(restored) => entry.version = restored,
                    Err(e) => {
                        tracing::error!(
                            tenant_id,
                            quota = %change.name,
                            error = %e,
                            "failed to restore stored quota limit"
                        );
                        entry.version = Some(version);
                        continue;
                    }
                }
            }

            let previous = change
                .previous_limit
                .unwrap_or_else(|| self.default_limit(&change.name));
            if QuotaKind::of(&change.name) == QuotaKind::Counted && !previous.admits(entry.usage) {
                // Reservations admitted under the new limit no longer fit the old one.
                tracing::warn!(
                    tenant_id,
                    quota = %change.name,
                    usage = entry.usage,
                    "keeping unpersisted quota limit"
                );
                continue;
            }
            entry.limit = change.previous_limit;
        }
    }

    /// Put the stored limit back to its value before the update. Returns the
    /// version now stored, if any.
    fn restore_stored_limit(&self, tenant_id: &str, change: &AppliedChange, version: u64) -> WardenResult<Option<u64>> {
        let key = LimitRecord::key(tenant_id, &change.name);
        match change.previous_limit {
            Some(limit) => {
                let record = LimitRecord {
                    tenant_id: tenant_id.to_string(),
                    name: change.name.clone(),
                    limit: limit.to_wire(),
                };
                let restored = self.store.compare_and_swap(
                    Collection::QuotaLimits,
                    &key,
                    Some(version),
                    Some(encode(&record)?),
                )?;
                Ok(Some(restored))
            }
            None => {
                self.store
                    .compare_and_swap(Collection::QuotaLimits, &key, Some(version), None)?;
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("tenants", &self.entries.read().len())
            .field("policy", &self.policy)
            .finish()
    }
}
