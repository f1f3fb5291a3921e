//! Position/ordering engine.
//!
//! The only writer of `order`. Every structural mutation on a group runs
//! under that group's lock, reads the group, plans one [`GroupWrite`] (the
//! shifts plus the item itself) and commits it atomically:
//!
//! ```text
//!  insert at p     siblings[p..]      +1, item at p
//!  move a→b (a>b)  siblings[b..a-1]   +1, item at b
//!  move a→b (a<b)  siblings[a+1..b]   -1, item at b
//!  move across     old[a+1..] -1,     new[b..] +1
//!  delete at a     siblings[a+1..]    -1, item inactive
//!  reorder         every item to its index in the supplied list
//! ```
//!
//! Each shifted sibling is written as a compare-and-swap on the version and
//! order that was read. If a writer outside the engine touched a sibling in
//! between, the commit fails as stale and the whole operation is replanned
//! from a fresh read, up to `max_drift_retries` times.
//!
//! Single-item mutations carry the `expected_version` the caller last saw;
//! a mismatch fails with a [`ConflictError`] holding the stored item and
//! nothing is written.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pagesync_core::{
    is_contiguous, require_admin, require_user, sanitize_value, AuthorizationError,
    ConflictError, EventKind, GroupKey, IdentityProvider, InvariantViolation, ItemKind,
    MoveTarget, MutationReply, MutationRequest, PositionedItem, RealtimeEvent, RejectReason,
    ValidationError,
};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::storage::{GroupWrite, ItemStore, StoreError};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Replans after a stale sibling before giving up
    pub max_drift_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_drift_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("item `{0}` not found")]
    NotFound(String),
    #[error("item `{0}` already exists")]
    AlreadyExists(String),
    #[error("item `{0}` has been deleted")]
    Inactive(String),
    #[error("group {group} kept changing underneath {attempts} attempts")]
    Drift { group: String, attempts: u32 },
}

impl EngineError {
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            EngineError::Validation(_) => RejectReason::Validation,
            EngineError::Authorization(_) => RejectReason::Authorization,
            EngineError::Invariant(_) => RejectReason::Invariant,
            EngineError::NotFound(_) | EngineError::Inactive(_) => RejectReason::NotFound,
            EngineError::AlreadyExists(_) | EngineError::Conflict(_) => RejectReason::InvalidRequest,
            EngineError::Store(_) | EngineError::Drift { .. } => RejectReason::Internal,
        }
    }

    /// Reply for the mutating caller.
    pub fn into_reply(self) -> MutationReply {
        match self {
            EngineError::Conflict(conflict) => conflict.into(),
            other => MutationReply::rejected(other.reject_reason(), other.to_string()),
        }
    }
}

/// One async mutex per group. Cross-group work locks in key order.
#[derive(Default)]
pub struct GroupLocks {
    locks: parking_lot::Mutex<HashMap<GroupKey, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, group: &GroupKey) -> Arc<Mutex<()>> {
        self.locks.lock().entry(group.clone()).or_default().clone()
    }

    pub async fn lock(&self, group: &GroupKey) -> OwnedMutexGuard<()> {
        self.handle(group).lock_owned().await
    }

    /// Lock every distinct group, always in sorted order.
    pub async fn lock_many(&self, groups: &[GroupKey]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted = groups.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for group in &sorted {
            guards.push(self.lock(group).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A committed mutation: the event to log and fan out, plus every row it
/// wrote (item first, then shifted siblings).
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub event: RealtimeEvent,
    pub items: Vec<PositionedItem>,
}

/// A [`MutationOutcome`] holding the locks of the groups it wrote.
pub struct LockedOutcome {
    pub outcome: MutationOutcome,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockedOutcome {
    fn new(outcome: MutationOutcome, guards: Vec<OwnedMutexGuard<()>>) -> Self {
        Self {
            outcome,
            _guards: guards,
        }
    }
}

impl std::fmt::Debug for LockedOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedOutcome")
            .field("outcome", &self.outcome)
            .field("groups_held", &self._guards.len())
            .finish()
    }
}

pub struct PositionEngine {
    store: Arc<dyn ItemStore>,
    locks: GroupLocks,
    config: EngineConfig,
}

impl PositionEngine {
    pub fn new(store: Arc<dyn ItemStore>, config: EngineConfig) -> Self {
        Self {
            store,
            locks: GroupLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    pub fn fetch_group(&self, group: &GroupKey) -> Result<Vec<PositionedItem>, EngineError> {
        Ok(self.store.fetch_group(group)?)
    }

    pub fn get_item(&self, id: &str) -> Result<Option<PositionedItem>, EngineError> {
        Ok(self.store.get_item(id)?)
    }

    /// Fail unless the group's active orders are exactly `0..n`.
    pub fn verify_group(&self, group: &GroupKey) -> Result<(), EngineError> {
        let items = self.store.fetch_group(group)?;
        if is_contiguous(&items) {
            Ok(())
        } else {
            Err(InvariantViolation::NonContiguous {
                group: group.to_string(),
                orders: items.iter().map(|i| i.order).collect(),
            }
            .into())
        }
    }

    /// Authorize, plan and commit one mutation.
    pub async fn apply(
        &self,
        identity: &dyn IdentityProvider,
        request: MutationRequest,
    ) -> Result<MutationOutcome, EngineError> {
        let locked = self.apply_locked(identity, request).await?;
        Ok(locked.outcome)
    }

    /// Like [`apply`](Self::apply), but the touched groups stay locked until
    /// the returned value is dropped. Whatever the caller does with the
    /// event in the meantime happens in commit order for those groups.
    pub async fn apply_locked(
        &self,
        identity: &dyn IdentityProvider,
        request: MutationRequest,
    ) -> Result<LockedOutcome, EngineError> {
        let actor = require_user(identity)?;
        match request {
            MutationRequest::Insert {
                group,
                position,
                kind,
                item_type,
                payload,
                item_id,
            } => {
                if kind == ItemKind::Navigation {
                    require_admin(identity)?;
                }
                let draft = Draft {
                    id: item_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    kind,
                    item_type,
                    payload,
                };
                self.insert(&actor, group, position, draft).await
            }
            MutationRequest::Move {
                item_id,
                expected_version,
                target,
                position,
            } => {
                let current = self.load_active(&item_id)?;
                authorize_kind(identity, current.kind)?;
                self.move_item(&actor, current, expected_version, target, position)
                    .await
            }
            MutationRequest::Update {
                item_id,
                expected_version,
                patch,
            } => {
                let current = self.load_active(&item_id)?;
                authorize_kind(identity, current.kind)?;
                self.update(&actor, current, expected_version, patch).await
            }
            MutationRequest::Delete {
                item_id,
                expected_version,
            } => {
                let current = self.load_active(&item_id)?;
                authorize_kind(identity, current.kind)?;
                self.delete(&actor, current, expected_version).await
            }
            MutationRequest::Reorder { group, ordered_ids } => {
                require_admin(identity)?;
                self.reorder(&actor, group, ordered_ids).await
            }
        }
    }

    // ─── Operations ───────────────────────────────────────────────────────

    async fn insert(
        &self,
        actor: &str,
        group: GroupKey,
        position: u32,
        draft: Draft,
    ) -> Result<LockedOutcome, EngineError> {
        check_group(&group)?;
        if draft.id.trim().is_empty() {
            return Err(ValidationError::EmptyField("itemId").into());
        }
        if draft.item_type.trim().is_empty() {
            return Err(ValidationError::EmptyField("itemType").into());
        }
        let payload = sanitize_map(&draft.payload);

        let guard = self.locks.lock(&group).await;
        let (item, shifted) = self.retry_on_drift(&group, || {
            if self.store.get_item(&draft.id)?.is_some() {
                return Err(EngineError::AlreadyExists(draft.id.clone()));
            }
            let siblings = self.store.fetch_group(&group)?;
            let position = position.min(siblings.len() as u32);

            let mut write = GroupWrite::new();
            let shifted = write.shift_range(&siblings, position, u32::MAX, 1);
            let item = PositionedItem::new(
                draft.id.as_str(),
                draft.kind,
                draft.item_type.as_str(),
                &group,
                position,
                payload.clone(),
                actor,
            );
            write.insert(item.clone());
            self.commit(write)?;
            Ok((item, shifted))
        })?;

        let data = match item.kind {
            ItemKind::Component => json!({
                "componentId": item.id,
                "componentType": item.item_type,
                "position": item.order,
                "props": item.payload,
                "sectionId": item.section_id,
                "parentId": item.parent_id,
                "item": item,
                "shifted": shifted_orders(&shifted),
            }),
            ItemKind::Navigation => nav_data(&item, &shifted, "update"),
        };
        let outcome = self.outcome(event_kind(item.kind, EventKind::ComponentAdd), item, shifted, data);
        Ok(LockedOutcome::new(outcome, vec![guard]))
    }

    async fn move_item(
        &self,
        actor: &str,
        current: PositionedItem,
        expected_version: u64,
        target: Option<MoveTarget>,
        position: u32,
    ) -> Result<LockedOutcome, EngineError> {
        let source = current.group();
        let dest = match target {
            Some(target) => GroupKey {
                page_id: current.page_id.clone(),
                section_id: target.section_id,
                parent_id: target.parent_id,
            },
            None => source.clone(),
        };
        check_group(&dest)?;
        if dest.parent_id.as_deref() == Some(current.id.as_str()) {
            return Err(ValidationError::InvalidField {
                field: "parentId",
                reason: "an item cannot be its own parent".to_string(),
            }
            .into());
        }

        let guards = self.locks.lock_many(&[source.clone(), dest.clone()]).await;
        let (moved, old_order, shifted) = self.retry_on_drift(&source, || {
            let current = self.load_active(&current.id)?;
            check_version(&current, expected_version)?;

            let mut write = GroupWrite::new();
            let mut moved = current.clone();
            let shifted = if dest == source {
                let siblings: Vec<PositionedItem> = self
                    .store
                    .fetch_group(&source)?
                    .into_iter()
                    .filter(|s| s.id != current.id)
                    .collect();
                let old = current.order;
                let new = position.min(siblings.len() as u32);
                moved.order = new;
                if new < old {
                    write.shift_range(&siblings, new, old - 1, 1)
                } else if new > old {
                    write.shift_range(&siblings, old + 1, new, -1)
                } else {
                    Vec::new()
                }
            } else {
                let left: Vec<PositionedItem> = self
                    .store
                    .fetch_group(&source)?
                    .into_iter()
                    .filter(|s| s.id != current.id)
                    .collect();
                let joined = self.store.fetch_group(&dest)?;
                let new = position.min(joined.len() as u32);
                let mut shifted = write.shift_range(&left, current.order + 1, u32::MAX, -1);
                shifted.extend(write.shift_range(&joined, new, u32::MAX, 1));
                moved.set_group(&dest);
                moved.order = new;
                shifted
            };
            moved.touch(actor);
            write.compare_and_swap(&current, moved.clone());
            self.commit(write)?;
            Ok((moved, current.order, shifted))
        })?;

        let data = match moved.kind {
            ItemKind::Component => json!({
                "componentId": moved.id,
                "oldPosition": old_order,
                "newPosition": moved.order,
                "fromSectionId": source.section_id,
                "sectionId": moved.section_id,
                "parentId": moved.parent_id,
                "item": moved,
                "shifted": shifted_orders(&shifted),
            }),
            ItemKind::Navigation => nav_data(&moved, &shifted, "reorder"),
        };
        let outcome = self.outcome(event_kind(moved.kind, EventKind::ComponentMove), moved, shifted, data);
        Ok(LockedOutcome::new(outcome, guards))
    }

    async fn delete(
        &self,
        actor: &str,
        current: PositionedItem,
        expected_version: u64,
    ) -> Result<LockedOutcome, EngineError> {
        let group = current.group();
        let guard = self.locks.lock(&group).await;
        let (deleted, old_order, shifted) = self.retry_on_drift(&group, || {
            let current = self.load_active(&current.id)?;
            check_version(&current, expected_version)?;

            let siblings: Vec<PositionedItem> = self
                .store
                .fetch_group(&group)?
                .into_iter()
                .filter(|s| s.id != current.id)
                .collect();
            let mut write = GroupWrite::new();
            let shifted = write.shift_range(&siblings, current.order + 1, u32::MAX, -1);
            let mut deleted = current.clone();
            deleted.is_active = false;
            deleted.touch(actor);
            write.compare_and_swap(&current, deleted.clone());
            self.commit(write)?;
            Ok((deleted, current.order, shifted))
        })?;

        let data = match deleted.kind {
            ItemKind::Component => json!({
                "componentId": deleted.id,
                "position": old_order,
                "componentType": deleted.item_type,
                "sectionId": deleted.section_id,
                "parentId": deleted.parent_id,
                "item": deleted,
                "shifted": shifted_orders(&shifted),
            }),
            ItemKind::Navigation => nav_data(&deleted, &shifted, "update"),
        };
        let outcome = self.outcome(event_kind(deleted.kind, EventKind::ComponentDelete), deleted, shifted, data);
        Ok(LockedOutcome::new(outcome, vec![guard]))
    }

    /// Field-level merge into `payload`; a `null` value removes the field.
    async fn update(
        &self,
        actor: &str,
        current: PositionedItem,
        expected_version: u64,
        patch: Map<String, Value>,
    ) -> Result<LockedOutcome, EngineError> {
        if patch.is_empty() {
            return Err(ValidationError::EmptyField("patch").into());
        }
        let patch = sanitize_map(&patch);
        let group = current.group();
        let guard = self.locks.lock(&group).await;

        let before = self.load_active(&current.id)?;
        check_version(&before, expected_version)?;
        let updated = match self.store.compare_and_swap(
            &before.id,
            expected_version,
            &|item: &mut PositionedItem| {
                merge_patch(&mut item.payload, &patch);
                item.touch(actor);
            },
        ) {
            Ok(updated) => updated,
            Err(StoreError::Stale { .. }) => {
                let now = self.load_active(&before.id)?;
                return Err(ConflictError::new(now, expected_version).into());
            }
            Err(StoreError::NotFound(id)) => return Err(EngineError::NotFound(id)),
            Err(err) => return Err(err.into()),
        };

        let (kind, data) = match updated.kind {
            ItemKind::Component => (
                EventKind::ContentChange,
                json!({
                    "contentKey": updated.id,
                    "oldValue": before.payload,
                    "newValue": updated.payload,
                    "contentType": "props",
                    "item": updated,
                }),
            ),
            ItemKind::Navigation => (EventKind::NavUpdate, nav_data(&updated, &[], "update")),
        };
        Ok(LockedOutcome::new(self.outcome(kind, updated, Vec::new(), data), vec![guard]))
    }

    /// Assign every active item of `group` its index in `ordered_ids`. An
    /// empty list for an empty group commits nothing and returns no items.
    async fn reorder(
        &self,
        actor: &str,
        group: GroupKey,
        ordered_ids: Vec<String>,
    ) -> Result<LockedOutcome, EngineError> {
        check_group(&group)?;
        let duplicates = duplicate_ids(&ordered_ids);
        if !duplicates.is_empty() {
            return Err(InvariantViolation::DuplicateIds {
                group: group.to_string(),
                ids: duplicates,
            }
            .into());
        }

        let guard = self.locks.lock(&group).await;
        let (items, previous) = self.retry_on_drift(&group, || {
            let siblings = self.store.fetch_group(&group)?;
            check_same_set(&group, &siblings, &ordered_ids)?;

            let by_id: HashMap<&str, &PositionedItem> =
                siblings.iter().map(|s| (s.id.as_str(), s)).collect();
            let mut write = GroupWrite::new();
            let mut items = Vec::with_capacity(ordered_ids.len());
            let mut previous = Vec::with_capacity(ordered_ids.len());
            for (index, id) in ordered_ids.iter().enumerate() {
                let Some(sibling) = by_id.get(id.as_str()) else {
                    continue;
                };
                let mut next = (*sibling).clone();
                next.order = index as u32;
                next.touch(actor);
                write.compare_and_swap(sibling, next.clone());
                previous.push(sibling.order);
                items.push(next);
            }
            self.commit(write)?;
            Ok((items, previous))
        })?;

        let version = items.iter().map(|i| i.version).max().unwrap_or(0);
        let item_kind = items.first().map_or(ItemKind::Component, |i| i.kind);
        let (kind, data) = match item_kind {
            ItemKind::Component => (
                EventKind::ComponentMove,
                Value::Array(
                    items
                        .iter()
                        .zip(&previous)
                        .map(|(item, old)| {
                            json!({
                                "componentId": item.id,
                                "oldPosition": old,
                                "newPosition": item.order,
                                "item": item,
                            })
                        })
                        .collect(),
                ),
            ),
            ItemKind::Navigation => (
                EventKind::NavUpdate,
                json!({
                    "items": items,
                    "changeType": "reorder",
                    "affectedItemIds": ordered_ids,
                }),
            ),
        };
        let event = RealtimeEvent::new(kind, group.page_id.as_str(), actor, version, data);
        Ok(LockedOutcome::new(MutationOutcome { event, items }, vec![guard]))
    }

    // ─── Helpers ──────────────────────────────────────────────────────────

    fn load_active(&self, id: &str) -> Result<PositionedItem, EngineError> {
        match self.store.get_item(id)? {
            Some(item) if item.is_active => Ok(item),
            Some(_) => Err(EngineError::Inactive(id.to_string())),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    fn commit(&self, write: GroupWrite) -> Result<(), EngineError> {
        match self.store.commit(write) {
            Ok(()) => Ok(()),
            Err(StoreError::Duplicate(id)) => Err(EngineError::AlreadyExists(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Run `plan` until it commits without a stale row. A stale target item
    /// surfaces as a conflict on the next pass through its version check.
    fn retry_on_drift<T>(
        &self,
        group: &GroupKey,
        mut plan: impl FnMut() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match plan() {
                Err(EngineError::Store(StoreError::Stale { item_id })) => {
                    log::debug!(
                        "group {} drifted at item {} (attempt {})",
                        group,
                        item_id,
                        attempts
                    );
                    if attempts > self.config.max_drift_retries {
                        log::warn!("giving up on group {} after {} attempts", group, attempts);
                        return Err(EngineError::Drift {
                            group: group.to_string(),
                            attempts,
                        });
                    }
                }
                other => return other,
            }
        }
    }

    fn outcome(
        &self,
        kind: EventKind,
        item: PositionedItem,
        shifted: Vec<PositionedItem>,
        data: Value,
    ) -> MutationOutcome {
        let event = RealtimeEvent::new(
            kind,
            item.page_id.as_str(),
            item.last_modified_by.as_str(),
            item.version,
            data,
        );
        let mut items = Vec::with_capacity(shifted.len() + 1);
        items.push(item);
        items.extend(shifted);
        MutationOutcome { event, items }
    }
}

struct Draft {
    id: String,
    kind: ItemKind,
    item_type: String,
    payload: Map<String, Value>,
}

fn authorize_kind(identity: &dyn IdentityProvider, kind: ItemKind) -> Result<(), EngineError> {
    if kind == ItemKind::Navigation {
        require_admin(identity)?;
    }
    Ok(())
}

fn check_group(group: &GroupKey) -> Result<(), ValidationError> {
    if group.page_id.trim().is_empty() {
        return Err(ValidationError::EmptyField("pageId"));
    }
    if group.section_id.trim().is_empty() {
        return Err(ValidationError::EmptyField("sectionId"));
    }
    Ok(())
}

fn check_version(current: &PositionedItem, expected_version: u64) -> Result<(), ConflictError> {
    if current.version == expected_version {
        Ok(())
    } else {
        Err(ConflictError::new(current.clone(), expected_version))
    }
}

/// Navigation items emit `nav_update` for every structural change.
fn event_kind(kind: ItemKind, component_kind: EventKind) -> EventKind {
    match kind {
        ItemKind::Component => component_kind,
        ItemKind::Navigation => EventKind::NavUpdate,
    }
}

fn nav_data(item: &PositionedItem, shifted: &[PositionedItem], change_type: &str) -> Value {
    json!({
        "items": [item],
        "changeType": change_type,
        "affectedItemIds": [item.id],
        "shifted": shifted_orders(shifted),
    })
}

fn shifted_orders(shifted: &[PositionedItem]) -> Value {
    Value::Array(
        shifted
            .iter()
            .map(|s| json!({ "id": s.id, "order": s.order }))
            .collect(),
    )
}

fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    match sanitize_value(&Value::Object(map.clone())) {
        Value::Object(clean) => clean,
        _ => Map::new(),
    }
}

fn merge_patch(payload: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            payload.remove(key);
        } else {
            payload.insert(key.clone(), value.clone());
        }
    }
}

fn duplicate_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates: Vec<String> = ids
        .iter()
        .filter(|id| !seen.insert(id.as_str()))
        .cloned()
        .collect();
    duplicates.sort();
    duplicates.dedup();
    duplicates
}

fn check_same_set(
    group: &GroupKey,
    active: &[PositionedItem],
    ordered_ids: &[String],
) -> Result<(), InvariantViolation> {
    let active_ids: HashSet<&str> = active.iter().map(|i| i.id.as_str()).collect();
    let listed: HashSet<&str> = ordered_ids.iter().map(String::as_str).collect();

    let mut foreign: Vec<String> = listed
        .difference(&active_ids)
        .map(|id| id.to_string())
        .collect();
    if !foreign.is_empty() {
        foreign.sort();
        return Err(InvariantViolation::ForeignIds {
            group: group.to_string(),
            ids: foreign,
        });
    }
    let mut missing: Vec<String> = active_ids
        .difference(&listed)
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(InvariantViolation::MissingIds {
            group: group.to_string(),
            ids: missing,
        });
    }
    Ok(())
}
