//! Server-authoritative replication with client-side prediction.
//!
//! The server marks changed instances dirty and periodically flushes them as
//! a [`ReplicationDelta`]. Clients apply requests locally right away inside a
//! prediction (a snapshot of the inventory), then either keep the result when
//! the server acknowledges it or restore the snapshot when it does not.

use std::collections::BTreeMap;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use suspense_common::{
    unix_millis, ActorId, InstanceId, InventoryId, InventoryResultCode, ItemId, PredictionId,
    Rotation,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::authority::AuthorityGate;
use crate::component::{InventoryComponent, InventoryError, InventoryResult};
use crate::constraints::ValidatedOperation;
use crate::events::InventoryEvent;
use crate::item::{ItemInstance, WeaponState};
use crate::operation::OperationRecord;
use crate::registry::InventoryRegistry;
use crate::snapshot::InventorySnapshot;
use crate::wire::{encode_frame, ReplicationMessage, WireError};

/// Default cap on unresolved predictions.
pub const DEFAULT_MAX_PENDING_PREDICTIONS: usize = 32;

const FLAG_WEAPON_STATE: u8 = 1;

/// Replication errors.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Inventory handle does not resolve
    #[error("Inventory {0} not found")]
    InventoryMissing(InventoryId),

    /// Sending failed
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Applying replicated state failed
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),
}

/// Result type for replication.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Which side of the connection a replicator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationRole {
    /// Owns the authoritative state
    Server,
    /// Mirrors the server and predicts
    Client,
}

/// Compact network form of an [`ItemInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedItem {
    /// Instance ID
    pub instance_id: InstanceId,
    /// Item type
    pub item_id: ItemId,
    /// Stack size
    pub quantity: i32,
    /// Anchor slot, -1 when unplaced
    pub slot_index: i32,
    /// Quarter turns clockwise
    pub rotation: u8,
    /// Bit 0: weapon state present
    pub packed_flags: u8,
    /// Rounds loaded
    pub current_ammo: f32,
    /// Rounds in reserve
    pub reserve_ammo: f32,
    /// Runtime properties
    pub properties: Vec<(String, f32)>,
}

impl ReplicatedItem {
    /// Packs an instance.
    #[must_use]
    pub fn from_instance(item: &ItemInstance) -> Self {
        let weapon = item.weapon_state.unwrap_or_default();
        Self {
            instance_id: item.instance_id,
            item_id: item.item_id.clone(),
            quantity: item.quantity as i32,
            slot_index: item.slot_index.map_or(-1, |s| s as i32),
            rotation: item.rotation.quarter_turns(),
            packed_flags: if item.weapon_state.is_some() {
                FLAG_WEAPON_STATE
            } else {
                0
            },
            current_ammo: weapon.current_ammo,
            reserve_ammo: weapon.reserve_ammo,
            properties: item
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Unpacks into an instance. Grid position is left for placement to fill in.
    #[must_use]
    pub fn to_instance(&self) -> ItemInstance {
        let mut item = ItemInstance::with_id(
            self.instance_id,
            self.item_id.clone(),
            self.quantity.max(0) as u32,
        )
        .with_rotation(Rotation::from_quarter_turns(self.rotation));
        item.slot_index = usize::try_from(self.slot_index).ok();
        if self.packed_flags & FLAG_WEAPON_STATE != 0 {
            item.weapon_state = Some(WeaponState::new(self.current_ammo, self.reserve_ammo));
        }
        item.properties = self.properties.iter().cloned().collect();
        item
    }
}

/// One replicated change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemChange {
    /// Instance the client has not seen yet
    Added(ReplicatedItem),
    /// New state of a known instance
    Updated(ReplicatedItem),
    /// Instance is gone
    Removed(InstanceId),
}

/// Changes since the previous flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationDelta {
    /// Inventory the changes apply to
    pub inventory: InventoryId,
    /// Monotonic flush counter
    pub sequence: u64,
    /// Changes in application order
    pub changes: Vec<ItemChange>,
}

/// Complete inventory state for join or resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStateSync {
    /// Inventory
    pub inventory: InventoryId,
    /// Grid width
    pub grid_width: i32,
    /// Grid height
    pub grid_height: i32,
    /// Weight limit
    pub max_weight: f32,
    /// Last delta sequence included in this state
    pub sequence: u64,
    /// Every instance
    pub items: Vec<ReplicatedItem>,
}

/// Client asks the server to add an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItemRequest {
    /// Client prediction
    pub prediction_id: PredictionId,
    /// Item type
    pub item_id: ItemId,
    /// Units
    pub quantity: u32,
    /// Requested anchor, auto-placed when `None`
    pub target_slot: Option<usize>,
    /// Client-chosen ID, kept by the server
    pub instance_id: InstanceId,
}

/// Client asks the server to remove units of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveItemRequest {
    /// Client prediction
    pub prediction_id: PredictionId,
    /// Instance
    pub instance_id: InstanceId,
    /// Units to remove; the whole stack when it covers the quantity
    pub quantity: u32,
}

/// Client asks the server to move an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveItemRequest {
    /// Client prediction
    pub prediction_id: PredictionId,
    /// Instance
    pub instance_id: InstanceId,
    /// New anchor
    pub to_slot: usize,
}

/// Mutation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Add
    AddItem(AddItemRequest),
    /// Remove
    RemoveItem(RemoveItemRequest),
    /// Move
    MoveItem(MoveItemRequest),
}

impl ClientRequest {
    /// Prediction this request belongs to.
    #[must_use]
    pub const fn prediction_id(&self) -> PredictionId {
        match self {
            Self::AddItem(r) => r.prediction_id,
            Self::RemoveItem(r) => r.prediction_id,
            Self::MoveItem(r) => r.prediction_id,
        }
    }

    /// Operation kind for authority checks.
    #[must_use]
    pub const fn operation(&self) -> ValidatedOperation {
        match self {
            Self::AddItem(_) => ValidatedOperation::Add,
            Self::RemoveItem(_) => ValidatedOperation::Remove,
            Self::MoveItem(_) => ValidatedOperation::Move,
        }
    }

    /// Applies the request to an inventory.
    ///
    /// Client and server share this so that a correct prediction produces the
    /// same state the server ends up with.
    pub fn apply(&self, inventory: &mut InventoryComponent) -> InventoryResult<OperationRecord> {
        match self {
            Self::AddItem(r) => {
                let mut instance = inventory.create_instance(&r.item_id, r.quantity);
                if r.instance_id.is_valid() {
                    instance.instance_id = r.instance_id;
                }
                inventory.add_instance(instance, r.target_slot)
            }
            Self::RemoveItem(r) => {
                let have = inventory
                    .item(r.instance_id)
                    .map(|i| i.quantity)
                    .ok_or(InventoryError::InstanceNotFound(r.instance_id))?;
                if r.quantity == 0 {
                    return Err(InventoryError::InvalidQuantity(0));
                }
                if r.quantity > have {
                    return Err(InventoryError::NotEnough {
                        needed: r.quantity,
                        have,
                    });
                }
                if r.quantity == have {
                    inventory.remove_instance(r.instance_id)
                } else {
                    inventory.set_quantity(r.instance_id, have - r.quantity)
                }
            }
            Self::MoveItem(r) => inventory.move_instance(r.instance_id, r.to_slot),
        }
    }
}

/// Server verdict on a client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionAck {
    /// Prediction being resolved
    pub prediction_id: PredictionId,
    /// Whether the server applied the request
    pub success: bool,
    /// Outcome code
    pub result_code: InventoryResultCode,
    /// Instance affected on the server
    pub instance_id: Option<InstanceId>,
}

/// What the server did with a request.
#[derive(Debug, Clone)]
pub struct ServerResponse {
    /// Ack to send back
    pub ack: PredictionAck,
    /// Record of the applied mutation, for history
    pub record: Option<OperationRecord>,
}

impl ServerResponse {
    fn rejected(prediction_id: PredictionId, code: InventoryResultCode) -> Self {
        Self {
            ack: PredictionAck {
                prediction_id,
                success: false,
                result_code: code,
                instance_id: None,
            },
            record: None,
        }
    }
}

/// Outcome of [`InventoryReplicator::apply_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Changes applied
    Applied,
    /// Sequence already seen
    Stale,
    /// Queued until predictions resolve
    Deferred,
    /// Delta was for another inventory or this is a server
    Ignored,
    /// Some change could not be applied; a full sync is needed
    Desynced,
}

/// Replication counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStats {
    /// Deltas sent
    pub flush_count: u64,
    /// Item changes sent
    pub items_replicated: u64,
    /// Bytes handed to the sink
    pub bytes_sent: u64,
    /// Full syncs built or applied
    pub full_syncs: u64,
    /// Predictions opened
    pub predictions_started: u64,
    /// Predictions confirmed by the server
    pub predictions_confirmed: u64,
    /// Predictions rolled back
    pub predictions_rolled_back: u64,
    /// Time of the last flush (Unix milliseconds)
    pub last_flush_ms: u64,
}

#[derive(Debug, Clone)]
struct PendingPrediction {
    snapshot: InventorySnapshot,
    started_at: u64,
}

/// Transport the replicator writes to.
pub trait ReplicationSink {
    /// Sends one message, returning the number of bytes written.
    fn send(&mut self, message: &ReplicationMessage) -> Result<usize, WireError>;
}

impl ReplicationSink for Vec<u8> {
    fn send(&mut self, message: &ReplicationMessage) -> Result<usize, WireError> {
        let frame = encode_frame(message)?;
        let len = frame.len();
        self.extend(frame);
        Ok(len)
    }
}

impl ReplicationSink for Vec<ReplicationMessage> {
    fn send(&mut self, message: &ReplicationMessage) -> Result<usize, WireError> {
        let len = encode_frame(message)?.len();
        self.push(message.clone());
        Ok(len)
    }
}

impl ReplicationSink for crossbeam_channel::Sender<Vec<u8>> {
    fn send(&mut self, message: &ReplicationMessage) -> Result<usize, WireError> {
        let frame = encode_frame(message)?;
        let len = frame.len();
        crossbeam_channel::Sender::send(self, frame).map_err(|_| WireError::Disconnected)?;
        Ok(len)
    }
}

/// Replication state for one inventory.
#[derive(Debug, Clone)]
pub struct InventoryReplicator {
    inventory: InventoryId,
    role: ReplicationRole,
    dirty: AHashSet<InstanceId>,
    all_dirty: bool,
    replicated: AHashSet<InstanceId>,
    sequence: u64,
    pending: BTreeMap<PredictionId, PendingPrediction>,
    deferred: Vec<ReplicationDelta>,
    max_pending: usize,
    needs_full_sync: bool,
    stats: ReplicationStats,
}

impl InventoryReplicator {
    /// Creates a replicator for `inventory`.
    #[must_use]
    pub fn new(inventory: InventoryId, role: ReplicationRole) -> Self {
        Self {
            inventory,
            role,
            dirty: AHashSet::new(),
            all_dirty: false,
            replicated: AHashSet::new(),
            sequence: 0,
            pending: BTreeMap::new(),
            deferred: Vec::new(),
            max_pending: DEFAULT_MAX_PENDING_PREDICTIONS,
            needs_full_sync: role == ReplicationRole::Client,
            stats: ReplicationStats::default(),
        }
    }

    /// Sets the cap on unresolved predictions.
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Inventory this replicator serves.
    #[must_use]
    pub const fn inventory(&self) -> InventoryId {
        self.inventory
    }

    /// Server or client.
    #[must_use]
    pub const fn role(&self) -> ReplicationRole {
        self.role
    }

    /// Last delta sequence sent (server) or applied (client).
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> &ReplicationStats {
        &self.stats
    }

    /// Checks if the client state is no longer trustworthy.
    #[must_use]
    pub const fn needs_full_sync(&self) -> bool {
        self.needs_full_sync
    }

    /// Number of unresolved predictions.
    #[must_use]
    pub fn pending_predictions(&self) -> usize {
        self.pending.len()
    }

    /// Checks if a prediction is unresolved.
    #[must_use]
    pub fn is_predicting(&self, prediction_id: PredictionId) -> bool {
        self.pending.contains_key(&prediction_id)
    }

    /// Deltas waiting for predictions to resolve.
    #[must_use]
    pub fn deferred_deltas(&self) -> usize {
        self.deferred.len()
    }

    /// Checks if anything awaits a flush.
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.all_dirty || !self.dirty.is_empty()
    }

    // ------------------------------------------------------------------
    // Server: dirty tracking and flush
    // ------------------------------------------------------------------

    /// Queues an instance for the next flush.
    pub fn mark_item_dirty(&mut self, instance_id: InstanceId) {
        self.dirty.insert(instance_id);
    }

    /// Queues every instance for the next flush.
    pub fn mark_all_dirty(&mut self) {
        self.all_dirty = true;
    }

    /// Sends pending changes through `sink`.
    ///
    /// Returns the delta sequence, or `None` when nothing was sent. On a send
    /// error the dirty set is kept for the next attempt.
    pub fn flush_replication(
        &mut self,
        registry: &InventoryRegistry,
        sink: &mut dyn ReplicationSink,
    ) -> ReplicationResult<Option<u64>> {
        if !self.has_dirty() {
            return Ok(None);
        }
        let inventory = registry
            .get(self.inventory)
            .ok_or(ReplicationError::InventoryMissing(self.inventory))?;

        let mut candidates: Vec<InstanceId> = if self.all_dirty {
            inventory
                .items()
                .iter()
                .map(|i| i.instance_id)
                .chain(self.replicated.iter().copied())
                .collect()
        } else {
            self.dirty.iter().copied().collect()
        };
        candidates.sort_unstable();
        candidates.dedup();

        let mut changes = Vec::with_capacity(candidates.len());
        for id in candidates {
            match inventory.item(id) {
                Some(item) if self.replicated.contains(&id) => {
                    changes.push(ItemChange::Updated(ReplicatedItem::from_instance(item)));
                }
                Some(item) => changes.push(ItemChange::Added(ReplicatedItem::from_instance(item))),
                None if self.replicated.contains(&id) => changes.push(ItemChange::Removed(id)),
                None => {}
            }
        }
        // Removals first so freed cells are available to the rest.
        changes.sort_by_key(|c| !matches!(c, ItemChange::Removed(_)));

        if changes.is_empty() {
            self.dirty.clear();
            self.all_dirty = false;
            return Ok(None);
        }

        let delta = ReplicationDelta {
            inventory: self.inventory,
            sequence: self.sequence + 1,
            changes,
        };
        let message = ReplicationMessage::Delta(delta);
        let bytes = sink.send(&message)?;
        let ReplicationMessage::Delta(delta) = message else {
            return Ok(None);
        };

        for change in &delta.changes {
            match change {
                ItemChange::Added(item) | ItemChange::Updated(item) => {
                    self.replicated.insert(item.instance_id);
                }
                ItemChange::Removed(id) => {
                    self.replicated.remove(id);
                }
            }
        }
        self.sequence = delta.sequence;
        self.dirty.clear();
        self.all_dirty = false;

        self.stats.flush_count += 1;
        self.stats.items_replicated += delta.changes.len() as u64;
        self.stats.bytes_sent += bytes as u64;
        self.stats.last_flush_ms = unix_millis();

        debug!(
            "{} flushed seq {} ({} changes, {} bytes)",
            self.inventory,
            delta.sequence,
            delta.changes.len(),
            bytes
        );
        publish(
            inventory,
            InventoryEvent::ReplicationFlushed {
                inventory: self.inventory,
                sequence: delta.sequence,
                changes: delta.changes.len(),
            },
        );
        Ok(Some(delta.sequence))
    }

    /// Captures the complete state for a joining or desynced client.
    ///
    /// Everything in the inventory counts as replicated afterwards.
    pub fn build_full_state(&mut self, registry: &InventoryRegistry) -> Option<FullStateSync> {
        let inventory = registry.get(self.inventory)?;
        self.replicated = inventory.items().iter().map(|i| i.instance_id).collect();
        self.dirty.clear();
        self.all_dirty = false;
        self.stats.full_syncs += 1;
        Some(FullStateSync {
            inventory: self.inventory,
            grid_width: inventory.grid_width(),
            grid_height: inventory.grid_height(),
            max_weight: inventory.max_weight(),
            sequence: self.sequence,
            items: inventory
                .items()
                .iter()
                .map(ReplicatedItem::from_instance)
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Server: request handling
    // ------------------------------------------------------------------

    /// Authoritatively adds an item for a client.
    pub fn server_add_item(
        &mut self,
        registry: &mut InventoryRegistry,
        gate: &dyn AuthorityGate,
        actor: ActorId,
        request: &AddItemRequest,
    ) -> ServerResponse {
        self.handle_client_request(registry, gate, actor, &ClientRequest::AddItem(request.clone()))
    }

    /// Authoritatively removes units for a client.
    pub fn server_remove_item(
        &mut self,
        registry: &mut InventoryRegistry,
        gate: &dyn AuthorityGate,
        actor: ActorId,
        request: &RemoveItemRequest,
    ) -> ServerResponse {
        self.handle_client_request(
            registry,
            gate,
            actor,
            &ClientRequest::RemoveItem(request.clone()),
        )
    }

    /// Authoritatively moves an item for a client.
    pub fn server_move_item(
        &mut self,
        registry: &mut InventoryRegistry,
        gate: &dyn AuthorityGate,
        actor: ActorId,
        request: &MoveItemRequest,
    ) -> ServerResponse {
        self.handle_client_request(registry, gate, actor, &ClientRequest::MoveItem(request.clone()))
    }

    /// Checks authority, applies the request and marks the result dirty.
    pub fn handle_client_request(
        &mut self,
        registry: &mut InventoryRegistry,
        gate: &dyn AuthorityGate,
        actor: ActorId,
        request: &ClientRequest,
    ) -> ServerResponse {
        let prediction_id = request.prediction_id();
        if !gate.check_authority(actor, request.operation()) {
            warn!(
                "{} rejected {:?} from actor {}: no authority",
                self.inventory,
                request.operation(),
                actor.raw()
            );
            return ServerResponse::rejected(prediction_id, InventoryResultCode::PermissionDenied);
        }
        let Some(inventory) = registry.get_mut(self.inventory) else {
            return ServerResponse::rejected(prediction_id, InventoryResultCode::NotInitialized);
        };

        match request.apply(inventory) {
            Ok(record) => {
                for id in record.affected_instances() {
                    self.mark_item_dirty(id);
                }
                trace!("{} applied request {}: {}", self.inventory, prediction_id, record);
                ServerResponse {
                    ack: PredictionAck {
                        prediction_id,
                        success: true,
                        result_code: InventoryResultCode::Success,
                        instance_id: Some(record.instance_id),
                    },
                    record: Some(record),
                }
            }
            Err(e) => {
                warn!("{} rejected request {}: {}", self.inventory, prediction_id, e);
                publish(
                    inventory,
                    InventoryEvent::OperationFailed {
                        inventory: self.inventory,
                        code: e.code(),
                    },
                );
                ServerResponse::rejected(prediction_id, e.code())
            }
        }
    }

    // ------------------------------------------------------------------
    // Client: prediction
    // ------------------------------------------------------------------

    /// Snapshots the inventory before a predicted mutation.
    pub fn begin_prediction(
        &mut self,
        registry: &InventoryRegistry,
        prediction_id: PredictionId,
    ) -> bool {
        if self.pending.contains_key(&prediction_id) {
            warn!("{} duplicate prediction {}", self.inventory, prediction_id);
            return false;
        }
        if self.pending.len() >= self.max_pending {
            warn!(
                "{} has {} unresolved predictions, refusing {}",
                self.inventory,
                self.pending.len(),
                prediction_id
            );
            return false;
        }
        let Some(inventory) = registry.get(self.inventory) else {
            return false;
        };

        self.pending.insert(
            prediction_id,
            PendingPrediction {
                snapshot: inventory.snapshot(),
                started_at: unix_millis(),
            },
        );
        self.stats.predictions_started += 1;
        trace!("{} began prediction {}", self.inventory, prediction_id);
        true
    }

    /// Resolves a prediction, restoring its snapshot when it was wrong.
    ///
    /// A misprediction also drops every later prediction, since their
    /// snapshots were taken on top of the discarded state.
    pub fn end_prediction(
        &mut self,
        registry: &mut InventoryRegistry,
        prediction_id: PredictionId,
        was_correct: bool,
    ) -> bool {
        let Some(prediction) = self.pending.remove(&prediction_id) else {
            debug!("{} unknown prediction {}", self.inventory, prediction_id);
            return false;
        };
        let Some(inventory) = registry.get_mut(self.inventory) else {
            return false;
        };

        if was_correct {
            self.stats.predictions_confirmed += 1;
            trace!(
                "{} prediction {} confirmed after {} ms",
                self.inventory,
                prediction_id,
                unix_millis().saturating_sub(prediction.started_at)
            );
        } else {
            self.stats.predictions_rolled_back += 1;
            let later: Vec<PredictionId> = self
                .pending
                .range(prediction_id..)
                .map(|(id, _)| *id)
                .collect();
            for id in &later {
                self.pending.remove(id);
            }
            warn!(
                "{} misprediction {}, restoring snapshot ({} later predictions dropped)",
                self.inventory,
                prediction_id,
                later.len()
            );
            if let Err(e) = inventory.restore_snapshot(&prediction.snapshot) {
                warn!("{} snapshot restore incomplete: {}", self.inventory, e);
                self.needs_full_sync = true;
            }
        }
        publish(
            inventory,
            InventoryEvent::PredictionResolved {
                inventory: self.inventory,
                prediction_id,
                confirmed: was_correct,
            },
        );

        if self.pending.is_empty() && !self.deferred.is_empty() {
            let deferred = std::mem::take(&mut self.deferred);
            debug!("{} applying {} deferred deltas", self.inventory, deferred.len());
            for delta in deferred {
                self.apply_delta(registry, delta);
            }
        }
        true
    }

    /// Resolves the prediction named in a server ack.
    pub fn handle_server_ack(
        &mut self,
        registry: &mut InventoryRegistry,
        ack: &PredictionAck,
    ) -> bool {
        if !ack.success {
            debug!(
                "{} server rejected {}: {}",
                self.inventory, ack.prediction_id, ack.result_code
            );
        }
        self.end_prediction(registry, ack.prediction_id, ack.success)
    }

    // ------------------------------------------------------------------
    // Client: applying server state
    // ------------------------------------------------------------------

    /// Applies a server delta.
    pub fn apply_delta(
        &mut self,
        registry: &mut InventoryRegistry,
        delta: ReplicationDelta,
    ) -> DeltaOutcome {
        if self.role == ReplicationRole::Server || delta.inventory != self.inventory {
            return DeltaOutcome::Ignored;
        }
        if delta.sequence <= self.sequence {
            trace!("{} stale delta {} <= {}", self.inventory, delta.sequence, self.sequence);
            return DeltaOutcome::Stale;
        }
        if !self.pending.is_empty() {
            self.deferred.push(delta);
            return DeltaOutcome::Deferred;
        }
        let Some(inventory) = registry.get_mut(self.inventory) else {
            self.needs_full_sync = true;
            return DeltaOutcome::Desynced;
        };

        if self.sequence != 0 && delta.sequence != self.sequence + 1 {
            warn!(
                "{} missed deltas {}..{}",
                self.inventory,
                self.sequence + 1,
                delta.sequence
            );
            self.needs_full_sync = true;
        }

        let mut items: Vec<ItemInstance> = inventory.items().to_vec();
        let mut consistent = true;
        for change in &delta.changes {
            match change {
                ItemChange::Added(replicated) | ItemChange::Updated(replicated) => {
                    let incoming = replicated.to_instance();
                    match items.iter_mut().find(|i| i.instance_id == incoming.instance_id) {
                        Some(existing) => *existing = incoming,
                        None => items.push(incoming),
                    }
                }
                ItemChange::Removed(id) => {
                    let before = items.len();
                    items.retain(|i| i.instance_id != *id);
                    if items.len() == before {
                        trace!("{} removal of unknown {}", self.inventory, id.short());
                    }
                }
            }
        }

        if let Err(e) = inventory.replace_all(items) {
            warn!("{} delta {} did not apply cleanly: {}", self.inventory, delta.sequence, e);
            consistent = false;
        }
        self.sequence = delta.sequence;

        if consistent {
            DeltaOutcome::Applied
        } else {
            self.needs_full_sync = true;
            DeltaOutcome::Desynced
        }
    }

    /// Replaces the client inventory with server state.
    pub fn client_full_state_sync(
        &mut self,
        registry: &mut InventoryRegistry,
        sync: &FullStateSync,
    ) -> bool {
        let Some(inventory) = registry.get_mut(self.inventory) else {
            return false;
        };
        if inventory.grid_width() != sync.grid_width
            || inventory.grid_height() != sync.grid_height
        {
            inventory.initialize(sync.grid_width, sync.grid_height, sync.max_weight);
        } else {
            inventory.set_max_weight(sync.max_weight);
        }

        let items = sync.items.iter().map(ReplicatedItem::to_instance).collect();
        let restored = inventory.replace_all(items);

        self.pending.clear();
        self.deferred.clear();
        self.sequence = sync.sequence;
        self.stats.full_syncs += 1;
        self.needs_full_sync = restored.is_err();

        match &restored {
            Ok(()) => info!(
                "{} full sync: {} items at seq {}",
                self.inventory,
                sync.items.len(),
                sync.sequence
            ),
            Err(e) => warn!("{} full sync incomplete: {}", self.inventory, e),
        }
        publish(
            inventory,
            InventoryEvent::FullStateSynced {
                inventory: self.inventory,
                item_count: inventory.items().len(),
            },
        );
        restored.is_ok()
    }
}

fn publish(inventory: &InventoryComponent, event: InventoryEvent) {
    if let Some(bus) = inventory.event_bus() {
        bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AllowAll;
    use crate::test_support::component;

    struct Link {
        server: InventoryRegistry,
        server_inv: InventoryId,
        server_rep: InventoryReplicator,
        client: InventoryRegistry,
        client_inv: InventoryId,
        client_rep: InventoryReplicator,
    }

    fn link() -> Link {
        let mut server = InventoryRegistry::new();
        let server_inv = server.insert(component(4, 4));
        let mut client = InventoryRegistry::new();
        let client_inv = client.insert(component(4, 4));
        Link {
            server,
            server_inv,
            server_rep: InventoryReplicator::new(server_inv, ReplicationRole::Server),
            client,
            client_inv,
            client_rep: InventoryReplicator::new(client_inv, ReplicationRole::Client),
        }
    }

    impl Link {
        /// Flushes the server and feeds every delta to the client.
        fn pump(&mut self) -> Vec<DeltaOutcome> {
            let mut sent: Vec<ReplicationMessage> = Vec::new();
            self.server_rep
                .flush_replication(&self.server, &mut sent)
                .expect("flush");
            sent.into_iter()
                .filter_map(|m| match m {
                    ReplicationMessage::Delta(mut d) => {
                        d.inventory = self.client_inv;
                        Some(self.client_rep.apply_delta(&mut self.client, d))
                    }
                    _ => None,
                })
                .collect()
        }

        fn predict(&mut self, request: &ClientRequest) -> InventoryResult<OperationRecord> {
            assert!(self
                .client_rep
                .begin_prediction(&self.client, request.prediction_id()));
            request.apply(self.client.get_mut(self.client_inv).expect("client"))
        }

        fn serve(&mut self, request: &ClientRequest) -> PredictionAck {
            self.server_rep
                .handle_client_request(&mut self.server, &AllowAll, ActorId::new(1), request)
                .ack
        }

        fn client_snapshot(&self) -> InventorySnapshot {
            self.client.get(self.client_inv).expect("client").snapshot()
        }

        fn server_snapshot(&self) -> InventorySnapshot {
            self.server.get(self.server_inv).expect("server").snapshot()
        }
    }

    fn add_request(prediction: u32, item: &str, slot: Option<usize>) -> ClientRequest {
        ClientRequest::AddItem(AddItemRequest {
            prediction_id: PredictionId::new(prediction),
            item_id: ItemId::new(item),
            quantity: 1,
            target_slot: slot,
            instance_id: InstanceId::new(),
        })
    }

    #[test]
    fn test_correct_prediction_matches_server() {
        let mut link = link();
        let request = add_request(1, "medkit", Some(5));
        link.predict(&request).expect("predicted");

        let ack = link.serve(&request);
        assert!(ack.success);
        assert!(link.client_rep.handle_server_ack(&mut link.client, &ack));
        assert_eq!(link.client_rep.stats().predictions_confirmed, 1);

        assert_eq!(link.pump(), vec![DeltaOutcome::Applied]);
        assert!(link.client_snapshot().same_items(&link.server_snapshot()));
    }

    #[test]
    fn test_misprediction_rolls_back() {
        let mut link = link();
        // Server already has something at slot 5 the client does not know about.
        let keycard = link
            .server
            .get_mut(link.server_inv)
            .expect("server")
            .add_instance(ItemInstance::new("keycard", 1), Some(5))
            .expect("server item");
        link.server_rep.mark_item_dirty(keycard.instance_id);
        let before = link.client_snapshot();

        let request = add_request(1, "medkit", Some(5));
        link.predict(&request).expect("predicted locally");
        assert_eq!(link.client_snapshot().len(), 1);

        let ack = link.serve(&request);
        assert!(!ack.success);
        assert_eq!(ack.result_code, InventoryResultCode::SlotOccupied);
        assert!(link.client_rep.handle_server_ack(&mut link.client, &ack));
        assert!(link.client_snapshot().same_items(&before));
        assert_eq!(link.client_rep.stats().predictions_rolled_back, 1);

        link.pump();
        assert!(link.client_snapshot().same_items(&link.server_snapshot()));
    }

    #[test]
    fn test_deltas_deferred_while_predicting() {
        let mut link = link();
        let keycard = link
            .server
            .get_mut(link.server_inv)
            .expect("server")
            .add_instance(ItemInstance::new("keycard", 1), Some(15))
            .expect("add");
        link.server_rep.mark_item_dirty(keycard.instance_id);

        let request = add_request(1, "medkit", Some(0));
        link.predict(&request).expect("predicted");
        assert_eq!(link.pump(), vec![DeltaOutcome::Deferred]);
        assert_eq!(link.client_rep.deferred_deltas(), 1);

        let ack = link.serve(&request);
        assert!(link.client_rep.handle_server_ack(&mut link.client, &ack));
        assert_eq!(link.client_rep.deferred_deltas(), 0);
        assert_eq!(link.client_snapshot().len(), 2);

        link.pump();
        assert!(link.client_snapshot().same_items(&link.server_snapshot()));
    }

    #[test]
    fn test_stale_and_foreign_deltas() {
        let mut link = link();
        let delta = ReplicationDelta {
            inventory: link.client_inv,
            sequence: 0,
            changes: Vec::new(),
        };
        assert_eq!(
            link.client_rep.apply_delta(&mut link.client, delta.clone()),
            DeltaOutcome::Stale
        );
        let foreign = ReplicationDelta {
            inventory: InventoryId::new(77),
            sequence: 5,
            ..delta
        };
        assert_eq!(
            link.client_rep.apply_delta(&mut link.client, foreign),
            DeltaOutcome::Ignored
        );
    }

    #[test]
    fn test_flush_classifies_changes() {
        let mut link = link();
        let inv = link.server.get_mut(link.server_inv).expect("server");
        let a = inv.add_item(&ItemId::new("medkit"), 1).expect("a").instance_id;
        let b = inv.add_item(&ItemId::new("pistol"), 1).expect("b").instance_id;
        link.server_rep.mark_all_dirty();

        let mut sent: Vec<ReplicationMessage> = Vec::new();
        assert_eq!(
            link.server_rep
                .flush_replication(&link.server, &mut sent)
                .expect("flush"),
            Some(1)
        );
        let ReplicationMessage::Delta(first) = &sent[0] else {
            panic!("expected delta");
        };
        assert!(first.changes.iter().all(|c| matches!(c, ItemChange::Added(_))));

        let inv = link.server.get_mut(link.server_inv).expect("server");
        inv.remove_instance(a).expect("remove");
        inv.set_quantity(b, 1).expect("touch");
        link.server_rep.mark_item_dirty(a);
        link.server_rep.mark_item_dirty(b);
        link.server_rep
            .flush_replication(&link.server, &mut sent)
            .expect("flush");
        let ReplicationMessage::Delta(second) = &sent[1] else {
            panic!("expected delta");
        };
        assert_eq!(second.sequence, 2);
        assert!(matches!(second.changes[0], ItemChange::Removed(id) if id == a));
        assert!(matches!(&second.changes[1], ItemChange::Updated(item) if item.instance_id == b));

        // Nothing dirty, nothing sent.
        assert_eq!(
            link.server_rep
                .flush_replication(&link.server, &mut sent)
                .expect("flush"),
            None
        );
        assert_eq!(link.server_rep.stats().flush_count, 2);
        assert!(link.server_rep.stats().bytes_sent > 0);
    }

    #[test]
    fn test_full_state_sync_resizes() {
        let mut link = link();
        {
            let inv = link.server.get_mut(link.server_inv).expect("server");
            inv.initialize(6, 3, 40.0);
            inv.add_item(&ItemId::new("rifle"), 1).expect("rifle");
            inv.add_item(&ItemId::new("ammo_9mm"), 30).expect("ammo");
        }
        let mut sync = link.server_rep.build_full_state(&link.server).expect("sync");
        sync.inventory = link.client_inv;

        assert!(link.client_rep.needs_full_sync());
        assert!(link.client_rep.client_full_state_sync(&mut link.client, &sync));
        assert!(!link.client_rep.needs_full_sync());
        let client = link.client.get(link.client_inv).expect("client");
        assert_eq!((client.grid_width(), client.grid_height()), (6, 3));
        assert!((client.max_weight() - 40.0).abs() < f32::EPSILON);
        assert!(link.client_snapshot().same_items(&link.server_snapshot()));
    }

    #[test]
    fn test_authority_denied() {
        let mut link = link();
        let deny = |_: ActorId, _: ValidatedOperation| false;
        let response = link.server_rep.handle_client_request(
            &mut link.server,
            &deny,
            ActorId::new(3),
            &add_request(1, "medkit", None),
        );
        assert!(!response.ack.success);
        assert_eq!(response.ack.result_code, InventoryResultCode::PermissionDenied);
        assert!(response.record.is_none());
        assert!(!link.server_rep.has_dirty());
    }

    #[test]
    fn test_prediction_limits() {
        let mut link = link();
        let mut rep =
            InventoryReplicator::new(link.client_inv, ReplicationRole::Client).with_max_pending(2);
        assert!(rep.begin_prediction(&link.client, PredictionId::new(1)));
        assert!(!rep.begin_prediction(&link.client, PredictionId::new(1)));
        assert!(rep.begin_prediction(&link.client, PredictionId::new(2)));
        assert!(!rep.begin_prediction(&link.client, PredictionId::new(3)));
        assert!(!rep.end_prediction(&mut link.client, PredictionId::new(9), true));

        // Misprediction of 1 drops 2 as well.
        assert!(rep.end_prediction(&mut link.client, PredictionId::new(1), false));
        assert_eq!(rep.pending_predictions(), 0);
    }

    #[test]
    fn test_remove_request_partial() {
        let mut link = link();
        let id = link
            .server
            .get_mut(link.server_inv)
            .expect("server")
            .add_item(&ItemId::new("ammo_9mm"), 30)
            .expect("ammo")
            .instance_id;
        let request = ClientRequest::RemoveItem(RemoveItemRequest {
            prediction_id: PredictionId::new(1),
            instance_id: id,
            quantity: 10,
        });
        let ack = link.serve(&request);
        assert!(ack.success);
        assert_eq!(
            link.server.get(link.server_inv).and_then(|i| i.item(id)).map(|i| i.quantity),
            Some(20)
        );
    }

    #[test]
    fn test_replicated_item_packing() {
        let mut item = ItemInstance::new("rifle", 1)
            .with_rotation(Rotation::Deg270)
            .with_weapon_state(WeaponState::new(12.0, 48.0))
            .with_property("Durability", 0.5);
        item.slot_index = Some(9);
        let packed = ReplicatedItem::from_instance(&item);
        assert_eq!(packed.rotation, 3);
        assert_eq!(packed.packed_flags & FLAG_WEAPON_STATE, FLAG_WEAPON_STATE);
        assert_eq!(packed.slot_index, 9);
        assert_eq!(packed.to_instance(), item);

        let loose = ReplicatedItem::from_instance(&ItemInstance::new("keycard", 1));
        assert_eq!(loose.slot_index, -1);
        assert_eq!(loose.packed_flags, 0);
        assert_eq!(loose.to_instance().slot_index, None);
    }
}
