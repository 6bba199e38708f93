//! Inventory notifications.
//!
//! Events are fire-and-forget: subscribers are called synchronously on
//! publish and the event is also queued for hosts that prefer to poll with
//! [`EventBus::drain`]. Nothing a subscriber does can feed back into the
//! operation that published it.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use suspense_common::{
    tag_matches, InstanceId, InventoryId, InventoryResultCode, ItemId, PredictionId, Rotation,
    TransactionId,
};

use crate::transaction::TransactionState;

/// Event tag names.
pub mod tags {
    /// Parent of every inventory event
    pub const INVENTORY: &str = "SuspenseCore.Event.Inventory";
    /// An item instance entered an inventory
    pub const ITEM_ADDED: &str = "SuspenseCore.Event.Inventory.ItemAdded";
    /// An item instance left an inventory
    pub const ITEM_REMOVED: &str = "SuspenseCore.Event.Inventory.ItemRemoved";
    /// An item changed anchor slot
    pub const ITEM_MOVED: &str = "SuspenseCore.Event.Inventory.ItemMoved";
    /// Two items exchanged positions
    pub const ITEMS_SWAPPED: &str = "SuspenseCore.Event.Inventory.ItemsSwapped";
    /// An item changed rotation
    pub const ITEM_ROTATED: &str = "SuspenseCore.Event.Inventory.ItemRotated";
    /// A stack was split in two
    pub const STACK_SPLIT: &str = "SuspenseCore.Event.Inventory.StackSplit";
    /// Two stacks were merged
    pub const STACKS_MERGED: &str = "SuspenseCore.Event.Inventory.StacksMerged";
    /// A stack changed size
    pub const QUANTITY_CHANGED: &str = "SuspenseCore.Event.Inventory.QuantityChanged";
    /// Contents changed in bulk (commit, restore, sync)
    pub const UPDATED: &str = "SuspenseCore.Event.Inventory.Updated";
    /// A transaction changed state
    pub const TRANSACTION: &str = "SuspenseCore.Event.Inventory.Transaction";
    /// Replication activity
    pub const REPLICATION: &str = "SuspenseCore.Event.Inventory.Replication";
    /// Dirty items were flushed to the network layer
    pub const REPLICATION_FLUSHED: &str = "SuspenseCore.Event.Inventory.Replication.Flushed";
    /// A client prediction was confirmed or rolled back
    pub const PREDICTION_RESOLVED: &str = "SuspenseCore.Event.Inventory.Replication.Prediction";
    /// Full state was replaced from the server
    pub const FULL_STATE_SYNCED: &str = "SuspenseCore.Event.Inventory.Replication.FullSync";
}

/// Events published by inventories and their attached components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InventoryEvent {
    /// Item added
    ItemAdded {
        /// Inventory
        inventory: InventoryId,
        /// Instance
        instance_id: InstanceId,
        /// Item type
        item_id: ItemId,
        /// Anchor slot
        slot: usize,
        /// Quantity
        quantity: u32,
    },
    /// Item removed
    ItemRemoved {
        /// Inventory
        inventory: InventoryId,
        /// Instance
        instance_id: InstanceId,
        /// Item type
        item_id: ItemId,
        /// Anchor slot it left
        slot: Option<usize>,
        /// Quantity
        quantity: u32,
    },
    /// Item moved
    ItemMoved {
        /// Inventory
        inventory: InventoryId,
        /// Instance
        instance_id: InstanceId,
        /// Previous anchor
        from_slot: usize,
        /// New anchor
        to_slot: usize,
    },
    /// Items swapped
    ItemsSwapped {
        /// Inventory
        inventory: InventoryId,
        /// First instance
        first: InstanceId,
        /// Second instance, if the other slot held one
        second: Option<InstanceId>,
    },
    /// Item rotated
    ItemRotated {
        /// Inventory
        inventory: InventoryId,
        /// Instance
        instance_id: InstanceId,
        /// New rotation
        rotation: Rotation,
    },
    /// Stack split
    StackSplit {
        /// Inventory
        inventory: InventoryId,
        /// Source stack
        source: InstanceId,
        /// Newly created stack
        new_stack: InstanceId,
        /// Units moved to the new stack
        quantity: u32,
    },
    /// Stacks merged
    StacksMerged {
        /// Inventory
        inventory: InventoryId,
        /// Source stack
        source: InstanceId,
        /// Receiving stack
        target: InstanceId,
        /// Units moved
        quantity: u32,
    },
    /// Quantity changed
    QuantityChanged {
        /// Inventory
        inventory: InventoryId,
        /// Instance
        instance_id: InstanceId,
        /// Old quantity
        old_quantity: u32,
        /// New quantity
        new_quantity: u32,
    },
    /// Inventory contents changed in bulk
    InventoryUpdated {
        /// Inventory
        inventory: InventoryId,
    },
    /// Transaction state changed
    TransactionStateChanged {
        /// Inventory
        inventory: InventoryId,
        /// Transaction
        transaction_id: TransactionId,
        /// New state
        state: TransactionState,
    },
    /// Dirty items flushed
    ReplicationFlushed {
        /// Inventory
        inventory: InventoryId,
        /// Delta sequence number
        sequence: u64,
        /// Number of changes sent
        changes: usize,
    },
    /// Prediction resolved
    PredictionResolved {
        /// Inventory
        inventory: InventoryId,
        /// Prediction
        prediction_id: PredictionId,
        /// Whether the server agreed
        confirmed: bool,
    },
    /// Full state replaced
    FullStateSynced {
        /// Inventory
        inventory: InventoryId,
        /// Items received
        item_count: usize,
    },
    /// Operation rejected by the server or by validation
    OperationFailed {
        /// Inventory
        inventory: InventoryId,
        /// Failure code
        code: InventoryResultCode,
    },
}

impl InventoryEvent {
    /// Returns the hierarchical tag of this event.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::ItemAdded { .. } => tags::ITEM_ADDED,
            Self::ItemRemoved { .. } => tags::ITEM_REMOVED,
            Self::ItemMoved { .. } => tags::ITEM_MOVED,
            Self::ItemsSwapped { .. } => tags::ITEMS_SWAPPED,
            Self::ItemRotated { .. } => tags::ITEM_ROTATED,
            Self::StackSplit { .. } => tags::STACK_SPLIT,
            Self::StacksMerged { .. } => tags::STACKS_MERGED,
            Self::QuantityChanged { .. } => tags::QUANTITY_CHANGED,
            Self::InventoryUpdated { .. } | Self::OperationFailed { .. } => tags::UPDATED,
            Self::TransactionStateChanged { .. } => tags::TRANSACTION,
            Self::ReplicationFlushed { .. } => tags::REPLICATION_FLUSHED,
            Self::PredictionResolved { .. } => tags::PREDICTION_RESOLVED,
            Self::FullStateSynced { .. } => tags::FULL_STATE_SYNCED,
        }
    }

    /// Returns the inventory the event concerns.
    #[must_use]
    pub const fn inventory(&self) -> InventoryId {
        match self {
            Self::ItemAdded { inventory, .. }
            | Self::ItemRemoved { inventory, .. }
            | Self::ItemMoved { inventory, .. }
            | Self::ItemsSwapped { inventory, .. }
            | Self::ItemRotated { inventory, .. }
            | Self::StackSplit { inventory, .. }
            | Self::StacksMerged { inventory, .. }
            | Self::QuantityChanged { inventory, .. }
            | Self::InventoryUpdated { inventory }
            | Self::TransactionStateChanged { inventory, .. }
            | Self::ReplicationFlushed { inventory, .. }
            | Self::PredictionResolved { inventory, .. }
            | Self::FullStateSynced { inventory, .. }
            | Self::OperationFailed { inventory, .. } => *inventory,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Callback = Arc<dyn Fn(&InventoryEvent) + Send + Sync>;

struct Subscriber {
    handle: SubscriptionHandle,
    tag: String,
    callback: Callback,
}

/// Event bus for broadcasting inventory events.
pub struct EventBus {
    /// Sender for queued events
    sender: Sender<InventoryEvent>,
    /// Receiver for polling hosts
    receiver: Receiver<InventoryEvent>,
    /// Channel capacity
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("pending", &self.receiver.len())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Creates a new event bus with the given queue capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Publishes an event to matching subscribers and the queue.
    pub fn publish(&self, event: InventoryEvent) {
        let tag = event.tag();
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| tag_matches(tag, &s.tag))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in callbacks {
            callback(&event);
        }
        // Non-blocking send - if full, event is dropped
        let _ = self.sender.try_send(event);
    }

    /// Registers a callback for `tag` and every tag nested below it.
    pub fn subscribe<F>(&self, tag: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&InventoryEvent) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push(Subscriber {
            handle,
            tag: tag.to_string(),
            callback: Arc::new(callback),
        });
        handle
    }

    /// Removes a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.handle != handle);
        subscribers.len() != before
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drains all pending events.
    pub fn drain(&self) -> Vec<InventoryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Returns the number of pending events.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// Returns the channel capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
