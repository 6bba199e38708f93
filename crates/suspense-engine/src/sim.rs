//! Client/server inventory session over an in-process link.
//!
//! Both peers own an [`InventoryManager`]. Frames travel over crossbeam
//! channels and are decoded with a [`FrameDecoder`], so everything the
//! session exchanges goes through the real wire format.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use suspense_common::{ActorId, InstanceId, InventoryId, ItemId, PredictionId};
use suspense_inventory::{
    AddItemRequest, AuthorityGate, ClientRequest, FrameDecoder, InventoryConfig,
    InventoryManager, ItemDataProvider, MoveItemRequest, RemoveItemRequest, ReplicationMessage,
    ReplicationRole, ReplicationSink,
};
use tracing::{debug, info, warn};

/// One end of a bidirectional frame link.
#[derive(Debug)]
pub struct Endpoint {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    decoder: FrameDecoder,
}

impl Endpoint {
    /// Encodes and sends a message. Returns the frame size.
    pub fn send(&mut self, message: &ReplicationMessage) -> Result<usize> {
        Ok(ReplicationSink::send(&mut self.tx, message)?)
    }

    /// Sink that writes frames to the peer.
    pub fn sink(&mut self) -> &mut Sender<Vec<u8>> {
        &mut self.tx
    }

    /// Drains every complete message received so far.
    pub fn receive(&mut self) -> Result<Vec<ReplicationMessage>> {
        for frame in self.rx.try_iter() {
            self.decoder.push(&frame);
        }
        let mut messages = Vec::new();
        while let Some(message) = self.decoder.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }
}

/// Creates a connected pair of endpoints.
#[must_use]
pub fn loopback(max_frame: usize) -> (Endpoint, Endpoint) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    (
        Endpoint {
            tx: a_tx,
            rx: a_rx,
            decoder: FrameDecoder::new(max_frame),
        },
        Endpoint {
            tx: b_tx,
            rx: b_rx,
            decoder: FrameDecoder::new(max_frame),
        },
    )
}

/// Counters for one [`Session::pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Requests the server handled
    pub requests: usize,
    /// Requests the server rejected
    pub rejected: usize,
    /// Deltas the server sent
    pub deltas: usize,
    /// Server messages the client failed to apply
    pub client_failures: usize,
}

/// A server and one predicting client sharing an inventory.
pub struct Session {
    server: InventoryManager,
    client: InventoryManager,
    server_inventory: InventoryId,
    client_inventory: InventoryId,
    server_link: Endpoint,
    client_link: Endpoint,
    gate: Box<dyn AuthorityGate>,
    actor: ActorId,
    next_prediction: u32,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server_inventory", &self.server_inventory)
            .field("client_inventory", &self.client_inventory)
            .field("actor", &self.actor)
            .field("next_prediction", &self.next_prediction)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates both peers and performs the initial full sync.
    pub fn new(
        config: &InventoryConfig,
        item_data: Arc<dyn ItemDataProvider>,
        gate: Box<dyn AuthorityGate>,
    ) -> Result<Self> {
        let mut server = InventoryManager::with_role(
            config.clone(),
            Arc::clone(&item_data),
            ReplicationRole::Server,
        );
        let mut client =
            InventoryManager::with_role(config.clone(), item_data, ReplicationRole::Client);
        let server_inventory = server.create_inventory();
        let client_inventory = client.create_inventory();
        if server_inventory != client_inventory {
            bail!("peers disagree on inventory id: {server_inventory} vs {client_inventory}");
        }

        let (server_link, client_link) = loopback(config.max_frame_size);
        let mut session = Self {
            server,
            client,
            server_inventory,
            client_inventory,
            server_link,
            client_link,
            gate,
            actor: ActorId::new(1),
            next_prediction: 1,
        };
        session.resync()?;
        Ok(session)
    }

    /// Sends the server's full state to the client.
    pub fn resync(&mut self) -> Result<()> {
        let sync = self
            .server
            .full_state(self.server_inventory)
            .context("server inventory missing")?;
        let size = self.server_link.send(&ReplicationMessage::FullState(sync))?;
        debug!("Full state sync frame: {} bytes", size);
        self.deliver_to_client()?;
        Ok(())
    }

    /// Server-side manager.
    #[must_use]
    pub fn server(&self) -> &InventoryManager {
        &self.server
    }

    /// Server-side manager, mutable. Changes reach the client on the next [`pump`](Self::pump).
    pub fn server_mut(&mut self) -> &mut InventoryManager {
        &mut self.server
    }

    /// Client-side manager.
    #[must_use]
    pub fn client(&self) -> &InventoryManager {
        &self.client
    }

    /// Inventory shared by both peers.
    #[must_use]
    pub fn inventory(&self) -> InventoryId {
        self.server_inventory
    }

    fn next_prediction_id(&mut self) -> PredictionId {
        let id = PredictionId::new(self.next_prediction);
        self.next_prediction = self.next_prediction.wrapping_add(1).max(1);
        id
    }

    /// Predicts a request locally and sends it to the server.
    pub fn request(&mut self, request: ClientRequest) -> Result<PredictionId> {
        let prediction_id = request.prediction_id();
        let record = self.client.predict(self.client_inventory, &request)?;
        debug!("Predicted {}: {}", prediction_id, record);
        self.client_link.send(&ReplicationMessage::Request(request))?;
        Ok(prediction_id)
    }

    /// Client adds a new stack, auto-placed unless `slot` is given.
    pub fn client_add(
        &mut self,
        item_id: &str,
        quantity: u32,
        slot: Option<usize>,
    ) -> Result<PredictionId> {
        let prediction_id = self.next_prediction_id();
        self.request(ClientRequest::AddItem(AddItemRequest {
            prediction_id,
            item_id: ItemId::new(item_id),
            quantity,
            target_slot: slot,
            instance_id: InstanceId::new(),
        }))
    }

    /// Client removes units of the item at `slot`.
    pub fn client_remove(&mut self, slot: usize, quantity: u32) -> Result<PredictionId> {
        let instance_id = self.client_occupant(slot)?;
        let prediction_id = self.next_prediction_id();
        self.request(ClientRequest::RemoveItem(RemoveItemRequest {
            prediction_id,
            instance_id,
            quantity,
        }))
    }

    /// Client moves the item at `from` so its anchor lands on `to`.
    pub fn client_move(&mut self, from: usize, to: usize) -> Result<PredictionId> {
        let instance_id = self.client_occupant(from)?;
        let prediction_id = self.next_prediction_id();
        self.request(ClientRequest::MoveItem(MoveItemRequest {
            prediction_id,
            instance_id,
            to_slot: to,
        }))
    }

    fn client_occupant(&self, slot: usize) -> Result<InstanceId> {
        self.client
            .inventory(self.client_inventory)
            .and_then(|inv| inv.item_at_slot(slot))
            .map(|item| item.instance_id)
            .with_context(|| format!("client slot {slot} is empty"))
    }

    /// Runs one exchange: the server answers requests and flushes, the client applies.
    pub fn pump(&mut self) -> Result<PumpReport> {
        let mut report = PumpReport::default();

        for message in self.server_link.receive()? {
            let request = match message {
                ReplicationMessage::Request(request) => request,
                other => {
                    warn!("Server ignoring unexpected message of kind {}", other.kind());
                    continue;
                }
            };
            let ack = self
                .server
                .serve_request(self.server_inventory, self.gate.as_ref(), self.actor, &request);
            report.requests += 1;
            if !ack.success {
                report.rejected += 1;
            }
            self.server_link.send(&ReplicationMessage::Ack(ack))?;
        }

        report.deltas = self.server.flush_all(self.server_link.sink())?;
        report.client_failures = self.deliver_to_client()?;

        if self
            .client
            .replicator(self.client_inventory)
            .is_some_and(|r| r.needs_full_sync())
        {
            info!("Client requested full sync");
            self.resync()?;
        }
        Ok(report)
    }

    fn deliver_to_client(&mut self) -> Result<usize> {
        let mut failures = 0;
        for message in self.client_link.receive()? {
            if !self.client.apply_server_message(self.client_inventory, message) {
                failures += 1;
            }
        }
        Ok(failures)
    }

    /// Lists every difference between the server and client inventories.
    #[must_use]
    pub fn divergence(&self) -> Vec<String> {
        let (Some(server), Some(client)) = (
            self.server.inventory(self.server_inventory),
            self.client.inventory(self.client_inventory),
        ) else {
            return vec!["inventory missing".to_string()];
        };

        let mut problems = Vec::new();
        for item in server.items() {
            match client.item(item.instance_id) {
                None => problems.push(format!("client missing {item}")),
                Some(other)
                    if other.quantity != item.quantity
                        || other.slot_index != item.slot_index
                        || other.rotation != item.rotation =>
                {
                    problems.push(format!("server has {item}, client has {other}"));
                },
                Some(_) => {},
            }
        }
        for item in client.items() {
            if server.item(item.instance_id).is_none() {
                problems.push(format!("server missing {item}"));
            }
        }
        problems
    }

    /// Checks if both peers hold the same items in the same places.
    #[must_use]
    pub fn in_sync(&self) -> bool {
        self.divergence().is_empty()
    }
}
