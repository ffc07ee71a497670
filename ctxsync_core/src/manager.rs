//! Context manager
//!
//! Ties the context cache, the communicator LRU table and the NIC
//! aggregator together. For one collective step on one context index it
//! works out which registers differ from what the device holds, makes sure
//! the communicator owns a hardware slot, and emits the smallest command
//! sequence that brings the device up to date.
//!
//! Context states:
//!
//! ```text
//! Unused --update--> Active(comm) --comm evicted--> Evicted(comm)
//!                       ^                               |
//!                       +-----------update--------------+
//! ```
//!
//! Every command of an update is staged and checked first. The LRU slot is
//! peeked while staging; the LRU table, the sink and the cache only see a
//! fully built update.

use crate::aggregator::NicAggregator;
use crate::commands;
use crate::config::SyncConfig;
use crate::context::{
    CachedContext, CommBinding, ContextDiff, ContextFields, RequiredContext,
};
use crate::error::{SyncError, SyncResult};
use crate::lru::{CommLru, LruStats};
use crate::stream::{CommandSink, CommandStream};
use crate::sync_invariant;
use crate::topology::{PortTopology, QueuePairProvider};
use ctxsync_types::{CommId, CommandSchema, DeviceId, HardwareParams, PortId, PortMask};
use std::collections::BTreeSet;
use std::fmt;

/// Fabric a context index and its ports belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortClass {
    /// Intra-chassis
    ScaleUp,
    /// Inter-chassis
    ScaleOut,
}

impl PortClass {
    /// Class of a port according to `topology`
    pub fn of(topology: &dyn PortTopology, port: PortId) -> Self {
        if topology.is_scaleout_port(port) {
            PortClass::ScaleOut
        } else {
            PortClass::ScaleUp
        }
    }

    /// Class owning context `index`
    pub fn of_context(params: &HardwareParams, index: u32) -> Option<Self> {
        if params.is_scaleup_context(index) {
            Some(PortClass::ScaleUp)
        } else if params.is_scaleout_context(index) {
            Some(PortClass::ScaleOut)
        } else {
            None
        }
    }
}

impl fmt::Display for PortClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortClass::ScaleUp => write!(f, "scale-up"),
            PortClass::ScaleOut => write!(f, "scale-out"),
        }
    }
}

/// Lifecycle of one context index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Never updated, or its communicator was unregistered
    Unused,
    /// Bound to a communicator that owns a hardware slot
    Active(CommId),
    /// Its communicator lost the hardware slot; the next update re-binds
    Evicted(CommId),
}

/// Values one port receives from an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortUpdate {
    pub port: PortId,
    pub peer: DeviceId,
    pub qpn: u32,
}

/// Everything an update would write, computed without side effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextUpdatePlan {
    pub ctx_index: u32,
    pub comm: CommId,
    pub class: PortClass,
    /// Base-field diff against the cache
    pub diff: ContextDiff,
    /// Base and per-port fields to write
    pub fields: ContextFields,
    /// Values of the changed base fields, in wire order
    pub values: Vec<u32>,
    /// Every port connected to an enabled remote device, ascending
    pub ports: Vec<PortUpdate>,
    /// The communicator's slot binding must be refreshed
    pub requires_lru_update: bool,
}

impl ContextUpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn per_port_fields(&self) -> ContextFields {
        self.fields.intersection(ContextFields::PER_PORT)
    }

    /// Ports taking part in the update
    pub fn port_mask(&self) -> PortMask {
        self.ports.iter().map(|u| u.port).collect()
    }

    /// Per-port values written for `update`: the queue pair, then the peer
    pub fn port_words(&self, update: &PortUpdate) -> Vec<u32> {
        let fields = self.per_port_fields();
        let mut words = Vec::with_capacity(2);
        if fields.contains(ContextFields::QUEUE_PAIRS) {
            words.push(update.qpn);
        }
        if fields.contains(ContextFields::PORT_PEERS) {
            words.push(update.peer.0);
        }
        words
    }

    /// Distinct queue-pair numbers across the involved ports
    pub fn distinct_queue_pairs(&self) -> usize {
        self.ports.iter().map(|u| u.qpn).collect::<BTreeSet<_>>().len()
    }

    /// Whether the per-port values go through the NIC aggregator.
    ///
    /// Only a queue-pair write that needs more than one number fans out.
    /// Peers need no per-port write on the global path: the remote ranks
    /// and the topology already name them.
    pub fn fans_out(&self) -> bool {
        self.fields.contains(ContextFields::QUEUE_PAIRS) && self.distinct_queue_pairs() > 1
    }

    /// Per-port words carried by the context-update command: the shared
    /// queue pair, when one is written and the update does not fan out
    pub fn shared_port_words(&self) -> Vec<u32> {
        match self.ports.first() {
            Some(first) if self.fields.contains(ContextFields::QUEUE_PAIRS) && !self.fans_out() => {
                vec![first.qpn]
            }
            _ => Vec::new(),
        }
    }

    /// Dwords of the context-update command itself
    pub fn command_dwords(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        if !self.fans_out() {
            1 + self.values.len() + self.shared_port_words().len()
        } else if self.values.is_empty() {
            0
        } else {
            1 + self.values.len()
        }
    }
}

/// Result of an update call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUpdateOutcome {
    /// Hardware slot of the communicator, resolved even when nothing changed
    pub lru_slot: u32,
    pub lru_hit: bool,
    /// Communicator evicted to free the slot
    pub evicted: Option<CommId>,
    /// Sync-object slot holding the required address
    pub sync_slot: usize,
    /// Fields written
    pub fields: ContextFields,
    /// Commands appended to the sink
    pub commands: usize,
}

/// Owner of the collective-context cache and the communicator table
pub struct ContextManager<'a> {
    params: &'a HardwareParams,
    schema: &'a CommandSchema,
    topology: &'a dyn PortTopology,
    queue_pairs: &'a dyn QueuePairProvider,
    contexts: Vec<CachedContext>,
    states: Vec<ContextState>,
    lru: CommLru,
    registered: BTreeSet<CommId>,
}

impl<'a> ContextManager<'a> {
    pub fn new(
        params: &'a HardwareParams,
        schema: &'a CommandSchema,
        topology: &'a dyn PortTopology,
        queue_pairs: &'a dyn QueuePairProvider,
    ) -> SyncResult<Self> {
        Ok(Self {
            params,
            schema,
            topology,
            queue_pairs,
            contexts: Vec::new(),
            states: Vec::new(),
            lru: CommLru::from_params(params)?,
            registered: BTreeSet::new(),
        })
    }

    /// Manager over a validated configuration
    pub fn from_config(
        config: &'a SyncConfig,
        topology: &'a dyn PortTopology,
        queue_pairs: &'a dyn QueuePairProvider,
    ) -> SyncResult<Self> {
        config.validate()?;
        Self::new(&config.hardware, &config.schema, topology, queue_pairs)
    }

    pub fn params(&self) -> &HardwareParams {
        self.params
    }

    pub fn lru(&self) -> &CommLru {
        &self.lru
    }

    pub fn lru_stats(&self) -> LruStats {
        self.lru.stats()
    }

    pub fn contexts_created(&self) -> bool {
        !self.contexts.is_empty()
    }

    pub fn context(&self, index: u32) -> Option<&CachedContext> {
        self.contexts.get(index as usize)
    }

    pub fn context_state(&self, index: u32) -> Option<ContextState> {
        self.states.get(index as usize).copied()
    }

    pub fn is_registered(&self, comm: CommId) -> bool {
        self.registered.contains(&comm)
    }

    /// Build the context table and reset every context on the device.
    ///
    /// One command per context writes every base field with its reset
    /// value, so the cache and the device agree from the start.
    pub fn create_collective_contexts(&mut self, sink: &mut dyn CommandSink) -> SyncResult<()> {
        if self.contexts_created() {
            return Err(SyncError::invalid_input("collective contexts already created"));
        }

        let total = self.params.total_contexts();
        let num_ports = self.params.max_ports as usize;
        let mut contexts = Vec::with_capacity(total as usize);
        let mut staged = CommandStream::new();
        for index in 0..total {
            let context = CachedContext::new(index, num_ports);
            let mut command = vec![commands::context_update_header(
                self.schema,
                index,
                ContextFields::BASE,
                0,
                0,
            )?];
            command.extend(reset_values(&context));
            staged.append_dwords(&command);
            contexts.push(context);
        }

        for command in staged.commands() {
            sink.append_command(command);
        }
        self.contexts = contexts;
        self.states = vec![ContextState::Unused; total as usize];
        log::info!(
            "Created {} collective contexts ({} scale-up, {} scale-out)",
            total,
            self.params.scaleup_contexts,
            self.params.scaleout_contexts
        );
        Ok(())
    }

    /// Record a communicator and grow the LRU table to cover it.
    /// Returns whether it was newly registered.
    pub fn register_comm(&mut self, comm: CommId) -> SyncResult<bool> {
        self.lru.resize_db(comm)?;
        let added = self.registered.insert(comm);
        if added {
            log::debug!("Registered {}", comm);
        }
        Ok(added)
    }

    /// Forget a communicator: its hardware slot is freed and every
    /// context bound to it returns to `Unused`.
    pub fn unregister_comm(&mut self, comm: CommId) -> SyncResult<()> {
        if !self.registered.remove(&comm) {
            return Err(SyncError::not_found(format!("{} is not registered", comm)));
        }
        let slot = self.lru.release(comm);
        for (context, state) in self.contexts.iter_mut().zip(self.states.iter_mut()) {
            let bound = context.comm_binding().is_some_and(|b| b.comm == comm);
            let evicted = *state == ContextState::Evicted(comm);
            if bound || evicted {
                context.unbind_comm();
                *state = ContextState::Unused;
            }
        }
        log::debug!("Unregistered {} (slot {:?})", comm, slot);
        Ok(())
    }

    /// Whether `comm` lacks a hardware slot or `ctx_index` still refers
    /// to another communicator or slot
    pub fn requires_lru_update(&self, ctx_index: u32, comm: CommId) -> bool {
        match self.lru.slot_of(comm) {
            None => true,
            Some(slot) => {
                let binding = self.context(ctx_index).and_then(CachedContext::comm_binding);
                binding != Some(CommBinding { comm, slot })
            }
        }
    }

    /// Work out what an update of `ctx_index` would write. Nothing is
    /// modified.
    ///
    /// Per-port fields are judged on one representative port per enabled
    /// remote device: the lowest active port of `class` wired to it.
    pub fn get_dwords_for_update(
        &self,
        ctx_index: u32,
        comm: CommId,
        required: &RequiredContext,
        class: PortClass,
    ) -> SyncResult<ContextUpdatePlan> {
        let cached = self.checked_context(ctx_index, class)?;
        if !self.is_registered(comm) {
            return Err(SyncError::not_found(format!("{} is not registered", comm)));
        }

        let diff = cached.diff(required);
        let requires_lru_update = self.requires_lru_update(ctx_index, comm);
        let mut fields = diff.fields;
        let mut ports = Vec::new();

        for device in required.remote_devices() {
            let mask: PortMask = self
                .topology
                .all_active_ports_for(device)
                .iter()
                .filter(|p| PortClass::of(self.topology, *p) == class)
                .collect();
            let Some(representative) = mask.first_port() else {
                return Err(SyncError::not_found(format!(
                    "{} has no active {} port",
                    device, class
                )));
            };

            for port in mask.iter() {
                if port.index() >= self.params.max_ports as usize {
                    return Err(sync_invariant!(
                        "{} of {} is beyond max_ports {}",
                        port,
                        device,
                        self.params.max_ports
                    ));
                }
                let qpn = self.queue_pairs.queue_pair_number(comm, port, device);
                ports.push(PortUpdate {
                    port,
                    peer: device,
                    qpn,
                });

                if port == representative {
                    let binding = cached.port_binding(port);
                    if binding.qpn != Some(qpn) {
                        fields |= ContextFields::QUEUE_PAIRS;
                    }
                    if binding.peer != Some(device) {
                        fields |= ContextFields::PORT_PEERS;
                    }
                }
            }
        }
        if requires_lru_update && !ports.is_empty() {
            fields |= ContextFields::QUEUE_PAIRS;
        }
        ports.sort_unstable_by_key(|u| u.port);

        let values = diff
            .fields
            .each()
            .filter_map(|field| required.field_value(field))
            .collect();

        Ok(ContextUpdatePlan {
            ctx_index,
            comm,
            class,
            diff,
            fields,
            values,
            ports,
            requires_lru_update,
        })
    }

    /// Bring scale-up context `ctx_index` to `required` for `comm`
    pub fn update_collective_context_scale_up(
        &mut self,
        ctx_index: u32,
        comm: CommId,
        required: &RequiredContext,
        sink: &mut dyn CommandSink,
    ) -> SyncResult<ContextUpdateOutcome> {
        self.update(ctx_index, comm, required, PortClass::ScaleUp, sink)
    }

    /// Bring scale-out context `ctx_index` to `required` for `comm`
    pub fn update_collective_context_scale_out(
        &mut self,
        ctx_index: u32,
        comm: CommId,
        required: &RequiredContext,
        sink: &mut dyn CommandSink,
    ) -> SyncResult<ContextUpdateOutcome> {
        self.update(ctx_index, comm, required, PortClass::ScaleOut, sink)
    }

    fn update(
        &mut self,
        ctx_index: u32,
        comm: CommId,
        required: &RequiredContext,
        class: PortClass,
        sink: &mut dyn CommandSink,
    ) -> SyncResult<ContextUpdateOutcome> {
        let plan = self.get_dwords_for_update(ctx_index, comm, required, class)?;
        let lru = self.lru.peek(comm)?;

        let mut staged = CommandStream::new();
        if !plan.is_empty() {
            self.stage_update(&plan, lru.slot, &mut staged)?;
        }

        let index = ctx_index as usize;
        let mut next = self.contexts[index].clone();
        next.apply(required, &plan.diff)?;
        let per_port = plan.per_port_fields();
        for update in &plan.ports {
            let mut binding = next.port_binding(update.port);
            if per_port.contains(ContextFields::QUEUE_PAIRS) {
                binding.qpn = Some(update.qpn);
            }
            if per_port.contains(ContextFields::PORT_PEERS) {
                binding.peer = Some(update.peer);
            }
            next.bind_port(update.port, binding);
        }
        next.bind_comm(CommBinding {
            comm,
            slot: lru.slot,
        });

        let used = self.lru.use_comm(comm)?;
        debug_assert_eq!(used, lru);
        if let Some(evicted) = lru.evicted {
            self.mark_evicted(evicted);
        }
        for command in staged.commands() {
            sink.append_command(command);
        }
        self.contexts[index] = next;
        self.states[index] = ContextState::Active(comm);

        log::trace!(
            "{} context {} for {}: slot {} fields {:?} in {} commands",
            class,
            ctx_index,
            comm,
            lru.slot,
            plan.fields,
            staged.len()
        );
        Ok(ContextUpdateOutcome {
            lru_slot: lru.slot,
            lru_hit: lru.hit,
            evicted: lru.evicted,
            sync_slot: plan.diff.sync_slot,
            fields: plan.fields,
            commands: staged.len(),
        })
    }

    fn stage_update(
        &self,
        plan: &ContextUpdatePlan,
        comm_slot: u32,
        staged: &mut CommandStream,
    ) -> SyncResult<()> {
        let fans_out = plan.fans_out();
        let header_fields = if fans_out {
            plan.fields.intersection(ContextFields::BASE)
        } else {
            plan.fields
        };

        if !header_fields.is_empty() {
            let mut command = Vec::with_capacity(plan.command_dwords());
            command.push(commands::context_update_header(
                self.schema,
                plan.ctx_index,
                header_fields,
                comm_slot,
                plan.diff.sync_slot,
            )?);
            command.extend_from_slice(&plan.values);
            if !fans_out {
                command.extend(plan.shared_port_words());
            }
            if command.len() > self.params.max_command_dwords as usize {
                return Err(sync_invariant!(
                    "context update of {} dwords exceeds maximum {}",
                    command.len(),
                    self.params.max_command_dwords
                ));
            }
            staged.append_dwords(&command);
        }

        if fans_out {
            let header = commands::port_update_word(
                self.schema,
                plan.ctx_index,
                comm_slot,
                plan.per_port_fields(),
            )?;
            let buffers: Vec<(PortId, Vec<u32>)> = plan
                .ports
                .iter()
                .map(|update| {
                    let mut words = vec![header];
                    words.extend(plan.port_words(update));
                    (update.port, words)
                })
                .collect();
            let mut aggregator = NicAggregator::new(self.params, self.schema, plan.port_mask());
            aggregator.push_port_buffers(&buffers)?;
            aggregator.flush(staged)?;
        }
        Ok(())
    }

    fn checked_context(&self, index: u32, class: PortClass) -> SyncResult<&CachedContext> {
        let Some(context) = self.contexts.get(index as usize) else {
            return Err(if self.contexts_created() {
                SyncError::invalid_input(format!(
                    "context {} out of range ({} contexts)",
                    index,
                    self.contexts.len()
                ))
            } else {
                SyncError::invalid_input("collective contexts not created")
            });
        };
        if PortClass::of_context(self.params, index) != Some(class) {
            return Err(SyncError::invalid_input(format!(
                "context {} is not in the {} pool",
                index, class
            )));
        }
        Ok(context)
    }

    fn mark_evicted(&mut self, comm: CommId) {
        for (context, state) in self.contexts.iter_mut().zip(self.states.iter_mut()) {
            if context.comm_binding().is_some_and(|b| b.comm == comm) {
                context.unbind_comm();
                *state = ContextState::Evicted(comm);
            }
        }
    }
}

/// Register values of a context in base-field wire order
fn reset_values(context: &CachedContext) -> Vec<u32> {
    ContextFields::BASE
        .each()
        .map(|field| {
            if field == ContextFields::REDUCTION_OPCODE {
                context.reduction_opcode()
            } else if field == ContextFields::SYNC_OBJECT_0 {
                context.sync_object(0).unwrap_or_default()
            } else if field == ContextFields::SYNC_OBJECT_1 {
                context.sync_object(1).unwrap_or_default()
            } else if field == ContextFields::ADDRESS_MSB {
                context.address_msb()
            } else if field == ContextFields::STRIDE {
                context.stride()
            } else {
                context.remote_peers()
            }
        })
        .collect()
}
