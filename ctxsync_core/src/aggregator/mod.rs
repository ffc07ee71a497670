//! Per-port NIC command aggregation
//!
//! Upstream code produces, for every port, the dwords that port must
//! receive. Broadcast-like fan-out means most ports get the same words, so
//! the aggregator:
//!
//! 1. Deduplicates: per record position, ports with an equal payload chunk
//!    are merged with union-find into one record tagged with a port mask.
//! 2. Packs: records of adjacent push groups are coalesced into NIC
//!    passthrough commands no larger than the command budget.
//! 3. Balances credits: every port in the flush must observe the same
//!    credit total, so under-credited ports get no-op records sized to the
//!    difference.
//!
//! ```text
//! port0: [a b][c]        record(a b | 0b111)
//! port1: [a b][d]   ->   record(c   | 0b001)
//! port2: [a b][d]        record(d   | 0b110)
//! ```
//!
//! Every command is fully built and checked before the first byte reaches
//! the sink.

pub mod arena;
pub mod union_find;

pub use arena::{RecordArena, WordSpan};
pub use union_find::{group_equal, PortUnionFind};

use crate::commands;
use crate::error::SyncResult;
use crate::stream::CommandSink;
use crate::sync_invariant;
use ctxsync_types::{CommandSchema, HardwareParams, PortId, PortMask};
use std::collections::BTreeMap;
use std::ops::Range;

/// One deduplicated record awaiting packing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicRecord {
    pub dup_mask: PortMask,
    pub payload: WordSpan,
}

impl NicRecord {
    /// Dwords on the wire, record header included
    #[inline]
    pub fn dwords(&self) -> usize {
        1 + self.payload.len()
    }
}

/// What a flush emitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Passthrough commands appended to the sink
    pub commands: usize,
    /// Data records emitted
    pub records: usize,
    /// No-op records emitted for credit balancing
    pub nop_records: usize,
    /// Credits every flushed port observed, in dwords
    pub credits_per_port: u64,
    /// Total dwords appended, command headers included
    pub dwords: usize,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub flushes: u64,
    /// Per-port payload chunks seen before deduplication
    pub chunks_in: u64,
    /// Records produced after deduplication
    pub records_out: u64,
    pub nop_records: u64,
    pub commands: u64,
}

/// Deduplicating, credit-balancing packer of per-port NIC writes
#[derive(Debug)]
pub struct NicAggregator<'p> {
    params: &'p HardwareParams,
    schema: &'p CommandSchema,
    ports: PortMask,
    arena: RecordArena,
    records: Vec<NicRecord>,
    groups: Vec<Range<usize>>,
    stats: AggregatorStats,
}

impl<'p> NicAggregator<'p> {
    /// Aggregator whose flushes target exactly the ports in `ports`
    pub fn new(params: &'p HardwareParams, schema: &'p CommandSchema, ports: PortMask) -> Self {
        Self {
            params,
            schema,
            ports,
            arena: RecordArena::with_capacity(params.max_command_dwords as usize),
            records: Vec::new(),
            groups: Vec::new(),
            stats: AggregatorStats::default(),
        }
    }

    /// Ports included in every flush
    pub fn ports(&self) -> PortMask {
        self.ports
    }

    /// Change the flushed port set. Only allowed between flushes.
    pub fn set_ports(&mut self, ports: PortMask) -> SyncResult<()> {
        if !self.records.is_empty() {
            return Err(sync_invariant!(
                "port set changed with {} records pending",
                self.records.len()
            ));
        }
        self.ports = ports;
        Ok(())
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Records waiting for the next flush
    pub fn pending_records(&self) -> &[NicRecord] {
        &self.records
    }

    /// Payload words of a pending record
    pub fn payload(&self, record: &NicRecord) -> &[u32] {
        self.arena.get(record.payload)
    }

    pub fn has_pending(&self) -> bool {
        !self.records.is_empty()
    }

    /// Deduplicate one set of per-port buffers into a record group.
    ///
    /// Buffers are split into chunks of `max_payload_dwords_per_record`
    /// words; for each chunk position the ports holding an equal chunk share
    /// one record. Ports must belong to the flush set and appear once.
    pub fn push_port_buffers<B: AsRef<[u32]>>(&mut self, buffers: &[(PortId, B)]) -> SyncResult<()> {
        let mut seen = PortMask::EMPTY;
        for (port, _) in buffers {
            if !self.ports.contains(*port) {
                return Err(sync_invariant!(
                    "{} is not part of the flushed port set {}",
                    port,
                    self.ports
                ));
            }
            if seen.contains(*port) {
                return Err(sync_invariant!("{} supplied more than one buffer", port));
            }
            seen.insert(*port);
        }

        let mut order: Vec<usize> = (0..buffers.len()).collect();
        order.sort_unstable_by_key(|&i| buffers[i].0);

        let chunk = self.params.max_payload_dwords_per_record as usize;
        let positions = buffers
            .iter()
            .map(|(_, words)| words.as_ref().len().div_ceil(chunk))
            .max()
            .unwrap_or(0);

        let start = self.records.len();
        for position in 0..positions {
            let items: Vec<(PortId, &[u32])> = order
                .iter()
                .filter_map(|&i| {
                    let (port, words) = &buffers[i];
                    let words = words.as_ref();
                    let lo = position * chunk;
                    (lo < words.len()).then(|| (*port, &words[lo..(lo + chunk).min(words.len())]))
                })
                .collect();
            self.stats.chunks_in += items.len() as u64;

            for (first, dup_mask) in group_equal(&items) {
                let payload = self.arena.push(items[first].1);
                self.records.push(NicRecord { dup_mask, payload });
            }
        }

        if self.records.len() > start {
            self.stats.records_out += (self.records.len() - start) as u64;
            self.groups.push(start..self.records.len());
        }
        Ok(())
    }

    /// Pack, balance and emit everything pushed since the last flush.
    pub fn flush(&mut self, sink: &mut dyn CommandSink) -> SyncResult<FlushSummary> {
        let result = self.build();
        self.arena.clear();
        self.records.clear();
        self.groups.clear();
        let (bodies, summary) = result?;

        let mut dwords = 0;
        for body in &bodies {
            // slot 0 of every body is reserved for the command header
            let mut command = body.clone();
            command[0] = commands::passthrough_header(self.schema, body.len() - 1)?;
            dwords += command.len();
            sink.append_dwords(&command);
        }

        self.stats.flushes += 1;
        self.stats.commands += bodies.len() as u64;
        self.stats.nop_records += summary.nop_records as u64;
        log::debug!(
            "NIC flush: {} commands, {} records, {} nops, {} credits per port",
            summary.commands,
            summary.records,
            summary.nop_records,
            summary.credits_per_port
        );
        Ok(FlushSummary { dwords, ..summary })
    }

    fn build(&self) -> SyncResult<(Vec<Vec<u32>>, FlushSummary)> {
        let budget = self.params.command_body_budget() as usize;
        let max_body = (self.params.max_command_dwords - 1) as usize;
        let mut credits = [0u64; PortMask::MAX_PORTS as usize];

        let mut bodies: Vec<Vec<u32>> = Vec::new();
        let mut current: Vec<u32> = vec![0];

        for group in &self.groups {
            let group_dwords: usize = self.records[group.clone()].iter().map(NicRecord::dwords).sum();
            if current.len() > 1 && current.len() - 1 + group_dwords > budget {
                bodies.push(std::mem::replace(&mut current, vec![0]));
            }
            for record in &self.records[group.clone()] {
                let size = record.dwords();
                if size > budget {
                    return Err(sync_invariant!(
                        "record of {} dwords exceeds command budget {}",
                        size,
                        budget
                    ));
                }
                if current.len() - 1 + size > budget {
                    bodies.push(std::mem::replace(&mut current, vec![0]));
                }
                current.push(commands::record_header(
                    self.schema,
                    record.dup_mask,
                    record.payload.len(),
                )?);
                current.extend_from_slice(self.arena.get(record.payload));
                for port in record.dup_mask.iter() {
                    credits[port.index()] += size as u64;
                }
            }
        }
        if current.len() > 1 {
            bodies.push(current);
        }

        let nops = self.balancing_nops(&credits)?;
        let nop_records = nops.len();
        for (mask, amount) in nops {
            let word = commands::nop_record(self.schema, mask, amount)?;
            match bodies.last_mut() {
                Some(body) if body.len() - 1 < max_body => body.push(word),
                _ => bodies.push(vec![0, word]),
            }
            for port in mask.iter() {
                credits[port.index()] += amount as u64;
            }
        }

        let total = self.verify_balanced(&credits)?;
        for body in &bodies {
            if body.len() > self.params.max_command_dwords as usize {
                return Err(sync_invariant!(
                    "packed command of {} dwords exceeds maximum {}",
                    body.len(),
                    self.params.max_command_dwords
                ));
            }
        }

        let summary = FlushSummary {
            commands: bodies.len(),
            records: self.records.len(),
            nop_records,
            credits_per_port: total,
            dwords: 0,
        };
        Ok((bodies, summary))
    }

    /// No-op records that lift every port to the highest credit count.
    /// Ports sharing a deficit share a record; deficits larger than the
    /// credits field are split.
    fn balancing_nops(&self, credits: &[u64]) -> SyncResult<Vec<(PortMask, u32)>> {
        if self.ports.is_empty() {
            return Ok(Vec::new());
        }
        let max = self.ports.iter().map(|p| credits[p.index()]).max().unwrap_or(0);
        if max == 0 {
            return Ok(vec![(self.ports, 1)]);
        }

        let mut by_deficit: BTreeMap<u64, PortMask> = BTreeMap::new();
        for port in self.ports.iter() {
            let deficit = max - credits[port.index()];
            if deficit > 0 {
                by_deficit.entry(deficit).or_default().insert(port);
            }
        }

        let cap = self.schema.record.credits.max_value() as u64;
        if cap == 0 {
            return Err(sync_invariant!("no-op credits field holds no value"));
        }
        let mut nops = Vec::new();
        for (deficit, mask) in by_deficit {
            let mut remaining = deficit;
            while remaining > 0 {
                let amount = remaining.min(cap);
                nops.push((mask, amount as u32));
                remaining -= amount;
            }
        }
        Ok(nops)
    }

    fn verify_balanced(&self, credits: &[u64]) -> SyncResult<u64> {
        let mut ports = self.ports.iter();
        let Some(first) = ports.next() else {
            return Ok(0);
        };
        let expected = credits[first.index()];
        for port in ports {
            if credits[port.index()] != expected {
                return Err(sync_invariant!(
                    "{} observes {} credits, {} observes {}",
                    port,
                    credits[port.index()],
                    first,
                    expected
                ));
            }
        }
        Ok(expected)
    }
}
