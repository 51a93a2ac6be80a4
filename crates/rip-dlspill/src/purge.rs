//! The two eviction passes and the offers that front them.
//!
//! Phase 1 spills bulky payloads and leaves headers in place. Phase 2 packs
//! runs of resident headers into aggregate records, one archived container
//! per run. The first and last container of a chain are never packed: the
//! head anchors the chain and the tail is where the next append lands.

use rip_memory::Offer;

use crate::channel::SpillFile;
use crate::container::{
    ChainId, Container, ContainerArena, ContainerId, ContainerState, PurgeLevel,
};
use crate::error::{Result, SpillError};
use crate::object::DisplayObject;
use crate::record::{body_len, encode_body, RecordKind, RECORD_HEADER_LEN};
use crate::store::{archive_object_payload, live, DisplayListStore, PageState, PurgeReport};

/// Pool name carried by display-list offers.
pub const DISPLAY_LIST_POOL: &str = "display-list";

impl DisplayListStore {
    /// Spills every bulky resident payload of `chain` and raises its
    /// watermark to at least [`PurgeLevel::Payloads`].
    pub fn purge_payloads(&mut self, chain: ChainId) -> Result<u64> {
        let result = self.purge_payloads_in(chain);
        self.settle(result)
    }

    /// Packs runs of `chain`'s interior containers into aggregate records,
    /// spilling payloads first if that has not happened yet.
    pub fn aggregate_headers(&mut self, chain: ChainId) -> Result<u64> {
        let result = self.aggregate_headers_in(chain);
        self.settle(result)
    }

    /// Purges every chain of the page whose watermark is below `level`.
    ///
    /// Does nothing when purging is off for the page, `level` exceeds the
    /// configured maximum, or a purge is already running.
    pub fn purge_page(&mut self, level: PurgeLevel) -> Result<PurgeReport> {
        let mut report = PurgeReport {
            level,
            chains_purged: 0,
            bytes_reclaimed: 0,
        };
        let allowed = level > PurgeLevel::None && level <= self.config.max_purge_level;
        let page = live(&mut self.page)?;
        if !allowed || !page.purging_enabled || page.purging {
            return Ok(report);
        }
        page.purging = true;
        let chains: Vec<ChainId> = page
            .chains
            .iter()
            .enumerate()
            .filter(|(_, chain)| chain.watermark < level)
            .map(|(index, _)| ChainId::from_raw(index as u32))
            .collect();

        let mut result = Ok(());
        for chain in chains {
            let reclaimed = match level {
                PurgeLevel::Payloads => self.purge_payloads_in(chain),
                PurgeLevel::Aggregated => self.aggregate_headers_in(chain),
                PurgeLevel::None => Ok(0),
            };
            match reclaimed {
                Ok(bytes) => {
                    report.chains_purged += 1;
                    report.bytes_reclaimed += bytes;
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        if let Some(page) = self.page.as_mut() {
            page.purging = false;
        }
        self.settle(result)?;
        tracing::debug!(
            target: "rip.dlspill",
            ?level,
            chains = report.chains_purged,
            bytes = report.bytes_reclaimed,
            "display-list purge finished"
        );
        Ok(report)
    }

    /// What a purge to `level` could give back right now, if anything.
    pub fn solicit_offer(&self, level: PurgeLevel) -> Option<Offer> {
        let (estimate, cost) = match level {
            PurgeLevel::None => return None,
            PurgeLevel::Payloads => (
                self.config.payload_estimate_per_chain,
                self.config.payload_cost,
            ),
            PurgeLevel::Aggregated => (
                self.config.header_estimate_per_chain,
                self.config.aggregate_cost,
            ),
        };
        if !self.config.enabled || level > self.config.max_purge_level {
            return None;
        }
        let page = self.page.as_ref()?;
        if !page.purging_enabled || page.failed || page.purging {
            return None;
        }
        let chains = page
            .chains
            .iter()
            .filter(|chain| chain.objects > 0 && chain.watermark < level)
            .count() as u64;
        if chains == 0 {
            return None;
        }
        Some(Offer {
            pool: DISPLAY_LIST_POOL.to_string(),
            size: estimate.0.saturating_mul(chains),
            cost,
        })
    }

    fn purge_payloads_in(&mut self, chain: ChainId) -> Result<u64> {
        let Self {
            page,
            file,
            load_buffer,
            ..
        } = self;
        let page = live(page)?;

        let mut reclaimed = 0;
        let mut cursor = page.chain(chain)?.head;
        while let Some(id) = cursor {
            let container = page.arena.get_mut(id).ok_or(SpillError::BrokenChain(id))?;
            cursor = container.next;
            let ContainerState::Resident(object) = &mut container.state else {
                continue;
            };
            if object.opcode.has_bulky_payload() && !object.is_payload_archived() {
                reclaimed += archive_object_payload(object, file, load_buffer, &mut page.stats)?;
            }
        }

        let state = page.chain_mut(chain)?;
        state.watermark = state.watermark.max(PurgeLevel::Payloads);
        tracing::trace!(
            target: "rip.dlspill",
            chain = chain.to_raw(),
            reclaimed,
            "spilled chain payloads"
        );
        Ok(reclaimed)
    }

    fn aggregate_headers_in(&mut self, chain: ChainId) -> Result<u64> {
        let mut reclaimed = 0;
        if live(&mut self.page)?.chain(chain)?.watermark < PurgeLevel::Payloads {
            reclaimed += self.purge_payloads_in(chain)?;
        }
        let cap = self.config.effective_aggregate_cap();
        let limit = self.load_buffer.limit() as u64;

        let Self { page, file, .. } = self;
        let page = live(page)?;
        let state = *page.chain(chain)?;
        let mut aggregates = 0usize;
        if let (Some(head), Some(tail)) = (state.head, state.tail) {
            let mut prev = head;
            let mut cursor = page.arena.next(head);
            while let Some(start) = cursor {
                if start == tail {
                    break;
                }
                let container = page.container(start)?;
                let run = if container.is_archived() {
                    Vec::new()
                } else {
                    collect_run(&page.arena, start, tail, cap, limit)?
                };
                let Some(&last) = run.last() else {
                    if !container.is_archived() {
                        tracing::trace!(
                            target: "rip.dlspill",
                            container = start.to_raw(),
                            "container left unpacked"
                        );
                    }
                    prev = start;
                    cursor = container.next;
                    continue;
                };
                let after = page.arena.next(last);
                // The record must be on disk before any node is released.
                let offset = write_aggregate(page, &run, file)?;
                let freed = release_run(page, &run);
                let node = mint_container(
                    page,
                    Container {
                        state: ContainerState::Archived {
                            offset,
                            count: run.len() as u32,
                        },
                        next: after,
                    },
                );
                page.arena
                    .get_mut(prev)
                    .ok_or(SpillError::BrokenChain(prev))?
                    .next = Some(node);

                let kept = std::mem::size_of::<Container>() as u64;
                let net = freed.saturating_sub(kept);
                page.stats.resident_bytes =
                    (page.stats.resident_bytes + kept).saturating_sub(freed);
                page.stats.bytes_reclaimed += net;
                reclaimed += net;
                aggregates += 1;
                prev = node;
                cursor = after;
            }
        }

        for spare in page.pool.drain_all() {
            page.arena.recycle(spare);
        }

        let state = page.chain_mut(chain)?;
        state.watermark = state.watermark.max(PurgeLevel::Aggregated);
        tracing::trace!(
            target: "rip.dlspill",
            chain = chain.to_raw(),
            aggregates,
            reclaimed,
            "packed chain headers"
        );
        Ok(reclaimed)
    }
}

/// The resident containers from `start` that can share one aggregate.
///
/// The run stops at the tail, at an archived container, after `cap` entries,
/// at an object whose bulky payload is still resident, and before the record
/// would outgrow a load buffer of `limit` bytes. Aggregates hold headers
/// only: a payload phase 1 could not spill stays resident and unpacked.
fn collect_run(
    arena: &ContainerArena,
    start: ContainerId,
    tail: ContainerId,
    cap: usize,
    limit: u64,
) -> Result<Vec<ContainerId>> {
    let mut run = Vec::new();
    let mut record_len = RECORD_HEADER_LEN as u64 + body_len::<[DisplayObject]>(&[])?;
    let mut cursor = Some(start);
    while let Some(id) = cursor {
        if id == tail || run.len() == cap {
            break;
        }
        let container = arena.get(id).ok_or(SpillError::BrokenChain(id))?;
        let ContainerState::Resident(object) = &container.state else {
            break;
        };
        if object.opcode.has_bulky_payload() && !object.is_payload_archived() {
            break;
        }
        let len = body_len(&**object)?;
        if record_len + len > limit {
            break;
        }
        record_len += len;
        run.push(id);
        cursor = container.next;
    }
    Ok(run)
}

fn write_aggregate(
    page: &mut PageState,
    run: &[ContainerId],
    file: &mut SpillFile,
) -> Result<u64> {
    let objects = run
        .iter()
        .map(|&id| match page.arena.get(id).map(|node| &node.state) {
            Some(ContainerState::Resident(object)) => Ok(&**object),
            _ => Err(SpillError::BrokenChain(id)),
        })
        .collect::<Result<Vec<&DisplayObject>>>()?;
    let body = encode_body(&objects)?;
    let record_len = (RECORD_HEADER_LEN + body.len()) as u64;
    let offset = file.append(RecordKind::Aggregate, run.len() as u32, &body)?;

    let stats = &mut page.stats;
    stats.aggregates_written += 1;
    stats.objects_aggregated += run.len() as u64;
    stats.bytes_archived += record_len;
    stats.largest_record = stats.largest_record.max(record_len);
    Ok(offset)
}

/// Frees the run's nodes, parking their ids in the pool while it has room.
fn release_run(page: &mut PageState, run: &[ContainerId]) -> u64 {
    page.pool.begin_fill();
    let mut freed = 0;
    for &id in run {
        if let Some(container) = page.arena.take(id) {
            freed += container.resident_bytes();
        }
        if let Err(id) = page.pool.give(id) {
            page.arena.recycle(id);
        }
    }
    page.pool.begin_drain();
    freed
}

/// Places the new archived container in a pooled node, falling back to a
/// fresh allocation when the pool has none left.
fn mint_container(page: &mut PageState, container: Container) -> ContainerId {
    match page.pool.take() {
        Some(id) => {
            page.arena.install(id, container);
            id
        }
        None => {
            page.stats.pool_underflows += 1;
            tracing::debug!(
                target: "rip.dlspill",
                capacity = page.pool.capacity(),
                "node pool empty; allocating aggregate container"
            );
            page.arena.alloc(container)
        }
    }
}
