//! Transfer queue between paint workers and the GPU thread.
//!
//! A fixed ring of slots behind one mutex. Producers block on a condvar while
//! no slot is empty; the consumer drains once per frame and never waits on
//! producers: the lock is held while entries are moved out and while slots
//! are recounted, never across backend calls.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use render_protocol::{PixelBuffer, PixelRect, TileKey};

use crate::backend::{BackendError, TextureBackend};
use crate::pool::{PaintTicket, TextureContent, TextureHandle, TexturePoolManager, TileId};
use crate::tier::TransferQueueSize;
use crate::{TILE_HEIGHT, TILE_WIDTH};

/// Snapshot of the tile a payload was painted for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferTarget {
    pub tile: TileId,
    pub key: TileKey,
    pub texture: TextureHandle,
    pub ticket: PaintTicket,
}

pub enum UploadPayload<S> {
    Cpu(PixelBuffer),
    Surface(Arc<S>),
}

impl<S> std::fmt::Debug for UploadPayload<S> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadPayload::Cpu(pixels) => formatter.debug_tuple("Cpu").field(pixels).finish(),
            UploadPayload::Surface(_) => formatter.write_str("Surface(..)"),
        }
    }
}

#[derive(Debug)]
pub struct TransferRequest<S> {
    pub target: TransferTarget,
    pub payload: UploadPayload<S>,
    /// Sub-rectangle of a partial update; `None` overwrites the whole tile.
    pub dirty_rect: Option<PixelRect>,
    pub backfill_from: Option<TextureHandle>,
}

impl<S> TransferRequest<S> {
    fn region(&self) -> PixelRect {
        self.dirty_rect
            .unwrap_or(PixelRect::full(TILE_WIDTH, TILE_HEIGHT))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer queue is discarding all entries")]
    QueueClosed,
    #[error("GPU context lost during drain")]
    ContextLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    Empty,
    PendingBlit,
    PendingDiscard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub uploaded: usize,
    pub obsolete: usize,
    pub discarded: usize,
    pub failed: usize,
    pub backfilled: usize,
    pub released: usize,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        *self == DrainReport::default()
    }
}

#[derive(Debug)]
enum Slot<S> {
    Empty,
    PendingBlit(TransferRequest<S>),
    PendingDiscard(TransferTarget),
}

impl<S> Slot<S> {
    fn status(&self) -> SlotStatus {
        match self {
            Slot::Empty => SlotStatus::Empty,
            Slot::PendingBlit(_) => SlotStatus::PendingBlit,
            Slot::PendingDiscard(_) => SlotStatus::PendingDiscard,
        }
    }
}

#[derive(Debug)]
struct Ring<S> {
    slots: Vec<Slot<S>>,
    write_cursor: usize,
    read_cursor: usize,
    empty_count: usize,
    discard_all: bool,
}

impl<S> Ring<S> {
    fn recount(&mut self) {
        self.empty_count = self
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Empty))
            .count();
    }
}

#[derive(Debug)]
pub struct TransferQueue<S> {
    ring: Mutex<Ring<S>>,
    slot_freed: Condvar,
}

impl<S> TransferQueue<S> {
    pub fn new(size: TransferQueueSize) -> Self {
        let slot_count = size.slots().max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: (0..slot_count).map(|_| Slot::Empty).collect(),
                write_cursor: 0,
                read_cursor: 0,
                empty_count: slot_count,
                discard_all: false,
            }),
            slot_freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<S>> {
        self.ring.lock().expect("transfer queue lock poisoned")
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Producer side. Blocks while the ring is full; fails at once while
    /// discard-all is raised. A failed enqueue means the paint failed.
    pub fn try_enqueue(&self, request: TransferRequest<S>) -> Result<(), TransferError> {
        let mut ring = self.lock();
        loop {
            if ring.discard_all {
                return Err(TransferError::QueueClosed);
            }
            if ring.empty_count > 0 {
                break;
            }
            ring = self
                .slot_freed
                .wait(ring)
                .expect("transfer queue lock poisoned");
        }
        let cursor = ring.write_cursor;
        assert!(
            matches!(ring.slots[cursor], Slot::Empty),
            "transfer ring slot at write cursor must be empty"
        );
        ring.slots[cursor] = Slot::PendingBlit(request);
        ring.write_cursor = (cursor + 1) % ring.slots.len();
        ring.empty_count -= 1;
        Ok(())
    }

    /// Consumer side, on the thread owning the GPU context. Applies every
    /// pending entry oldest first, drops obsolete ones and releases deferred
    /// pool storage.
    pub fn drain_ready<B>(
        &self,
        backend: &mut B,
        pool: &TexturePoolManager,
    ) -> Result<DrainReport, TransferError>
    where
        B: TextureBackend<Surface = S>,
    {
        let mut report = DrainReport::default();
        let entries = {
            let mut ring = self.lock();
            let len = ring.slots.len();
            let pending = len - ring.empty_count;
            let mut entries = Vec::with_capacity(pending);
            for step in 0..pending {
                let index = (ring.read_cursor + step) % len;
                entries.push(std::mem::replace(&mut ring.slots[index], Slot::Empty));
            }
            ring.read_cursor = (ring.read_cursor + pending) % len;
            entries
        };

        let mut context_lost = backend.is_context_lost();
        for id in pool.take_released_storage() {
            backend.release_storage(id);
            report.released += 1;
        }
        for entry in entries {
            let request = match entry {
                Slot::Empty => continue,
                Slot::PendingDiscard(_) => {
                    report.discarded += 1;
                    continue;
                }
                Slot::PendingBlit(request) => request,
            };
            if context_lost {
                report.discarded += 1;
                continue;
            }
            match self.apply(backend, pool, &request, &mut report) {
                Ok(()) => {}
                Err(BackendError::ContextLost) => {
                    log::error!("GPU context lost while draining transfer queue");
                    context_lost = true;
                    report.discarded += 1;
                }
                Err(error) => {
                    log::warn!(
                        "upload into {} for tile ({}, {}) failed: {}",
                        request.target.texture.id(),
                        request.target.key.x,
                        request.target.key.y,
                        error
                    );
                    pool.mark_paint_failed(request.target.texture, request.target.ticket);
                    report.failed += 1;
                }
            }
        }
        if !context_lost && let Err(error) = backend.flush() {
            if error == BackendError::ContextLost {
                context_lost = true;
            } else {
                log::warn!("transfer flush failed: {}", error);
            }
        }

        {
            let mut ring = self.lock();
            ring.recount();
        }
        self.slot_freed.notify_all();

        if context_lost {
            self.set_pending_discard_all();
            return Err(TransferError::ContextLost);
        }
        if report.obsolete > 0 {
            log::debug!("dropped {} obsolete transfer entries", report.obsolete);
        }
        Ok(report)
    }

    fn apply<B>(
        &self,
        backend: &mut B,
        pool: &TexturePoolManager,
        request: &TransferRequest<S>,
        report: &mut DrainReport,
    ) -> Result<(), BackendError>
    where
        B: TextureBackend<Surface = S>,
    {
        let target = &request.target;
        if !pool.validate_upload(target) {
            log::trace!(
                "obsolete upload for tile ({}, {}) at scale {}",
                target.key.x,
                target.key.y,
                target.key.scale
            );
            report.obsolete += 1;
            return Ok(());
        }
        let texture = target.texture.id();
        backend.ensure_storage(texture)?;
        if let Some(front) = request.backfill_from {
            let usable = pool.is_owned_by(front, target.tile)
                && pool.content(front) == Some(TextureContent::Presented);
            if !usable {
                // Front went away; the partial payload alone would leave garbage.
                pool.mark_paint_failed(target.texture, target.ticket);
                report.obsolete += 1;
                return Ok(());
            }
            backend.copy_texture(front.id(), texture)?;
            report.backfilled += 1;
        }
        let region = request.region();
        match &request.payload {
            UploadPayload::Cpu(pixels) => backend.upload_pixels(texture, region, pixels)?,
            UploadPayload::Surface(surface) => {
                backend.copy_from_surface(texture, region, surface)?
            }
        }
        if pool.complete_upload(target) {
            report.uploaded += 1;
        } else {
            report.obsolete += 1;
        }
        Ok(())
    }

    /// Turns every pending blit into a discard, dropping its payload, and
    /// wakes blocked producers so they observe failure. Safe from any thread.
    pub fn set_pending_discard_all(&self) {
        let mut ring = self.lock();
        ring.discard_all = true;
        for slot in &mut ring.slots {
            if let Slot::PendingBlit(request) = slot {
                let target = request.target;
                *slot = Slot::PendingDiscard(target);
            }
        }
        drop(ring);
        self.slot_freed.notify_all();
    }

    /// Clears the discard signal after re-initialization. Entries still held
    /// are dropped. Returns how many were dropped.
    pub fn reopen(&self) -> usize {
        let mut ring = self.lock();
        let dropped = ring
            .slots
            .iter()
            .filter(|slot| !matches!(slot, Slot::Empty))
            .count();
        for slot in &mut ring.slots {
            *slot = Slot::Empty;
        }
        ring.write_cursor = 0;
        ring.read_cursor = 0;
        ring.empty_count = ring.slots.len();
        ring.discard_all = false;
        drop(ring);
        self.slot_freed.notify_all();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().discard_all
    }

    pub fn pending_count(&self) -> usize {
        let ring = self.lock();
        ring.slots.len() - ring.empty_count
    }

    pub fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.lock().slots.iter().map(Slot::status).collect()
    }
}
