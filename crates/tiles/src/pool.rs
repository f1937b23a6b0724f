//! Texture pool manager.
//!
//! One slot per texture, split into a base pool and a layer pool. Ownership is
//! tracked by slot generation: handing a slot to a new owner bumps the
//! generation, so every copy of the previous [`TextureHandle`] goes stale and is
//! rejected by every operation here. Tiles therefore never need back-pointers
//! to be told that their texture was stolen.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bitvec::prelude::{BitVec, Lsb0};
use render_protocol::{TextureId, TextureKind, TileKey};

use crate::tier::{DeviceTier, TextureCapacity};
use crate::transfer::TransferTarget;

static NEXT_TILE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one tile record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId(u64);

impl TileId {
    pub fn next() -> Self {
        Self(NEXT_TILE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    id: TextureId,
    generation: u32,
}

impl TextureHandle {
    pub fn id(self) -> TextureId {
        self.id
    }

    pub fn kind(self) -> TextureKind {
        self.id.kind
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Identifies one scheduled paint of one texture. Only the latest ticket of a
/// slot can be uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaintTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureContent {
    Empty,
    PaintScheduled { ticket: PaintTicket },
    AwaitingUpload { ticket: PaintTicket },
    UploadComplete { ticket: PaintTicket },
    PaintFailed { ticket: PaintTicket },
    Presented,
}

impl TextureContent {
    fn ticket(self) -> Option<PaintTicket> {
        match self {
            TextureContent::PaintScheduled { ticket }
            | TextureContent::AwaitingUpload { ticket }
            | TextureContent::UploadComplete { ticket }
            | TextureContent::PaintFailed { ticket } => Some(ticket),
            TextureContent::Empty | TextureContent::Presented => None,
        }
    }

    fn is_busy(self) -> bool {
        matches!(
            self,
            TextureContent::PaintScheduled { .. } | TextureContent::AwaitingUpload { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexturePoolConfig {
    pub tier: DeviceTier,
}

impl Default for TexturePoolConfig {
    fn default() -> Self {
        Self::with_tier(DeviceTier::default())
    }
}

impl TexturePoolConfig {
    pub const fn with_tier(tier: DeviceTier) -> Self {
        Self { tier }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcquireRequest {
    pub kind: TextureKind,
    pub tile: TileId,
    pub key: TileKey,
    pub current_back: Option<TextureHandle>,
    pub current_front: Option<TextureHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindStats {
    pub live: usize,
    pub owned: usize,
    pub available: usize,
    pub busy: usize,
    pub acquired_this_frame: u32,
    pub failed_this_frame: u32,
    pub stolen_this_frame: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub frame: u64,
    pub base: KindStats,
    pub layer: KindStats,
    pub layer_textures_remain: bool,
    pub pending_storage_release: usize,
}

impl PoolStats {
    pub fn kind(&self, kind: TextureKind) -> &KindStats {
        match kind {
            TextureKind::Base => &self.base,
            TextureKind::Layer => &self.layer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TextureOwner {
    tile: TileId,
    key: TileKey,
}

#[derive(Debug, Clone, Copy)]
struct TextureSlot {
    generation: u32,
    retired: bool,
    owner: Option<TextureOwner>,
    last_used_frame: Option<u64>,
    content: TextureContent,
}

impl TextureSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            retired: false,
            owner: None,
            last_used_frame: None,
            content: TextureContent::Empty,
        }
    }

    fn detach(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.owner = None;
        self.last_used_frame = None;
        self.content = TextureContent::Empty;
    }
}

#[derive(Debug, Default)]
struct KindPool {
    slots: Vec<TextureSlot>,
    available: BitVec<u64, Lsb0>,
    acquired_this_frame: u32,
    failed_this_frame: u32,
    stolen_this_frame: u32,
}

impl KindPool {
    fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.retired).count()
    }

    fn owned_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.retired && slot.owner.is_some())
            .count()
    }

    fn set_available(&mut self, index: usize, available: bool) {
        if self.available.len() <= index {
            self.available.resize(index + 1, false);
        }
        self.available.set(index, available);
    }

    fn resize_to(&mut self, target: usize, kind: TextureKind, released: &mut Vec<TextureId>) {
        let live = self.live_count();
        if target > live {
            let mut missing = target - live;
            for index in 0..self.slots.len() {
                if missing == 0 {
                    break;
                }
                let slot = &mut self.slots[index];
                if slot.retired {
                    slot.retired = false;
                    slot.detach();
                    self.set_available(index, true);
                    missing -= 1;
                }
            }
            for _ in 0..missing {
                let index = self.slots.len();
                self.slots.push(TextureSlot::new());
                self.set_available(index, true);
            }
        } else if target < live {
            let mut excess = live - target;
            for index in (0..self.slots.len()).rev() {
                if excess == 0 {
                    break;
                }
                let slot = &mut self.slots[index];
                if slot.retired || slot.owner.is_some() {
                    continue;
                }
                slot.retired = true;
                slot.detach();
                self.set_available(index, false);
                released.push(texture_id(kind, index));
                excess -= 1;
            }
        }
    }

    fn stats(&self) -> KindStats {
        KindStats {
            live: self.live_count(),
            owned: self.owned_count(),
            available: self.available.count_ones(),
            busy: self
                .slots
                .iter()
                .filter(|slot| !slot.retired && slot.content.is_busy())
                .count(),
            acquired_this_frame: self.acquired_this_frame,
            failed_this_frame: self.failed_this_frame,
            stolen_this_frame: self.stolen_this_frame,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    pools: [KindPool; 2],
    frame: u64,
    layer_textures_remain: bool,
    next_ticket: u64,
    released_storage: Vec<TextureId>,
}

impl PoolState {
    fn slot(&self, handle: TextureHandle) -> Option<&TextureSlot> {
        let slot = self.pools[handle.kind().index()]
            .slots
            .get(handle.id.index as usize)?;
        (!slot.retired && slot.generation == handle.generation).then_some(slot)
    }

    fn slot_mut(&mut self, handle: TextureHandle) -> Option<&mut TextureSlot> {
        let slot = self.pools[handle.kind().index()]
            .slots
            .get_mut(handle.id.index as usize)?;
        (!slot.retired && slot.generation == handle.generation).then_some(slot)
    }

    fn owned_slot_mut(&mut self, handle: TextureHandle, tile: TileId) -> Option<&mut TextureSlot> {
        self.slot_mut(handle)
            .filter(|slot| slot.owner.is_some_and(|owner| owner.tile == tile))
    }
}

fn texture_id(kind: TextureKind, index: usize) -> TextureId {
    TextureId {
        kind,
        index: u32::try_from(index).expect("texture pool index exceeds u32"),
    }
}

/// Broker for all tile textures. Shared between the thread owning the GPU
/// context and the paint workers, which only touch content state.
#[derive(Debug)]
pub struct TexturePoolManager {
    config: TexturePoolConfig,
    state: Mutex<PoolState>,
}

impl TexturePoolManager {
    pub fn new(config: TexturePoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                pools: [KindPool::default(), KindPool::default()],
                frame: 0,
                layer_textures_remain: true,
                next_ticket: 1,
                released_storage: Vec::new(),
            }),
        }
    }

    pub fn with_capacity(config: TexturePoolConfig, capacity: TextureCapacity) -> Self {
        let pool = Self::new(config);
        pool.configure_capacity(capacity);
        pool
    }

    pub fn config(&self) -> TexturePoolConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("texture pool lock poisoned")
    }

    /// Resizes both pools. Requests are clamped to the tier ceilings and never
    /// shrink a pool below its owned count. Returns the resulting live counts.
    pub fn configure_capacity(&self, requested: TextureCapacity) -> TextureCapacity {
        let clamped = requested.clamp_to(self.config.tier.ceilings());
        let mut state = self.lock();
        let PoolState {
            pools,
            released_storage,
            ..
        } = &mut *state;
        for kind in TextureKind::ALL {
            let target = match kind {
                TextureKind::Base => clamped.base,
                TextureKind::Layer => clamped.layer,
            } as usize;
            pools[kind.index()].resize_to(target, kind, released_storage);
        }
        let applied = TextureCapacity::new(
            pools[TextureKind::Base.index()].live_count() as u32,
            pools[TextureKind::Layer.index()].live_count() as u32,
        );
        log::debug!(
            "texture pool capacity requested {}/{} applied {}/{}",
            requested.base,
            requested.layer,
            applied.base,
            applied.layer
        );
        applied
    }

    /// Starts a frame: advances the frame counter, makes every live slot
    /// available again and resets the layer "textures remain" signal.
    pub fn begin_frame_gather(&self) -> u64 {
        let mut state = self.lock();
        state.frame += 1;
        state.layer_textures_remain = true;
        for pool in &mut state.pools {
            let len = pool.slots.len();
            pool.available.clear();
            pool.available.resize(len, false);
            for index in 0..len {
                if !pool.slots[index].retired {
                    pool.available.set(index, true);
                }
            }
            pool.acquired_this_frame = 0;
            pool.failed_this_frame = 0;
            pool.stolen_this_frame = 0;
        }
        state.frame
    }

    pub fn current_frame(&self) -> u64 {
        self.lock().frame
    }

    /// Hands out a texture for `request.tile`.
    ///
    /// Priority: the requester's own still-valid back texture, then an unowned
    /// slot, then the slot used longest ago, provided it was not used in this
    /// or the previous frame. A slot counts as used when it is acquired, when
    /// its tile is prepared and when it is drawn. Slots with a paint in flight
    /// and the requester's own front are never candidates.
    pub fn acquire(&self, request: AcquireRequest) -> Option<TextureHandle> {
        let mut state = self.lock();
        let frame = state.frame;
        let kind_index = request.kind.index();

        if let Some(back) = request.current_back
            && back.kind() == request.kind
            && let Some(slot) = state.owned_slot_mut(back, request.tile)
        {
            slot.last_used_frame = Some(frame);
            let pool = &mut state.pools[kind_index];
            pool.set_available(back.id.index as usize, false);
            pool.acquired_this_frame += 1;
            return Some(back);
        }

        let excluded = |index: usize| {
            [request.current_front, request.current_back]
                .into_iter()
                .flatten()
                .any(|handle| handle.kind() == request.kind && handle.id.index as usize == index)
        };

        let pool = &state.pools[kind_index];
        let mut unowned = None;
        let mut oldest: Option<(usize, u64)> = None;
        for index in pool.available.iter_ones() {
            let Some(slot) = pool.slots.get(index) else {
                continue;
            };
            if slot.retired || excluded(index) || slot.content.is_busy() {
                continue;
            }
            if slot.owner.is_none() {
                unowned = Some(index);
                break;
            }
            let used = slot.last_used_frame.unwrap_or(0);
            if used.saturating_add(1) >= frame {
                continue;
            }
            if oldest.is_none_or(|(_, best)| used < best) {
                oldest = Some((index, used));
            }
        }

        let stolen = unowned.is_none();
        let Some(index) = unowned.or(oldest.map(|(index, _)| index)) else {
            let pool = &mut state.pools[kind_index];
            pool.failed_this_frame += 1;
            match request.kind {
                TextureKind::Layer => state.layer_textures_remain = false,
                TextureKind::Base => {}
            }
            log::trace!(
                "no {:?} texture for tile ({}, {}) at scale {}",
                request.kind,
                request.key.x,
                request.key.y,
                request.key.scale
            );
            return None;
        };

        let pool = &mut state.pools[kind_index];
        let slot = &mut pool.slots[index];
        if stolen && let Some(previous) = slot.owner {
            log::trace!(
                "texture {} stolen from tile ({}, {}) for tile ({}, {})",
                texture_id(request.kind, index),
                previous.key.x,
                previous.key.y,
                request.key.x,
                request.key.y
            );
        }
        slot.detach();
        slot.owner = Some(TextureOwner {
            tile: request.tile,
            key: request.key,
        });
        slot.last_used_frame = Some(frame);
        let handle = TextureHandle {
            id: texture_id(request.kind, index),
            generation: slot.generation,
        };
        pool.set_available(index, false);
        pool.acquired_this_frame += 1;
        if stolen {
            pool.stolen_this_frame += 1;
        }
        Some(handle)
    }

    pub fn is_valid(&self, handle: TextureHandle) -> bool {
        self.lock().slot(handle).is_some()
    }

    pub fn is_owned_by(&self, handle: TextureHandle, tile: TileId) -> bool {
        self.lock()
            .slot(handle)
            .is_some_and(|slot| slot.owner.is_some_and(|owner| owner.tile == tile))
    }

    pub fn owner_key(&self, handle: TextureHandle) -> Option<TileKey> {
        self.lock()
            .slot(handle)
            .and_then(|slot| slot.owner.map(|owner| owner.key))
    }

    /// Returns the slot to the unowned state. Any in-flight upload for the old
    /// generation becomes obsolete.
    pub fn release(&self, handle: TextureHandle) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slot_mut(handle) else {
            return false;
        };
        slot.detach();
        state.pools[handle.kind().index()].set_available(handle.id.index as usize, true);
        true
    }

    /// Moves a texture to a new key of the same tile. Content for the old key
    /// is dropped.
    pub fn rekey(&self, handle: TextureHandle, tile: TileId, key: TileKey) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.owned_slot_mut(handle, tile) else {
            return false;
        };
        slot.owner = Some(TextureOwner { tile, key });
        slot.content = TextureContent::Empty;
        true
    }

    /// Stamps the texture as used this frame, shielding it from reclaim until
    /// the end of the next frame.
    pub fn mark_used(&self, handle: TextureHandle) -> bool {
        let mut state = self.lock();
        let frame = state.frame;
        let Some(slot) = state.slot_mut(handle) else {
            return false;
        };
        slot.last_used_frame = Some(frame);
        true
    }

    pub fn last_used_frame(&self, handle: TextureHandle) -> Option<u64> {
        self.lock()
            .slot(handle)
            .and_then(|slot| slot.last_used_frame)
    }

    pub fn content(&self, handle: TextureHandle) -> Option<TextureContent> {
        self.lock().slot(handle).map(|slot| slot.content)
    }

    /// Issues a fresh ticket; any earlier ticket for this texture is superseded.
    pub fn schedule_paint(&self, handle: TextureHandle) -> Option<PaintTicket> {
        let mut state = self.lock();
        let ticket = PaintTicket(state.next_ticket);
        let slot = state.slot_mut(handle)?;
        slot.content = TextureContent::PaintScheduled { ticket };
        state.next_ticket += 1;
        Some(ticket)
    }

    pub fn mark_enqueued(&self, handle: TextureHandle, ticket: PaintTicket) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slot_mut(handle) else {
            return false;
        };
        if slot.content != (TextureContent::PaintScheduled { ticket }) {
            return false;
        }
        slot.content = TextureContent::AwaitingUpload { ticket };
        true
    }

    pub fn mark_paint_failed(&self, handle: TextureHandle, ticket: PaintTicket) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slot_mut(handle) else {
            return false;
        };
        if slot.content.ticket() != Some(ticket)
            || matches!(slot.content, TextureContent::UploadComplete { .. })
        {
            return false;
        }
        slot.content = TextureContent::PaintFailed { ticket };
        true
    }

    /// True while `target` still names the current owner, key and ticket of
    /// its texture.
    pub fn validate_upload(&self, target: &TransferTarget) -> bool {
        self.lock()
            .slot(target.texture)
            .is_some_and(|slot| Self::target_matches(slot, target))
    }

    pub fn complete_upload(&self, target: &TransferTarget) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slot_mut(target.texture) else {
            return false;
        };
        if !Self::target_matches(slot, target) {
            return false;
        }
        slot.content = TextureContent::UploadComplete {
            ticket: target.ticket,
        };
        true
    }

    fn target_matches(slot: &TextureSlot, target: &TransferTarget) -> bool {
        slot.owner
            .is_some_and(|owner| owner.tile == target.tile && owner.key == target.key)
            && slot.content
                == (TextureContent::AwaitingUpload {
                    ticket: target.ticket,
                })
    }

    /// Marks an uploaded back texture as the tile's drawable front.
    pub fn mark_presented(&self, handle: TextureHandle) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slot_mut(handle) else {
            return false;
        };
        if !matches!(slot.content, TextureContent::UploadComplete { .. }) {
            return false;
        }
        slot.content = TextureContent::Presented;
        true
    }

    /// Turns a former front into a back texture; its pixels are kept for
    /// backfill but no longer count as presentable.
    pub fn demote_to_back(&self, handle: TextureHandle) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slot_mut(handle) else {
            return false;
        };
        slot.content = TextureContent::Empty;
        true
    }

    /// Context loss: every handle goes stale and all slots become unowned.
    /// GPU storage is gone with the context, so nothing is queued for release.
    pub fn reset_all(&self) {
        let mut state = self.lock();
        for pool in &mut state.pools {
            for index in 0..pool.slots.len() {
                let slot = &mut pool.slots[index];
                slot.detach();
                let live = !slot.retired;
                pool.set_available(index, live);
            }
        }
        state.layer_textures_remain = true;
        state.released_storage.clear();
        log::warn!("texture pool reset, all tile textures dropped");
    }

    /// GPU storage of retired slots, to be released on the GPU thread.
    pub fn take_released_storage(&self) -> Vec<TextureId> {
        std::mem::take(&mut self.lock().released_storage)
    }

    pub fn layer_textures_remain(&self) -> bool {
        self.lock().layer_textures_remain
    }

    pub fn capacity(&self) -> TextureCapacity {
        let state = self.lock();
        TextureCapacity::new(
            state.pools[TextureKind::Base.index()].live_count() as u32,
            state.pools[TextureKind::Layer.index()].live_count() as u32,
        )
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            frame: state.frame,
            base: state.pools[TextureKind::Base.index()].stats(),
            layer: state.pools[TextureKind::Layer.index()].stats(),
            layer_textures_remain: state.layer_textures_remain,
            pending_storage_release: state.released_storage.len(),
        }
    }
}
