use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use render_protocol::{
    Color, ContentRect, IDENTITY_TRANSFORM, PixelBuffer, PixelRect, TextureKind, TilePainter,
};

use super::*;
use crate::test_helpers::{
    RecordingScheduler, RecordingSink, SolidPainter, painter_ids, run_jobs_inline, test_pool,
};

/// Encodes the painted content origin and scale into the pixel color.
struct CoordinatePainter;

impl CoordinatePainter {
    fn color_for(x: f32, y: f32, scale: f32) -> [u8; 4] {
        [
            ((x * scale / TILE_WIDTH as f32).round() as i32).rem_euclid(256) as u8,
            ((y * scale / TILE_HEIGHT as f32).round() as i32).rem_euclid(256) as u8,
            (scale * 10.0).round() as u8,
            255,
        ]
    }
}

impl TilePainter for CoordinatePainter {
    fn paint(&self, target: &mut PixelBuffer, content_rect: ContentRect, scale: f32) -> bool {
        let [r, g, b, a] = Self::color_for(content_rect.x, content_rect.y, scale);
        target.fill(Color::rgba(r, g, b, a));
        true
    }
}

fn context<'a>(
    pool: &'a TexturePoolManager,
    scheduler: &'a RecordingScheduler,
) -> PrepareContext<'a> {
    PrepareContext {
        pool,
        scheduler,
        backfill: BackfillPolicy::OnPartialUpdate,
        allow_paint: true,
    }
}

fn solid_painter() -> PainterRef {
    PainterRef::new(painter_ids(1)[0], Arc::new(SolidPainter::new(Color::WHITE)))
}

/// One frame of the GPU thread: gather, drain, prepare, run paints inline.
fn run_frame(
    pool: &TexturePoolManager,
    scheduler: &RecordingScheduler,
    queue: &TransferQueue<PixelBuffer>,
    backend: &mut MemoryTextureBackend,
    texture: &mut TiledTexture,
    area: ContentRect,
    scale: f32,
    painter: &PainterRef,
) -> DrawOutcome {
    pool.begin_frame_gather();
    queue.drain_ready(backend, pool).expect("drain");
    texture.prepare(&context(pool, scheduler), scale, area, painter);
    run_jobs_inline(pool, queue, scheduler.take_jobs());
    let mut sink = RecordingSink::default();
    texture.draw_all(pool, &mut sink, area, 1.0, IDENTITY_TRANSFORM)
}

#[test]
fn scenario_exact_pool_covers_two_by_two_grid() {
    let pool = test_pool(4, 0);
    let scheduler = RecordingScheduler::default();
    let painter = solid_painter();
    let mut texture = TiledTexture::new(TextureKind::Base);

    pool.begin_frame_gather();
    let scheduled = texture.prepare(
        &context(&pool, &scheduler),
        1.0,
        ContentRect::new(0.0, 0.0, 512.0, 512.0),
        &painter,
    );
    let stats = pool.stats();
    assert_eq!(scheduled, 4);
    assert_eq!(stats.base.acquired_this_frame, 4);
    assert_eq!(stats.base.failed_this_frame, 0);
}

#[test]
fn scenario_starved_pool_still_reports_ready() {
    let pool = test_pool(4, 0);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Efficient);
    let mut backend = MemoryTextureBackend::default();
    let painter = solid_painter();
    let mut texture = TiledTexture::new(TextureKind::Base);
    let small = ContentRect::new(0.0, 0.0, 512.0, 512.0);

    pool.begin_frame_gather();
    texture.prepare(&context(&pool, &scheduler), 1.0, small, &painter);
    run_jobs_inline(&pool, &queue, scheduler.take_jobs());
    queue.drain_ready(&mut backend, &pool).expect("drain");
    let mut sink = RecordingSink::default();
    let outcome = texture.draw_all(&pool, &mut sink, small, 1.0, IDENTITY_TRANSFORM);
    assert_eq!(outcome.drawn, 4);

    pool.begin_frame_gather();
    let large = ContentRect::new(0.0, 0.0, 768.0, 768.0);
    let scheduled = texture.prepare(&context(&pool, &scheduler), 1.0, large, &painter);
    let stats = pool.stats();
    assert_eq!(scheduled, 0);
    assert_eq!(stats.base.failed_this_frame, 5);
    assert_eq!(stats.base.owned, 4);
    let textured = texture
        .tiles()
        .filter(|(_, tile)| tile.has_presentable_front(&pool))
        .count();
    assert_eq!(textured, 4);
    assert!(texture.is_ready(&pool));
}

#[test]
fn starved_grid_keeps_drawing_the_tiles_it_holds() {
    let pool = test_pool(4, 0);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Efficient);
    let mut backend = MemoryTextureBackend::default();
    let painter = solid_painter();
    let mut texture = TiledTexture::new(TextureKind::Base);
    let area = ContentRect::new(0.0, 0.0, 768.0, 768.0);

    let mut drawn = Vec::new();
    for _ in 0..12 {
        let outcome = run_frame(
            &pool,
            &scheduler,
            &queue,
            &mut backend,
            &mut texture,
            area,
            1.0,
            &painter,
        );
        assert_eq!(pool.stats().base.stolen_this_frame, 0);
        drawn.push(outcome.drawn);
    }
    assert!(drawn[1..].iter().all(|&count| count == 4), "drawn per frame: {drawn:?}");
    assert_eq!(backend.upload_count(), 4);

    let outcome = run_frame(
        &pool,
        &scheduler,
        &queue,
        &mut backend,
        &mut texture,
        area,
        1.0,
        &painter,
    );
    assert_eq!(outcome.starved, 5);
    assert!(!outcome.needs_redraw());
    assert!(texture.is_ready(&pool));
}

#[test]
fn scenario_rekeyed_tile_drops_queued_upload() {
    let pool = test_pool(4, 0);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Minimal);
    let mut backend = MemoryTextureBackend::default();
    let painter = solid_painter();
    let mut texture = TiledTexture::new(TextureKind::Base);

    pool.begin_frame_gather();
    texture.prepare(
        &context(&pool, &scheduler),
        1.0,
        ContentRect::new(512.0, 768.0, 256.0, 256.0),
        &painter,
    );
    let jobs = scheduler.take_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!((jobs[0].target.key.x, jobs[0].target.key.y), (2, 3));
    let queued_texture = jobs[0].target.texture;
    run_jobs_inline(&pool, &queue, jobs);
    assert_eq!(queue.pending_count(), 1);

    texture.prepare(
        &context(&pool, &scheduler),
        2.0,
        ContentRect::new(256.0, 384.0, 128.0, 128.0),
        &painter,
    );
    let tile = texture.tile(2, 3).expect("tile (2, 3)");
    assert_eq!(tile.key().map(|key| key.scale), Some(2.0));
    assert_eq!(tile.back(), Some(queued_texture));

    let report = queue.drain_ready(&mut backend, &pool).expect("drain");
    assert_eq!(report.obsolete, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(backend.upload_count(), 0);
    assert!(backend.texture_pixels(queued_texture.id()).is_none());
    assert!(matches!(
        pool.content(queued_texture),
        Some(TextureContent::PaintScheduled { .. })
    ));
}

#[test]
fn scenario_full_ring_blocks_until_drain() {
    let pool = test_pool(2, 0);
    let painter = painter_ids(1)[0];
    let queue = TransferQueue::<PixelBuffer>::new(TransferQueueSize::Custom(1));
    pool.begin_frame_gather();

    let mut targets = Vec::new();
    for x in 0..2 {
        let tile = TileId::next();
        let key = render_protocol::TileKey::new(x, 0, 1.0, painter);
        let texture = pool
            .acquire(AcquireRequest {
                kind: TextureKind::Base,
                tile,
                key,
                current_back: None,
                current_front: None,
            })
            .expect("texture");
        let ticket = pool.schedule_paint(texture).expect("ticket");
        pool.mark_enqueued(texture, ticket);
        targets.push(TransferTarget {
            tile,
            key,
            texture,
            ticket,
        });
    }
    let request = |target: TransferTarget| TransferRequest {
        target,
        payload: UploadPayload::Cpu(PixelBuffer::new(TILE_WIDTH, TILE_HEIGHT)),
        dirty_rect: None,
        backfill_from: None,
    };

    queue.try_enqueue(request(targets[0])).expect("first enqueue");
    let drained = AtomicBool::new(false);
    let (sender, receiver) = mpsc::channel();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let result = queue.try_enqueue(request(targets[1]));
            sender
                .send((result, drained.load(Ordering::SeqCst)))
                .expect("send enqueue result");
        });

        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
        let mut backend = MemoryTextureBackend::default();
        drained.store(true, Ordering::SeqCst);
        let report = queue.drain_ready(&mut backend, &pool).expect("drain");
        assert_eq!(report.uploaded, 1);

        let (result, after_drain) = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("second enqueue unblocked");
        assert_eq!(result, Ok(()));
        assert!(after_drain);
    });
    assert_eq!(queue.pending_count(), 1);
}

#[test]
fn scenario_zoom_keeps_front_drawable_until_atomic_swap() {
    let pool = test_pool(16, 0);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Efficient);
    let mut backend = MemoryTextureBackend::default();
    let painter = solid_painter();
    let area = ContentRect::new(0.0, 0.0, 256.0, 256.0);
    let mut dual = DualTiledTexture::new(TextureKind::Base, DEFAULT_ZOOM_DEBOUNCE);
    let start = Instant::now();

    let mut frame = |dual: &mut DualTiledTexture, now: Instant, scale: f32| {
        pool.begin_frame_gather();
        queue.drain_ready(&mut backend, &pool).expect("drain");
        let swapped = dual.prepare(&context(&pool, &scheduler), now, scale, area, &painter);
        run_jobs_inline(&pool, &queue, scheduler.take_jobs());
        let mut sink = RecordingSink::default();
        let outcome = dual.draw(&pool, &mut sink, area, 1.0, IDENTITY_TRANSFORM);
        (swapped, outcome, sink)
    };

    for step in 0..3 {
        frame(&mut dual, start + Duration::from_millis(step), 1.0);
    }
    assert_eq!(dual.current_scale(), Some(1.0));
    assert!(dual.is_ready(&pool));

    let mut now = start + Duration::from_millis(10);
    let mut swapped_at = None;
    for step in 0..20 {
        let (swapped, outcome, sink) = frame(&mut dual, now, 2.0);
        if swapped {
            swapped_at = Some(step);
            assert_eq!(dual.front().scale(), Some(2.0));
            assert!(dual.back().scale().is_none());
            break;
        }
        // Until the swap the old scale is the only thing drawn.
        assert_eq!(dual.current_scale(), Some(1.0));
        assert_eq!(dual.front().scale(), Some(1.0));
        assert!(dual.is_ready(&pool));
        assert_eq!(outcome.drawn, 1);
        assert_eq!(sink.quads.len(), 1);
        now += Duration::from_millis(50);
    }
    let swapped_at = swapped_at.expect("back buffer swapped in");
    assert!(swapped_at >= 4, "swap must wait for the debounce");

    let (_, outcome, sink) = frame(&mut dual, now, 2.0);
    assert_eq!(outcome.drawn, 4);
    assert_eq!(sink.quads.len(), 4);
    assert_eq!(dual.zoom_state(), Some(ZoomState::Stable { scale: 2.0 }));
}

#[test]
fn textures_are_never_shared_between_live_tiles() {
    let pool = test_pool(6, 3);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Minimal);
    let mut backend = MemoryTextureBackend::default();
    let ids = painter_ids(2);
    let base_painter = PainterRef::new(ids[0], Arc::new(SolidPainter::new(Color::WHITE)));
    let layer_painter = PainterRef::new(ids[1], Arc::new(SolidPainter::new(Color::WHITE)));
    let mut base = TiledTexture::new(TextureKind::Base);
    let mut layer = TiledTexture::new(TextureKind::Layer);

    for step in 0..24 {
        let offset = (step % 8) as f32 * 96.0;
        let scale = if step % 10 < 5 { 1.0 } else { 1.5 };
        let base_area = ContentRect::new(0.0, offset, 400.0, 500.0);
        let layer_area = ContentRect::new(offset, 0.0, 300.0, 256.0);
        run_frame(
            &pool,
            &scheduler,
            &queue,
            &mut backend,
            &mut base,
            base_area,
            scale,
            &base_painter,
        );
        run_frame(
            &pool,
            &scheduler,
            &queue,
            &mut backend,
            &mut layer,
            layer_area,
            1.0,
            &layer_painter,
        );

        let mut held = HashSet::new();
        for texture in [&base, &layer] {
            for (_, tile) in texture.tiles() {
                for handle in [tile.front(), tile.back()].into_iter().flatten() {
                    if pool.is_owned_by(handle, tile.id()) {
                        assert!(
                            held.insert(handle.id()),
                            "texture {} held by two tiles",
                            handle.id()
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn drawn_textures_always_hold_their_tiles_content() {
    let pool = test_pool(5, 0);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Minimal);
    let mut backend = MemoryTextureBackend::default();
    let painter = PainterRef::new(painter_ids(1)[0], Arc::new(CoordinatePainter));
    let mut texture = TiledTexture::new(TextureKind::Base);

    for step in 0..30 {
        let scale = [1.0, 2.0, 0.5][(step / 4) % 3];
        let area = ContentRect::new(
            (step % 5) as f32 * 80.0,
            (step % 7) as f32 * 60.0,
            500.0,
            400.0,
        );
        pool.begin_frame_gather();
        queue.drain_ready(&mut backend, &pool).expect("drain");
        texture.prepare(&context(&pool, &scheduler), scale, area, &painter);
        run_jobs_inline(&pool, &queue, scheduler.take_jobs());

        let mut sink = RecordingSink::default();
        texture.draw_all(&pool, &mut sink, area, 1.0, IDENTITY_TRANSFORM);
        for quad in &sink.quads {
            let origin_x = quad.transform[12];
            let origin_y = quad.transform[13];
            let expected = CoordinatePainter::color_for(origin_x, origin_y, scale);
            let pixels = backend
                .texture_pixels(quad.texture)
                .expect("drawn texture has storage");
            assert_eq!(pixels.pixel(0, 0), Some(expected), "stale draw at step {step}");
        }
    }
}

#[test]
fn partial_repaint_uploads_only_the_dirty_rect() {
    let pool = test_pool(4, 0);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Minimal);
    let mut backend = MemoryTextureBackend::default();
    let solid = Arc::new(SolidPainter::new(Color::rgba(0, 0, 200, 255)));
    let painter = PainterRef::new(painter_ids(1)[0], solid.clone());
    let mut texture = TiledTexture::new(TextureKind::Base);
    let area = ContentRect::new(0.0, 0.0, 256.0, 256.0);

    for _ in 0..2 {
        run_frame(
            &pool,
            &scheduler,
            &queue,
            &mut backend,
            &mut texture,
            area,
            1.0,
            &painter,
        );
    }
    let front = texture.tile(0, 0).and_then(TileRecord::front).expect("front");
    assert_eq!(solid.paint_count(), 1);

    texture.invalidate(ContentRect::new(16.0, 16.0, 8.0, 8.0));
    pool.begin_frame_gather();
    texture.prepare(&context(&pool, &scheduler), 1.0, area, &painter);
    let jobs = scheduler.take_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].dirty_rect(), Some(PixelRect::new(16, 16, 8, 8)));
    assert_eq!(jobs[0].backfill_from, Some(front));
    run_jobs_inline(&pool, &queue, jobs);
    let report = queue.drain_ready(&mut backend, &pool).expect("drain");
    assert_eq!(report.backfilled, 1);
    assert_eq!(report.uploaded, 1);
}

#[test]
fn released_storage_reaches_backend_on_next_drain() {
    let pool = test_pool(4, 0);
    let queue = TransferQueue::<PixelBuffer>::new(TransferQueueSize::Minimal);
    let mut backend = MemoryTextureBackend::default();
    for index in 0..4 {
        backend
            .ensure_storage(render_protocol::TextureId {
                kind: TextureKind::Base,
                index,
            })
            .expect("storage");
    }
    pool.configure_capacity(TextureCapacity::new(1, 0));
    let report = queue.drain_ready(&mut backend, &pool).expect("drain");
    assert_eq!(report.released, 3);
    assert_eq!(backend.storage_count(), 1);
}

#[test]
fn failed_paint_is_retried_on_a_later_frame() {
    let pool = test_pool(2, 0);
    let scheduler = RecordingScheduler::default();
    let queue = TransferQueue::new(TransferQueueSize::Minimal);
    let mut backend = MemoryTextureBackend::default();
    let solid = Arc::new(SolidPainter::new(Color::WHITE));
    let painter = PainterRef::new(painter_ids(1)[0], solid.clone());
    let mut texture = TiledTexture::new(TextureKind::Base);
    let area = ContentRect::new(0.0, 0.0, 256.0, 256.0);

    solid.set_failing(true);
    let outcome = run_frame(
        &pool,
        &scheduler,
        &queue,
        &mut backend,
        &mut texture,
        area,
        1.0,
        &painter,
    );
    assert_eq!(outcome.missing, 1);

    solid.set_failing(false);
    for _ in 0..2 {
        run_frame(
            &pool,
            &scheduler,
            &queue,
            &mut backend,
            &mut texture,
            area,
            1.0,
            &painter,
        );
    }
    assert_eq!(solid.paint_count(), 2);
    assert_eq!(
        texture.tile(0, 0).map(|tile| tile.state(&pool)),
        Some(TileState::Ready)
    );
}
