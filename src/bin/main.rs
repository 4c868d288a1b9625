/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use decode_pipeline::{
    engine::MockEngine,
    pipeline::{DecodePipeline, PipelineConfig},
    work::{WorkFlags, WorkItem, WorkStatus},
    DecodeEngine, FrameGeometry,
};

use std::sync::Arc;
use std::time::Duration;

const SEGMENTS: u64 = 5;
const ITEMS_PER_SEGMENT: u64 = 16;

fn main() {
    env_logger::init();
    println!("--- Decode Pipeline Simulation ---");

    let on_work_done = |item: WorkItem| {
        let size = item.output.as_ref().map_or(0, |o| o.buffer.len());
        println!(
            "[MAIN_THREAD] Work {} finished: {:?} ({} output bytes)",
            item.ordinal, item.status, size
        );
        if matches!(item.status, WorkStatus::Failed(_)) {
            eprintln!("[MAIN_THREAD] Unexpected failure on work {}", item.ordinal);
        }
    };

    let geometry = FrameGeometry::default();
    let pipeline = DecodePipeline::new(
        Box::new(move || Ok(Box::new(MockEngine::new(geometry)) as Box<dyn DecodeEngine>)),
        Arc::new(on_work_done),
        PipelineConfig::default(),
    );
    pipeline.start().expect("pipeline worker failed to start");

    // --- Source Simulation Loop ---
    let mut ordinal: u64 = 0;
    for segment in 0..SEGMENTS {
        for _ in 0..ITEMS_PER_SEGMENT {
            // Input sizes jitter the way real access units do.
            let size = 200 + (rand::random::<usize>() % 1800);
            let mut item = WorkItem::new(vec![0; size], ordinal);
            ordinal += 1;
            if ordinal % ITEMS_PER_SEGMENT == 0 {
                item = item.with_flags(WorkFlags::END_OF_STREAM);
            }
            pipeline
                .queue(vec![item])
                .expect("pipeline rejected work while running");

            std::thread::sleep(Duration::from_millis(20));
        }

        let stats = pipeline.stats();
        println!(
            "\n[STATS] Segment {}: queued {} | pending {} | delivered {} | failed {}\n",
            segment, stats.queued, stats.pending, stats.delivered, stats.failed
        );

        std::thread::sleep(Duration::from_millis(200));
    }

    // Let the tail of the queue drain before shutting down.
    while pipeline.stats().queued > 0 {
        std::thread::sleep(Duration::from_millis(20));
    }
    pipeline.stop().expect("pipeline worker failed to stop");

    let stats = pipeline.stats();
    println!(
        "[DONE] delivered {} | failed {} | final aspects v{}",
        stats.delivered,
        stats.failed,
        pipeline.color_aspects().version
    );
}
