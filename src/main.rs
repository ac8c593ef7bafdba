use std::sync::Arc;

use anyhow::Result;
use nalgebra::Vector3;
use tracing_subscriber::filter::LevelFilter;

use uar_tracking::config::{EngineLogLevel, UarSettings};
use uar_tracking::engine::sim::{SimAnchor, SimEngine};
use uar_tracking::engine::Modality;
use uar_tracking::geometry::Pose;
use uar_tracking::session::{CameraRig, SessionContext};
use uar_tracking::targets::{FaceTrackingGroup, InstantTarget};
use uar_tracking::trainer::{self, TrainParams};

/// Demo session over the simulated engine: two concurrent faces that
/// come and go, plus an instant-placement anchor, driven through a
/// scripted camera walk.
fn main() -> Result<()> {
    let settings = UarSettings::default();
    init_logging(settings.log_level);

    let engine = Arc::new(SimEngine::new());
    let ctx = SessionContext::new(engine.clone());

    let face_ids: Vec<u32> = (0..settings.concurrent_face_trackers() as u32).collect();
    let faces = FaceTrackingGroup::new(ctx.clone(), &face_ids);
    {
        let mut group = faces.lock();
        for &id in &face_ids {
            if let Some(anchor) = group.anchor_mut(id) {
                anchor.on_seen(move || println!("face {id} seen"));
                anchor.on_not_seen(move || println!("face {id} lost"));
            }
        }
    }

    let instant = InstantTarget::new(ctx.clone());
    instant
        .lock()
        .set_anchor_offset_from_camera(Vector3::new(0.0, -1.0, -5.0));

    let mut rig = CameraRig::user_facing(ctx.clone());
    rig.start();

    for frame in 0..120u32 {
        rig.set_pose(Pose::from_translation(Vector3::new(
            0.0,
            0.0,
            0.01 * frame as f32,
        )));

        // Script which faces the engine sees this frame.
        if let Some(tracker) = ctx.session.lock().tracker(Modality::Face) {
            let mut anchors = Vec::new();
            if (20..80).contains(&frame) {
                anchors.push(SimAnchor::identified(
                    "0",
                    Pose::from_translation(Vector3::new(-0.2, 0.0, -1.5)),
                ));
            }
            if frame >= 50 {
                anchors.push(SimAnchor::identified(
                    "1",
                    Pose::from_translation(Vector3::new(0.3, 0.1, -2.0)),
                ));
            }
            engine.set_anchors(tracker, anchors);
        }

        faces.lock().update();
        instant.lock().update();

        if frame == 60 {
            instant.lock().place();
            println!("instant anchor placed at frame {frame}");
        }
    }

    {
        let group = faces.lock();
        for anchor in group.anchors() {
            let t = anchor.transform();
            println!(
                "face {}: visible={} position=({:.2}, {:.2}, {:.2})",
                anchor.identity(),
                anchor.is_visible(),
                t.position.x,
                t.position.y,
                t.position.z,
            );
        }
    }
    let placed = instant.lock().transform();
    println!(
        "instant anchor: position=({:.2}, {:.2}, {:.2})",
        placed.position.x, placed.position.y, placed.position.z,
    );

    if let Some(frame) = rig.background_frame(1280, 720) {
        println!(
            "background frame: texture={} projection[0,0]={:.3}",
            frame.texture.is_some(),
            frame.projection[(0, 0)],
        );
    }

    let trained = trainer::train(
        engine.as_ref(),
        b"demo poster image",
        false,
        &TrainParams::default(),
    )?;
    println!(
        "trained image target: {} descriptor bytes, preview={}",
        trained.target.len(),
        trained.preview.is_some(),
    );

    faces.lock().dispose();
    instant.lock().dispose();
    Ok(())
}

fn init_logging(level: EngineLogLevel) {
    let filter = match level {
        EngineLogLevel::Error => LevelFilter::ERROR,
        EngineLogLevel::Warning => LevelFilter::WARN,
        EngineLogLevel::Info => LevelFilter::INFO,
        EngineLogLevel::Debug => LevelFilter::DEBUG,
    };
    tracing_subscriber::fmt().with_max_level(filter).init();
}
