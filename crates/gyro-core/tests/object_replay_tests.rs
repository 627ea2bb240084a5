// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]

mod common;

use std::io::Cursor;

use bytemuck::{Pod, Zeroable};
use common::SharedSink;
use gyro_core::{
    EventBus, ObjectEvent, Playback, PlaybackError, QueuePolicy, Recorder, Repository,
};
use serde::{Deserialize, Serialize};

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
struct Hull {
    integrity: u32,
    _pad: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    cargo: Vec<String>,
    tonnage: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Distress {
    source: String,
}

impl ObjectEvent for Distress {
    const EVENT_TYPE_ID: u16 = 40;
}

fn build_repo() -> Repository {
    let mut repo = Repository::new().expect("repo");
    repo.register_component::<Hull>().expect("hull");
    repo.register_object::<Manifest>().expect("manifest");
    repo
}

#[test]
fn object_components_replay_through_keyframes_and_deltas() {
    let sink = SharedSink::new();
    let mut recorder = Recorder::create(sink.clone(), QueuePolicy::Block, 8);

    let mut repo = build_repo();
    let bus = EventBus::new();

    let t1 = repo.tick();
    let e = repo.create().expect("entity");
    repo.add(e, Hull { integrity: 100, _pad: 0 }).expect("hull");
    repo.add_object(
        e,
        Manifest {
            cargo: vec!["ammo".to_owned(), "fuel".to_owned()],
            tonnage: 12,
        },
    )
    .expect("manifest");
    recorder.capture_keyframe(&repo, &bus).expect("keyframe");

    // Mutate the object in place; only its chunk should travel.
    repo.tick();
    repo.object_mut::<Manifest>(e).expect("manifest").tonnage = 14;
    let stats = recorder.capture_frame(&repo, &bus, t1).expect("delta");
    assert_eq!(stats.chunks, 1);

    // Remove it; the now-empty object chunk must still travel so the
    // target forgets the payload.
    let t2 = stats.tick;
    repo.tick();
    repo.remove::<Manifest>(e).expect("remove");
    recorder.capture_frame(&repo, &bus, t2).expect("removal delta");

    recorder.finish().expect("finish");

    let mut target = build_repo();
    let mut target_bus = EventBus::new();
    let mut playback = Playback::open(Cursor::new(sink.bytes())).expect("open");

    playback.step_forward(&mut target, &mut target_bus).expect("keyframe");
    assert_eq!(target.object::<Manifest>(e).expect("manifest").tonnage, 12);

    playback.step_forward(&mut target, &mut target_bus).expect("delta");
    assert_eq!(target.object::<Manifest>(e).expect("manifest").tonnage, 14);
    assert_eq!(
        target.object::<Manifest>(e).expect("manifest").cargo,
        vec!["ammo".to_owned(), "fuel".to_owned()]
    );

    playback.step_forward(&mut target, &mut target_bus).expect("removal");
    assert!(!target.has::<Manifest>(e));
}

#[test]
fn unknown_object_event_names_fail_stepping_but_not_seeking() {
    let sink = SharedSink::new();
    let mut recorder = Recorder::create(sink.clone(), QueuePolicy::Block, 8);

    let mut repo = build_repo();
    let mut bus = EventBus::new();

    let t1 = repo.tick();
    let e = repo.create().expect("entity");
    repo.add(e, Hull { integrity: 50, _pad: 0 }).expect("hull");
    recorder.capture_keyframe(&repo, &bus).expect("keyframe");

    repo.tick();
    repo.get_mut::<Hull>(e).expect("hull").integrity = 49;
    bus.publish_object(Distress {
        source: "convoy-7".to_owned(),
    });
    bus.swap_buffers();
    let stats = recorder.capture_frame(&repo, &bus, t1).expect("delta");

    repo.tick();
    repo.get_mut::<Hull>(e).expect("hull").integrity = 48;
    bus.swap_buffers();
    recorder.capture_frame(&repo, &bus, stats.tick).expect("delta 2");

    recorder.finish().expect("finish");

    // The target bus deliberately lacks the Distress decoder.
    let mut target = build_repo();
    let mut naive_bus = EventBus::new();
    let mut playback = Playback::open(Cursor::new(sink.bytes())).expect("open");

    playback.step_forward(&mut target, &mut naive_bus).expect("keyframe");
    let err = playback
        .step_forward(&mut target, &mut naive_bus)
        .expect_err("missing decoder");
    assert!(matches!(err, PlaybackError::UnknownTypeName { .. }));

    // Seeking across the same frame skips its events and succeeds, and the
    // component state still lands.
    let mut seek_target = build_repo();
    let mut seek_bus = EventBus::new();
    let mut seeking = Playback::open(Cursor::new(sink.bytes())).expect("open");
    seeking
        .seek_to_frame(&mut seek_target, &mut seek_bus, 2)
        .expect("seek");
    assert_eq!(seek_target.get::<Hull>(e).expect("hull").integrity, 48);
}
