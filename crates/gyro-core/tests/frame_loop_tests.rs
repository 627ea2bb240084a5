// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]

mod common;

use std::io::Cursor;

use bytemuck::{Pod, Zeroable};
use common::SharedSink;
use gyro_core::{
    Constraint, EventBus, Phase, Playback, QueuePolicy, Recorder, Repository, Schedule, System,
    SystemContext, SystemId, ValueEvent,
};

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
struct Position {
    x: i64,
    y: i64,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
struct Velocity {
    x: i64,
    y: i64,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
struct Collision {
    entity_index: u32,
    _pad: u32,
}

impl ValueEvent for Collision {
    const EVENT_TYPE_ID: u16 = 21;
}

/// Integrates velocity into position and reports x > 3 as a collision.
struct Movement;

impl System for Movement {
    fn run(&mut self, ctx: &mut SystemContext<'_>) {
        let query = ctx
            .repo
            .query()
            .with::<Position>()
            .expect("with position")
            .with::<Velocity>()
            .expect("with velocity")
            .build();
        let moved: Vec<_> = ctx.repo.iter(&query).collect();
        for e in moved {
            let v = *ctx.repo.get::<Velocity>(e).expect("velocity");
            let p = ctx.repo.get_mut::<Position>(e).expect("position");
            p.x += v.x;
            p.y += v.y;
            if p.x > 3 {
                ctx.bus.publish(&Collision {
                    entity_index: e.index(),
                    _pad: 0,
                });
            }
        }
    }
}

/// Destroys, via the command buffer, everything reported last frame.
struct Cleanup;

impl System for Cleanup {
    fn run(&mut self, ctx: &mut SystemContext<'_>) {
        let doomed: Vec<u32> = ctx.bus.collect::<Collision>().iter().map(|c| c.entity_index).collect();
        let query = ctx.repo.query().with::<Position>().expect("with").build();
        let handles: Vec<_> = ctx.repo.iter(&query).collect();
        for e in handles {
            if doomed.contains(&e.index()) {
                ctx.commands.destroy(e);
            }
        }
    }
}

#[test]
fn a_full_frame_loop_moves_collides_and_cleans_up() {
    let mut repo = Repository::new().expect("repo");
    repo.register_component::<Position>().expect("position");
    repo.register_component::<Velocity>().expect("velocity");
    let mut bus = EventBus::new();

    let e = repo.create().expect("entity");
    repo.add(e, Position { x: 0, y: 0 }).expect("p");
    repo.add(e, Velocity { x: 1, y: 0 }).expect("v");

    let mut schedule = Schedule::new();
    schedule
        .add_system(Phase::Simulation, Movement, &[])
        .expect("movement");
    schedule
        .add_system(
            Phase::Simulation,
            Cleanup,
            &[Constraint::Before(SystemId::of::<Movement>())],
        )
        .expect("cleanup");

    // Position crosses 3 on frame 4; the collision is visible to Cleanup
    // on frame 5; the barrier destroys the entity at the end of frame 5.
    for frame in 1..=5 {
        schedule.run_frame(&mut repo, &mut bus).expect("frame");
        let alive = repo.is_alive(e);
        match frame {
            1..=4 => assert!(alive, "frame {frame}: entity should survive"),
            _ => assert!(!alive, "frame {frame}: entity should be destroyed"),
        }
    }
}

#[test]
fn frames_recorded_inside_the_loop_replay_identically() {
    let sink = SharedSink::new();
    let mut recorder = Recorder::create(sink.clone(), QueuePolicy::Block, 8);

    let mut repo = Repository::new().expect("repo");
    repo.register_component::<Position>().expect("position");
    repo.register_component::<Velocity>().expect("velocity");
    let mut bus = EventBus::new();

    let e = repo.create().expect("entity");
    repo.add(e, Position { x: 0, y: 0 }).expect("p");
    repo.add(e, Velocity { x: 2, y: 1 }).expect("v");

    let mut schedule = Schedule::new();
    schedule
        .add_system(Phase::Simulation, Movement, &[])
        .expect("movement");

    let mut previous_tick = 0;
    let mut expected = Vec::new();
    for frame in 0..6 {
        schedule.run_frame(&mut repo, &mut bus).expect("frame");
        let stats = if frame == 0 {
            recorder.capture_keyframe(&repo, &bus).expect("keyframe")
        } else {
            recorder
                .capture_frame(&repo, &bus, previous_tick)
                .expect("delta")
        };
        previous_tick = stats.tick;
        expected.push(*repo.get::<Position>(e).expect("position"));
    }
    recorder.finish().expect("finish");

    let mut target = Repository::new().expect("target");
    target.register_component::<Position>().expect("position");
    target.register_component::<Velocity>().expect("velocity");
    let mut target_bus = EventBus::new();

    let mut playback = Playback::open(Cursor::new(sink.bytes())).expect("open");
    for expected_position in expected {
        assert!(playback.step_forward(&mut target, &mut target_bus).expect("step"));
        assert_eq!(*target.get::<Position>(e).expect("position"), expected_position);
    }
}
