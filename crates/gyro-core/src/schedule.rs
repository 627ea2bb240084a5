// SPDX-License-Identifier: Apache-2.0

//! Phase-ordered system scheduler.
//!
//! Ordering invariant:
//! - Phases execute in fixed global order every frame.
//! - Within a phase, systems execute in a depth-first topological order of
//!   the before/after constraint graph; a cycle fails resolution with the
//!   offending system's name.
//! - Each phase ends with its barrier, which plays back that phase's
//!   command buffers in execution order.
//!
//! The sort is an explicit DFS with a recursion stack. A comparator-based
//! sort is ill-defined on cyclic constraint sets and must not be used here.

use std::panic::{catch_unwind, AssertUnwindSafe};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::error;

use crate::command::CommandBuffer;
use crate::event::EventBus;
use crate::repo::{RepoError, Repository};

/// The five fixed per-frame stages, in execution order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Phase {
    /// Frame setup.
    Initialization,
    /// Ingest remote state.
    NetworkReceive,
    /// Domain simulation.
    Simulation,
    /// Emit local state.
    NetworkSend,
    /// Everything observational.
    Presentation,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Self; 5] = [
        Self::Initialization,
        Self::NetworkReceive,
        Self::Simulation,
        Self::NetworkSend,
        Self::Presentation,
    ];

    fn index(self) -> usize {
        match self {
            Self::Initialization => 0,
            Self::NetworkReceive => 1,
            Self::Simulation => 2,
            Self::NetworkSend => 3,
            Self::Presentation => 4,
        }
    }
}

/// Stable identity of a system: its Rust type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SystemId {
    type_id: std::any::TypeId,
    name: &'static str,
}

impl SystemId {
    /// Identity of system type `S`.
    #[must_use]
    pub fn of<S: System>() -> Self {
        Self {
            type_id: std::any::TypeId::of::<S>(),
            name: std::any::type_name::<S>(),
        }
    }

    /// The system's fully-qualified type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An ordering constraint relative to another system in the same phase.
///
/// Constraints naming systems that are not registered in the phase are
/// ignored, so optional systems do not break their neighbours' ordering.
#[derive(Clone, Copy, Debug)]
pub enum Constraint {
    /// This system runs before the named one.
    Before(SystemId),
    /// This system runs after the named one.
    After(SystemId),
}

/// What systems receive each time they run.
pub struct SystemContext<'a> {
    /// Exclusive repository access for the duration of the call.
    pub repo: &'a mut Repository,
    /// The event bus; publishing is `&self` and thread-safe.
    pub bus: &'a EventBus,
    /// This system's own command buffer, flushed at the phase barrier.
    pub commands: &'a mut CommandBuffer,
}

/// A named unit of per-frame work.
pub trait System: 'static {
    /// Runs the system for one frame.
    fn run(&mut self, ctx: &mut SystemContext<'_>);
}

/// Errors surfaced while building or running a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The constraint graph of a phase contains a cycle.
    #[error("circular dependency involving system {system}")]
    CircularDependency {
        /// A system on the detected cycle.
        system: &'static str,
    },

    /// The same system type was registered twice.
    #[error("system {system} is already registered")]
    DuplicateSystem {
        /// Name of the offending system.
        system: &'static str,
    },

    /// A phase barrier failed to play back a command buffer.
    #[error("barrier playback failed after system {system}")]
    BarrierFailed {
        /// The system whose buffer failed.
        system: &'static str,
        /// The underlying repository error.
        #[source]
        source: RepoError,
    },
}

struct SystemEntry {
    id: SystemId,
    system: Box<dyn System>,
    before: Vec<SystemId>,
    after: Vec<SystemId>,
    commands: CommandBuffer,
}

#[derive(Default)]
struct PhaseLane {
    systems: Vec<SystemEntry>,
    order: Vec<usize>,
    dirty: bool,
}

/// The frame scheduler: five phase lanes and their barriers.
#[derive(Default)]
pub struct Schedule {
    lanes: [PhaseLane; 5],
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Schedule");
        for phase in Phase::ALL {
            dbg.field(
                "phase",
                &(phase, self.lanes[phase.index()].systems.len()),
            );
        }
        dbg.finish()
    }
}

impl Schedule {
    /// Creates an empty schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `system` in `phase` with its ordering constraints.
    pub fn add_system<S: System>(
        &mut self,
        phase: Phase,
        system: S,
        constraints: &[Constraint],
    ) -> Result<(), ScheduleError> {
        let id = SystemId::of::<S>();
        if self
            .lanes
            .iter()
            .any(|lane| lane.systems.iter().any(|entry| entry.id == id))
        {
            return Err(ScheduleError::DuplicateSystem { system: id.name });
        }

        let mut before = Vec::new();
        let mut after = Vec::new();
        for constraint in constraints {
            match constraint {
                Constraint::Before(target) => before.push(*target),
                Constraint::After(target) => after.push(*target),
            }
        }

        let lane = &mut self.lanes[phase.index()];
        lane.systems.push(SystemEntry {
            id,
            system: Box::new(system),
            before,
            after,
            commands: CommandBuffer::new(),
        });
        lane.dirty = true;
        Ok(())
    }

    /// Resolves every phase's execution order, failing on cycles.
    ///
    /// Called implicitly by [`Self::run_frame`]; call it directly to
    /// surface [`ScheduleError::CircularDependency`] at build time.
    pub fn resolve(&mut self) -> Result<(), ScheduleError> {
        for lane in &mut self.lanes {
            if lane.dirty {
                lane.order = sort_lane(&lane.systems)?;
                lane.dirty = false;
            }
        }
        Ok(())
    }

    /// Runs one frame: tick, then every phase in order, each ending with
    /// its barrier, then the event-buffer swap.
    ///
    /// A panicking system is contained: the panic is logged and the frame
    /// continues with the next system. Structural invariants it violated
    /// surface on later operations.
    pub fn run_frame(
        &mut self,
        repo: &mut Repository,
        bus: &mut EventBus,
    ) -> Result<(), ScheduleError> {
        self.resolve()?;
        repo.tick();

        for phase in Phase::ALL {
            let lane = &mut self.lanes[phase.index()];
            for ix in &lane.order {
                let entry = &mut lane.systems[*ix];
                let SystemEntry {
                    id,
                    system,
                    commands,
                    ..
                } = entry;
                let mut ctx = SystemContext {
                    repo: &mut *repo,
                    bus: &*bus,
                    commands,
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| system.run(&mut ctx)));
                if outcome.is_err() {
                    error!(system = id.name, ?phase, "system panicked; continuing frame");
                }
            }

            // Barrier: flush this phase's command buffers in execution order.
            for ix in &lane.order {
                let entry = &mut lane.systems[*ix];
                entry
                    .commands
                    .play_back(repo)
                    .map_err(|source| ScheduleError::BarrierFailed {
                        system: entry.id.name,
                        source,
                    })?;
            }
        }

        bus.swap_buffers();
        Ok(())
    }
}

/// DFS topological sort with an explicit recursion stack for cycle
/// detection. Returns indices into `systems` in execution order.
fn sort_lane(systems: &[SystemEntry]) -> Result<Vec<usize>, ScheduleError> {
    let by_id: FxHashMap<SystemId, usize> = systems
        .iter()
        .enumerate()
        .map(|(ix, entry)| (entry.id, ix))
        .collect();

    // Edge u → v means u executes before v.
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); systems.len()];
    for (ix, entry) in systems.iter().enumerate() {
        for target in &entry.before {
            if let Some(t_ix) = by_id.get(target) {
                edges[ix].push(*t_ix);
            }
        }
        for target in &entry.after {
            if let Some(t_ix) = by_id.get(target) {
                edges[*t_ix].push(ix);
            }
        }
    }

    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;
    let mut state = vec![WHITE; systems.len()];
    let mut post_order = Vec::with_capacity(systems.len());

    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        state: &mut [u8],
        post_order: &mut Vec<usize>,
        systems: &[SystemEntry],
    ) -> Result<(), ScheduleError> {
        state[node] = GRAY;
        for next in &edges[node] {
            match state[*next] {
                WHITE => visit(*next, edges, state, post_order, systems)?,
                GRAY => {
                    return Err(ScheduleError::CircularDependency {
                        system: systems[*next].id.name,
                    })
                }
                _ => {}
            }
        }
        state[node] = BLACK;
        post_order.push(node);
        Ok(())
    }

    // Seed the DFS in reverse so unconstrained systems keep registration
    // order after the final reversal.
    for node in (0..systems.len()).rev() {
        if state[node] == WHITE {
            visit(node, &edges, &mut state, &mut post_order, systems)?;
        }
    }
    post_order.reverse();
    Ok(post_order)
}
