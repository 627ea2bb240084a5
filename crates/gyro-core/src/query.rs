// SPDX-License-Identifier: Apache-2.0

//! Query engine: mask filters, chunk-culling iteration, sorted and
//! parallel variants.
//!
//! Iteration culls in three tiers before any per-entity work: empty chunks
//! by population counter, unchanged chunks by change version, and
//! non-covering chunks by the conservative signature union. Only surviving
//! chunks are scanned entity by entity against the full mask filter.

use bytemuck::Pod;
use rayon::prelude::*;

use crate::constants::{CHUNK_CAPACITY, MAX_CHUNKS};
use crate::entity::{Entity, EntityHeader};
use crate::mask::Mask256;
use crate::registry::ComponentTypeId;
use crate::repo::{RepoError, Repository};

/// A compiled query: four masks plus the change filter.
#[derive(Clone, Copy, Debug, Default)]
pub struct Query {
    include: Mask256,
    exclude: Mask256,
    owned: Mask256,
    changed: Option<(ComponentTypeId, u64)>,
    require_any_owned: bool,
}

impl Query {
    fn matches_header(&self, header: &EntityHeader) -> bool {
        if !header.is_active() {
            return false;
        }
        if !header.component_mask.matches(&self.include, &self.exclude) {
            return false;
        }
        if !self.owned.is_empty() && !header.authority_mask.covers(&self.owned) {
            return false;
        }
        if self.require_any_owned && header.authority_mask.is_empty() {
            return false;
        }
        true
    }

    fn chunk_survives(&self, repo: &Repository, chunk_ix: usize) -> bool {
        if repo.entity_index().population(chunk_ix) == 0 {
            return false;
        }
        if let Some((type_id, min_version)) = self.changed {
            if repo.changed_version(type_id, chunk_ix) <= min_version {
                return false;
            }
        }
        repo.entity_index().signature(chunk_ix).covers(&self.include)
    }
}

/// Builds a [`Query`] against a repository's registrations.
///
/// Every type named by the builder must already be registered; unknown
/// types fail at build time with [`RepoError::UnknownType`].
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    repo: &'a Repository,
    query: Query,
}

impl<'a> QueryBuilder<'a> {
    /// Requires component `T` to be present.
    pub fn with<T: 'static>(mut self) -> Result<Self, RepoError> {
        let id = self.repo.lookup::<T>()?;
        self.query.include.set(id);
        Ok(self)
    }

    /// Requires component `T` to be absent.
    pub fn without<T: 'static>(mut self) -> Result<Self, RepoError> {
        let id = self.repo.lookup::<T>()?;
        self.query.exclude.set(id);
        Ok(self)
    }

    /// Requires this node to be authoritative for `T`.
    pub fn owned<T: 'static>(mut self) -> Result<Self, RepoError> {
        let id = self.repo.lookup::<T>()?;
        self.query.owned.set(id);
        Ok(self)
    }

    /// Requires any authority bit at all.
    #[must_use]
    pub fn any_owned(mut self) -> Self {
        self.query.require_any_owned = true;
        self
    }

    /// Restricts to entities whose `T` chunk changed after `min_version`.
    ///
    /// Filtering is at chunk granularity: a chunk whose change version is
    /// at or below `min_version` is skipped wholesale.
    pub fn changed_since<T: 'static>(mut self, min_version: u64) -> Result<Self, RepoError> {
        let id = self.repo.lookup::<T>()?;
        self.query.changed = Some((id, min_version));
        Ok(self)
    }

    /// Finishes the build.
    #[must_use]
    pub fn build(self) -> Query {
        self.query
    }
}

/// Iterator over matching entities in ascending index order.
#[derive(Debug)]
pub struct QueryIter<'a> {
    repo: &'a Repository,
    query: Query,
    chunk_ix: usize,
    local: usize,
    chunk_live: bool,
    last_chunk: usize,
}

impl<'a> Iterator for QueryIter<'a> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        let high_water = self.repo.entity_index().high_water() as usize;
        loop {
            if self.chunk_ix > self.last_chunk || self.chunk_ix >= MAX_CHUNKS {
                return None;
            }
            if !self.chunk_live {
                if !self.query.chunk_survives(self.repo, self.chunk_ix) {
                    self.chunk_ix += 1;
                    continue;
                }
                self.chunk_live = true;
                self.local = 0;
            }

            let base = self.chunk_ix * CHUNK_CAPACITY;
            let headers = self.repo.entity_index().header_chunk(self.chunk_ix);
            if let Some(headers) = headers {
                while self.local < CHUNK_CAPACITY {
                    let index = base + self.local;
                    if index >= high_water {
                        break;
                    }
                    let header = &headers[self.local];
                    self.local += 1;
                    if self.query.matches_header(header) {
                        #[allow(clippy::cast_possible_truncation)]
                        return Some(Entity::new(index as u32, header.generation));
                    }
                }
            }
            self.chunk_live = false;
            self.chunk_ix += 1;
        }
    }
}

/// Reusable sorter for key-ordered iteration.
///
/// The scratch buffer survives across frames, so steady-state sorted
/// iteration allocates nothing.
#[derive(Debug, Default)]
pub struct KeySorter<K> {
    scratch: Vec<(K, Entity)>,
}

impl<K: Ord + Copy> KeySorter<K> {
    /// Creates a sorter with an empty scratch buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scratch: Vec::new(),
        }
    }

    /// Iterates matches of `query` in ascending `key_fn` order.
    ///
    /// The sort is stable: entities with equal keys keep index order.
    pub fn sorted<'a>(
        &'a mut self,
        repo: &Repository,
        query: &Query,
        mut key_fn: impl FnMut(&Repository, Entity) -> K,
    ) -> impl Iterator<Item = Entity> + 'a {
        self.scratch.clear();
        for entity in repo.iter(query) {
            self.scratch.push((key_fn(repo, entity), entity));
        }
        self.scratch.sort_by_key(|(key, _)| *key);
        self.scratch.iter().map(|(_, entity)| *entity)
    }
}

impl Repository {
    /// Starts building a query against this repository.
    #[must_use]
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder {
            repo: self,
            query: Query::default(),
        }
    }

    /// Iterates entities matching `query` in ascending index order.
    #[must_use]
    pub fn iter(&self, query: &Query) -> QueryIter<'_> {
        let high_water = self.entity_index().high_water() as usize;
        let last_chunk = if high_water == 0 {
            0
        } else {
            (high_water - 1) / CHUNK_CAPACITY
        };
        QueryIter {
            repo: self,
            query: *query,
            chunk_ix: 0,
            local: 0,
            chunk_live: false,
            last_chunk,
        }
    }

    /// Runs `f` over every match of `query`, writing `W` and reading `R`,
    /// fanning matching chunks out across the rayon pool.
    ///
    /// Chunks are disjoint, so each worker owns its `W` slice exclusively;
    /// `W` and `R` must be distinct types or the call fails with
    /// [`RepoError::AliasedParallelAccess`]. Structural changes are not
    /// possible from inside `f`; route them through a command buffer.
    pub fn par_for_each<W, R, F>(&mut self, query: &Query, f: F) -> Result<(), RepoError>
    where
        W: Pod + Send + Sync + 'static,
        R: Pod + Send + Sync + 'static,
        F: Fn(&mut W, &R) + Send + Sync,
    {
        let write_id = self.lookup::<W>()?;
        let read_id = self.lookup::<R>()?;
        let high_water = self.entity_index().high_water() as usize;
        if high_water == 0 {
            return Ok(());
        }

        let selected: Vec<usize> = (0..=(high_water - 1) / CHUNK_CAPACITY)
            .filter(|chunk_ix| query.chunk_survives(self, *chunk_ix))
            .collect();
        if selected.is_empty() {
            return Ok(());
        }

        let query = *query;
        let (write_store, read_store, entities, clock) = self.inline_pair_mut(write_id, read_id)?;
        let read_table = read_store.table();
        let write_table = write_store.table_mut();

        // Narrow the selection to chunks that can actually be handed to a
        // worker, then stamp exactly those. Committed chunks outside the
        // selection are never written, so they must keep their versions.
        let written: Vec<usize> = selected
            .into_iter()
            .filter(|chunk_ix| {
                write_table.chunk_exists(*chunk_ix)
                    && read_table.chunk(*chunk_ix).is_some()
                    && entities.header_chunk(*chunk_ix).is_some()
            })
            .collect();
        for chunk_ix in &written {
            let _ = write_table.chunk_mut(*chunk_ix, clock)?;
        }

        let mut work: Vec<(usize, &mut [u8], &[u8], &[EntityHeader])> = Vec::new();
        for (chunk_ix, write_chunk) in write_table.chunks_mut() {
            if !written.contains(&chunk_ix) {
                continue;
            }
            let Some(read_chunk) = read_table.chunk(chunk_ix) else {
                continue;
            };
            let Some(headers) = entities.header_chunk(chunk_ix) else {
                continue;
            };
            work.push((chunk_ix, write_chunk, read_chunk, headers));
        }

        work.into_par_iter()
            .for_each(|(chunk_ix, write_chunk, read_chunk, headers)| {
                let writes: &mut [W] = bytemuck::cast_slice_mut(write_chunk);
                let reads: &[R] = bytemuck::cast_slice(read_chunk);
                let base = chunk_ix * CHUNK_CAPACITY;
                for local in 0..CHUNK_CAPACITY {
                    if base + local >= high_water {
                        break;
                    }
                    if query.matches_header(&headers[local]) {
                        f(&mut writes[local], &reads[local]);
                    }
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    fn seeded_repo() -> (Repository, Entity, Entity, Entity) {
        let mut repo = Repository::new().expect("repo");
        repo.register_component::<Position>().expect("position");
        repo.register_component::<Velocity>().expect("velocity");

        let e1 = repo.create().expect("e1");
        repo.add(e1, Position { x: 1.0, y: 2.0 }).expect("p1");
        repo.add(e1, Velocity { x: 10.0, y: 0.0 }).expect("v1");

        let e2 = repo.create().expect("e2");
        repo.add(e2, Position { x: 3.0, y: 4.0 }).expect("p2");

        let e3 = repo.create().expect("e3");
        repo.add(e3, Position { x: 5.0, y: 6.0 }).expect("p3");
        repo.add(e3, Velocity { x: 0.0, y: 20.0 }).expect("v3");

        (repo, e1, e2, e3)
    }

    #[test]
    fn include_filters_yield_matches_in_index_order() {
        let (repo, e1, _e2, e3) = seeded_repo();
        let query = repo
            .query()
            .with::<Position>()
            .expect("with position")
            .with::<Velocity>()
            .expect("with velocity")
            .build();
        let matched: Vec<Entity> = repo.iter(&query).collect();
        assert_eq!(matched, vec![e1, e3]);
    }

    #[test]
    fn exclude_filters_remove_matches() {
        let (repo, _e1, e2, _e3) = seeded_repo();
        let query = repo
            .query()
            .with::<Position>()
            .expect("with position")
            .without::<Velocity>()
            .expect("without velocity")
            .build();
        let matched: Vec<Entity> = repo.iter(&query).collect();
        assert_eq!(matched, vec![e2]);
    }

    #[test]
    fn destroyed_entities_never_match() {
        let (mut repo, e1, e2, e3) = seeded_repo();
        repo.destroy(e2).expect("destroy");
        let query = repo.query().with::<Position>().expect("with").build();
        let matched: Vec<Entity> = repo.iter(&query).collect();
        assert_eq!(matched, vec![e1, e3]);
    }

    #[test]
    fn changed_filter_skips_untouched_chunks() {
        let (mut repo, e1, _e2, _e3) = seeded_repo();
        repo.tick();
        let v0 = repo.clock();
        repo.tick();

        // Read-only access leaves the version alone.
        let _ = repo.get::<Position>(e1).expect("read");
        let query = repo
            .query()
            .with::<Position>()
            .expect("with")
            .changed_since::<Position>(v0)
            .expect("changed")
            .build();
        assert_eq!(repo.iter(&query).count(), 0);

        repo.get_mut::<Position>(e1).expect("write").x = 7.0;
        let matched: Vec<Entity> = repo.iter(&query).collect();
        assert!(matched.contains(&e1));
    }

    #[test]
    fn owned_filters_require_authority() {
        let (mut repo, e1, _e2, e3) = seeded_repo();
        repo.set_authority::<Velocity>(e1, true).expect("grant");

        let query = repo
            .query()
            .with::<Velocity>()
            .expect("with")
            .owned::<Velocity>()
            .expect("owned")
            .build();
        let matched: Vec<Entity> = repo.iter(&query).collect();
        assert_eq!(matched, vec![e1]);

        let any = repo.query().with::<Velocity>().expect("with").any_owned().build();
        let matched: Vec<Entity> = repo.iter(&any).collect();
        assert_eq!(matched, vec![e1]);
        let _ = e3;
    }

    #[test]
    fn sorted_iteration_orders_by_key_stably() {
        let (repo, e1, e2, e3) = seeded_repo();
        let query = repo.query().with::<Position>().expect("with").build();
        let mut sorter = KeySorter::new();
        let ordered: Vec<Entity> = sorter
            .sorted(&repo, &query, |repo, entity| {
                // Descending x becomes ascending key via negation.
                let position = repo.get::<Position>(entity).expect("position");
                -(position.x as i64)
            })
            .collect();
        assert_eq!(ordered, vec![e3, e2, e1]);
    }

    #[test]
    fn queries_against_unregistered_types_fail_to_build() {
        struct NeverRegistered;
        let (repo, ..) = seeded_repo();
        assert!(matches!(
            repo.query().with::<NeverRegistered>(),
            Err(RepoError::UnknownType { .. })
        ));
    }

    #[test]
    fn parallel_update_applies_velocity_once_per_entity() {
        let (mut repo, e1, e2, e3) = seeded_repo();
        let query = repo
            .query()
            .with::<Position>()
            .expect("with position")
            .with::<Velocity>()
            .expect("with velocity")
            .build();
        repo.par_for_each::<Position, Velocity, _>(&query, |p, v| {
            p.x += v.x;
            p.y += v.y;
        })
        .expect("parallel update");

        assert_eq!(*repo.get::<Position>(e1).expect("p1"), Position { x: 11.0, y: 2.0 });
        assert_eq!(*repo.get::<Position>(e2).expect("p2"), Position { x: 3.0, y: 4.0 });
        assert_eq!(*repo.get::<Position>(e3).expect("p3"), Position { x: 5.0, y: 26.0 });
    }

    #[test]
    fn parallel_update_rejects_aliased_components() {
        let (mut repo, ..) = seeded_repo();
        let query = repo.query().with::<Position>().expect("with").build();
        let result = repo.par_for_each::<Position, Position, _>(&query, |_, _| {});
        assert!(matches!(result, Err(RepoError::AliasedParallelAccess)));
    }
}
