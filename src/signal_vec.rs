//! Reactive ordered collections and their incremental projections.
//!
//! [`MutableVec`] is the source: writes queue minimal [`ArrayDiff`] entries which are flushed as
//! one batch per tick to every subscriber. The combinators in [`SignalVecExt`] consume and emit
//! those batches: [`.track`](SignalVecExt::track) adds per-element value reactivity,
//! [`.sort_by`](SignalVecExt::sort_by) maintains one total order, and
//! [`.group_by`](SignalVecExt::group_by) maintains a keyed partition, all without ever
//! recomputing the derived view from scratch.

use super::{
    graph::*,
    group::{Group, GroupIndex, GroupKey, GroupMember, MemberOrder},
    signal::{Signal, SignalExt},
    utils::*,
};
use alloc::collections::VecDeque;
use bevy_ecs::{
    change_detection::Mut, component::HookContext, prelude::*, system::SystemId, world::DeferredWorld,
};
#[cfg(feature = "tracing")]
use bevy_log::prelude::*;
use bevy_platform::{
    prelude::*,
    sync::{Arc, Mutex, atomic::AtomicUsize, atomic::Ordering as AtomicOrdering},
};
use core::{cmp::Ordering, marker::PhantomData, ops::Deref};

/// One structural change to an ordered sequence. Batches ([`Vec<ArrayDiff<T>>`]) describe the
/// minimal edit between two observed states and are applied strictly in order.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayDiff<T> {
    /// `value` was inserted at `index`, displacing subsequent elements up.
    Added {
        #[allow(missing_docs)]
        index: usize,
        #[allow(missing_docs)]
        value: T,
    },
    /// The element at `index` was removed, shifting subsequent elements down.
    Removed {
        #[allow(missing_docs)]
        index: usize,
    },
    /// The element at `old_index` now lives at `new_index`; no element was added or removed.
    Moved {
        #[allow(missing_docs)]
        old_index: usize,
        #[allow(missing_docs)]
        new_index: usize,
    },
}

impl<T> ArrayDiff<T> {
    /// Applies this entry to a plain [`Vec`], clamping out-of-range indices.
    pub fn apply_to_vec(self, target: &mut Vec<T>) {
        match self {
            ArrayDiff::Added { index, value } => {
                let index = index.min(target.len());
                target.insert(index, value);
            }
            ArrayDiff::Removed { index } => {
                if index < target.len() {
                    target.remove(index);
                }
            }
            ArrayDiff::Moved { old_index, new_index } => {
                if old_index < target.len() {
                    let value = target.remove(old_index);
                    let new_index = new_index.min(target.len());
                    target.insert(new_index, value);
                }
            }
        }
    }
}

/// Locates the insertion point for `item` in an already sorted slice with an iterative binary
/// search, in O(log n) comparisons. On an exact match the search stops immediately and returns
/// that midpoint, so ties keep discovery position and are not deduplicated. An empty slice
/// returns 0 without probing.
pub fn sorted_insert_position<T>(sorted: &[T], item: &T, mut compare: impl FnMut(&T, &T) -> Ordering) -> usize {
    let mut low = 0;
    let mut high = sorted.len();
    while low < high {
        let mid = (low + high) / 2;
        match compare(item, &sorted[mid]) {
            Ordering::Greater => low = mid + 1,
            Ordering::Less => high = mid,
            Ordering::Equal => return mid,
        }
    }
    low
}

/// Monadic registration facade for structs that encapsulate some [`System`] which is a valid
/// member of the signal graph and outputs [`ArrayDiff`] batches.
pub trait SignalVec: SSs {
    /// Output item type.
    type Item;

    /// Registers the [`System`]s associated with this [`SignalVec`] by consuming its boxed form.
    ///
    /// All concrete signal vec types must implement this method.
    fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle;

    /// Registers the [`System`]s associated with this [`SignalVec`].
    fn register_signal_vec(self, world: &mut World) -> SignalHandle
    where
        Self: Sized,
    {
        self.boxed().register_boxed_signal_vec(world)
    }

    /// Erases the type of this [`SignalVec`].
    fn boxed(self) -> Box<dyn SignalVec<Item = Self::Item> + Send + Sync>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

impl<T: 'static> SignalVec for Box<dyn SignalVec<Item = T> + Send + Sync> {
    type Item = T;

    fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle {
        (*self).register_boxed_signal_vec(world)
    }
}

/// Signal vec graph node which takes an input of [`In<()>`] and has no upstreams, see
/// [`MutableVec::signal_vec`].
#[derive(Clone)]
pub struct Source<T> {
    signal: LazySignal,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> SignalVec for Source<T> {
    type Item = T;

    fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle {
        SignalHandle::new(self.signal.register(world))
    }
}

/// Signal graph node which applies a [`System`] to every batch of its upstream, terminating the
/// vec chain, see [`.for_each`](SignalVecExt::for_each). This is a scalar [`Signal`].
#[derive(Clone)]
pub struct ForEach<Upstream, O> {
    upstream: Upstream,
    signal: LazySignal,
    _marker: PhantomData<fn() -> O>,
}

impl<Upstream, O> Signal for ForEach<Upstream, O>
where
    Upstream: SignalVec,
    O: 'static,
{
    type Item = O;

    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
        let SignalHandle(upstream) = self.upstream.register_signal_vec(world);
        let signal = self.signal.register(world);
        pipe_signal(world, upstream, signal);
        signal.into()
    }
}

/// Signal vec graph node which applies a [`System`] to each item, see
/// [`.map`](SignalVecExt::map).
#[derive(Clone)]
pub struct Map<Upstream, U> {
    upstream: Upstream,
    signal: LazySignal,
    _marker: PhantomData<fn() -> U>,
}

impl<Upstream, U> SignalVec for Map<Upstream, U>
where
    Upstream: SignalVec,
    U: 'static,
{
    type Item = U;

    fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle {
        let SignalHandle(upstream) = self.upstream.register_signal_vec(world);
        let signal = self.signal.register(world);
        pipe_signal(world, upstream, signal);
        signal.into()
    }
}

/// Signal vec graph node which tracks each element's value signal, see
/// [`.track`](SignalVecExt::track).
pub struct Track<Upstream, S> {
    signal: LazySignal,
    _marker: PhantomData<fn() -> (Upstream, S)>,
}

impl<Upstream, S> Clone for Track<Upstream, S> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Upstream, S> SignalVec for Track<Upstream, S>
where
    Upstream: SignalVec,
    S: Signal + SSs,
    S::Item: 'static,
{
    type Item = S::Item;

    fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle {
        SignalHandle::new(self.signal.register(world))
    }
}

/// Signal vec graph node which maintains one total order over its upstream, see
/// [`.sort_by`](SignalVecExt::sort_by).
#[derive(Clone)]
pub struct SortBy<Upstream> {
    upstream: Upstream,
    signal: LazySignal,
}

impl<Upstream> SignalVec for SortBy<Upstream>
where
    Upstream: SignalVec,
{
    type Item = Upstream::Item;

    fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle {
        let SignalHandle(upstream) = self.upstream.register_signal_vec(world);
        let signal = self.signal.register(world);
        pipe_signal(world, upstream, signal);
        signal.into()
    }
}

/// Signal vec graph node which maintains a keyed partition of its upstream, see
/// [`.group_by`](SignalVecExt::group_by).
#[derive(Clone)]
pub struct GroupBy<Upstream, K> {
    upstream: Upstream,
    signal: LazySignal,
    _marker: PhantomData<fn() -> K>,
}

impl<Upstream, K> SignalVec for GroupBy<Upstream, K>
where
    Upstream: SignalVec,
    Upstream::Item: 'static,
    K: 'static,
{
    type Item = Group<K, Upstream::Item>;

    fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle {
        let SignalHandle(upstream) = self.upstream.register_signal_vec(world);
        let signal = self.signal.register(world);
        pipe_signal(world, upstream, signal);
        signal.into()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "tracing")] {
        /// Signal vec graph node that debug logs its upstream's batches, see
        /// [`.debug`](SignalVecExt::debug).
        #[derive(Clone)]
        pub struct Debug<Upstream> {
            upstream: Upstream,
            signal: LazySignal,
        }

        impl<Upstream> SignalVec for Debug<Upstream>
        where
            Upstream: SignalVec,
        {
            type Item = Upstream::Item;

            fn register_boxed_signal_vec(self: Box<Self>, world: &mut World) -> SignalHandle {
                let SignalHandle(upstream) = self.upstream.register_signal_vec(world);
                let signal = self.signal.register(world);
                pipe_signal(world, upstream, signal);
                signal.into()
            }
        }
    }
}

/// Auxiliary [`System`]s owned by a node, despawned with it.
#[derive(Component)]
#[component(on_remove = despawn_attached_systems)]
struct AttachedSystems(Vec<Entity>);

fn despawn_attached_systems(mut world: DeferredWorld, HookContext { entity, .. }: HookContext) {
    if let Some(systems) = world.get::<AttachedSystems>(entity).map(|attached| attached.0.clone()) {
        let mut commands = world.commands();
        for system in systems {
            commands.queue(move |world: &mut World| {
                if let Ok(entity) = world.get_entity_mut(system) {
                    entity.despawn();
                }
            });
        }
    }
}

/// Diff batches staged for one subscriber or queued on a [`Track`] node, drained by that node's
/// source system.
#[derive(Component)]
pub(crate) struct QueuedDiffs<T: SSs>(pub(crate) Vec<ArrayDiff<T>>);

/// The source position a tracked element currently occupies, kept on its processor entity and
/// shifted by every structural entry that passes through the [`Track`] node.
#[derive(Component)]
struct SourceIndex(usize);

/// The last value a tracked element's signal emitted; only a genuinely different emission
/// synthesizes a diff.
#[derive(Component)]
struct LastValue<V: SSs>(V);

/// Per-element processors and the factory [`System`] owned by a [`Track`] node, torn down with it.
#[derive(Component)]
#[component(on_remove = cleanup_track_state)]
struct TrackState {
    processors: Vec<Entity>,
    factory: Entity,
}

fn cleanup_track_state(mut world: DeferredWorld, HookContext { entity, .. }: HookContext) {
    if let Some(state) = world.get::<TrackState>(entity) {
        let mut entities = state.processors.clone();
        entities.push(state.factory);
        let mut commands = world.commands();
        for entity in entities {
            commands.queue(move |world: &mut World| {
                if let Ok(entity) = world.get_entity_mut(entity) {
                    entity.despawn();
                }
            });
        }
    }
}

struct SortItem<T> {
    original_index: usize,
    output_index: usize,
    value: T,
}

struct SortState<T> {
    items: Vec<SortItem<T>>,
    output: Vec<T>,
}

impl<T> Default for SortState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            output: Vec::new(),
        }
    }
}

fn process_sort_batch<T>(
    world: &mut World,
    state: &mut SortState<T>,
    comparator: SystemId<In<(T, T)>, Ordering>,
    diffs: Vec<ArrayDiff<T>>,
) -> Option<Vec<ArrayDiff<T>>>
where
    T: Clone + PartialEq + SSs,
{
    let mut out = Vec::new();
    let mut inserts = 0usize;
    let mut deletes = 0usize;
    let mut last_insert: Option<(usize, T)> = None;
    let mut last_delete: Option<(usize, T)> = None;

    for diff in diffs {
        match diff {
            ArrayDiff::Added { index, value } => {
                for item in &mut state.items {
                    if item.original_index >= index {
                        item.original_index += 1;
                    }
                }
                let position = sorted_insert_position(&state.output, &value, |a, b| {
                    world
                        .run_system_with(comparator, (a.clone(), b.clone()))
                        .unwrap_or(Ordering::Equal)
                });
                for item in &mut state.items {
                    if item.output_index >= position {
                        item.output_index += 1;
                    }
                }
                state.output.insert(position, value.clone());
                state.items.push(SortItem {
                    original_index: index,
                    output_index: position,
                    value: value.clone(),
                });
                out.push(ArrayDiff::Added { index: position, value: value.clone() });
                inserts += 1;
                last_insert = Some((position, value));
            }
            ArrayDiff::Removed { index } => {
                let Some(position) = state.items.iter().position(|item| item.original_index == index) else {
                    #[cfg(feature = "tracing")]
                    warn!("removal targets source index {} with no live element", index);
                    continue;
                };
                let removed = state.items.remove(position);
                state.output.remove(removed.output_index);
                out.push(ArrayDiff::Removed { index: removed.output_index });
                for item in &mut state.items {
                    if item.output_index > removed.output_index {
                        item.output_index -= 1;
                    }
                    if item.original_index > index {
                        item.original_index -= 1;
                    }
                }
                deletes += 1;
                last_delete = Some((removed.output_index, removed.value));
            }
            ArrayDiff::Moved { old_index, new_index } => {
                // source reordering is irrelevant once elements are independently re-sorted, but
                // the source bookkeeping must stay correct for later index-addressed entries
                if old_index != new_index {
                    for item in &mut state.items {
                        let i = item.original_index;
                        item.original_index = if i == old_index {
                            new_index
                        } else if old_index < new_index && i > old_index && i <= new_index {
                            i - 1
                        } else if new_index < old_index && i >= new_index && i < old_index {
                            i + 1
                        } else {
                            i
                        };
                    }
                }
            }
        }
    }

    if inserts == 0 && deletes == 0 {
        return None;
    }
    if inserts == 1
        && deletes == 1
        && let (Some((insert_position, inserted)), Some((delete_position, deleted))) = (&last_insert, &last_delete)
        && insert_position == delete_position
        && inserted == deleted
    {
        return None;
    }
    Some(out)
}

struct GroupItem<K, T> {
    original_index: usize,
    output_index: usize,
    group: K,
    value: T,
}

struct GroupState<K, T> {
    items: Vec<GroupItem<K, T>>,
    index: GroupIndex<K, T>,
}

impl<K, T> Default for GroupState<K, T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: GroupIndex::default(),
        }
    }
}

#[allow(clippy::type_complexity)]
fn process_group_batch<K, T>(
    world: &mut World,
    state: &mut GroupState<K, T>,
    key_system: SystemId<In<T>, K>,
    order: MemberOrder<T>,
    diffs: Vec<ArrayDiff<T>>,
) -> Option<Vec<ArrayDiff<Group<K, T>>>>
where
    K: GroupKey,
    T: Clone + PartialEq + SSs,
{
    let mut out = Vec::new();
    let mut inserts = 0usize;
    let mut deletes = 0usize;
    let mut last_insert: Option<(K, usize, T, bool)> = None;
    let mut last_delete: Option<(K, usize, T, bool)> = None;

    let mut queue: VecDeque<ArrayDiff<T>> = diffs.into();
    while let Some(diff) = queue.pop_front() {
        match diff {
            ArrayDiff::Added { index, value } => {
                let Ok(key) = world.run_system_with(key_system, value.clone()) else {
                    #[cfg(feature = "tracing")]
                    warn!("group key system failed for insertion at source index {}", index);
                    continue;
                };
                for item in &mut state.items {
                    if item.original_index >= index {
                        item.original_index += 1;
                    }
                }
                state.index.shift_source_indices(index, 1);
                let put = state.index.put(
                    world,
                    key.clone(),
                    GroupMember {
                        source_index: index,
                        value: value.clone(),
                    },
                    order,
                );
                for item in &mut state.items {
                    if item.group == key && item.output_index >= put.member_position {
                        item.output_index += 1;
                    }
                }
                state.items.push(GroupItem {
                    original_index: index,
                    output_index: put.member_position,
                    group: key.clone(),
                    value: value.clone(),
                });
                let snapshot = state.index.snapshot(put.group_position);
                if !put.created {
                    out.push(ArrayDiff::Removed { index: put.group_position });
                }
                out.push(ArrayDiff::Added {
                    index: put.group_position,
                    value: snapshot,
                });
                inserts += 1;
                last_insert = Some((key, put.member_position, value, put.created));
            }
            ArrayDiff::Removed { index } => {
                let Some(position) = state.items.iter().position(|item| item.original_index == index) else {
                    #[cfg(feature = "tracing")]
                    warn!("removal targets source index {} with no live element", index);
                    continue;
                };
                let removed = state.items.remove(position);
                let Some(removal) = state.index.remove(&removed.group, removed.output_index) else {
                    continue;
                };
                out.push(ArrayDiff::Removed { index: removal.group_position });
                if !removal.group_removed {
                    out.push(ArrayDiff::Added {
                        index: removal.group_position,
                        value: state.index.snapshot(removal.group_position),
                    });
                }
                for item in &mut state.items {
                    if item.group == removed.group && item.output_index > removed.output_index {
                        item.output_index -= 1;
                    }
                    if item.original_index > index {
                        item.original_index -= 1;
                    }
                }
                state.index.shift_source_indices(index + 1, -1);
                deletes += 1;
                last_delete = Some((removed.group, removed.output_index, removed.value, removal.group_removed));
            }
            ArrayDiff::Moved { old_index, new_index } => {
                // reprocessed through the same remove + insert path that structural changes take
                let Some(item) = state.items.iter().find(|item| item.original_index == old_index) else {
                    #[cfg(feature = "tracing")]
                    warn!("move targets source index {} with no live element", old_index);
                    continue;
                };
                let value = item.value.clone();
                queue.push_front(ArrayDiff::Added { index: new_index, value });
                queue.push_front(ArrayDiff::Removed { index: old_index });
            }
        }
    }

    if inserts == 0 && deletes == 0 {
        return None;
    }
    // only a batch that leaves one surviving group untouched may be swallowed; a delete that
    // empties the group followed by an insert that re-creates it changes the all-groups order
    if inserts == 1
        && deletes == 1
        && let (
            Some((insert_group, insert_position, inserted, created)),
            Some((delete_group, delete_position, deleted, group_removed)),
        ) = (&last_insert, &last_delete)
        && !*created
        && !*group_removed
        && insert_group == delete_group
        && insert_position == delete_position
        && inserted == deleted
    {
        return None;
    }
    Some(out)
}

/// Extension trait providing combinator methods for [`SignalVec`]s.
pub trait SignalVecExt: SignalVec {
    /// Pass every batch of this [`SignalVec`] to a [`System`], terminating the vec chain with a
    /// scalar [`Signal`]; propagation continues if the [`System`] returns [`Some`].
    fn for_each<O, IOO, F, M>(self, system: F) -> ForEach<Self, O>
    where
        Self: Sized,
        Self::Item: SSs,
        O: Clone + 'static,
        IOO: Into<Option<O>> + 'static,
        F: IntoSystem<In<Vec<ArrayDiff<Self::Item>>>, IOO, M> + SSs,
    {
        ForEach {
            upstream: self,
            signal: lazy_signal_from_system(system),
            _marker: PhantomData,
        }
    }

    /// Pass each item of this [`SignalVec`] to a [`System`], preserving index bookkeeping.
    fn map<U, F, M>(self, system: F) -> Map<Self, U>
    where
        Self: Sized,
        Self::Item: Clone + SSs,
        U: Clone + SSs,
        F: IntoSystem<In<Self::Item>, U, M> + SSs,
    {
        Map {
            upstream: self,
            signal: LazySignal::new(move |world: &mut World| {
                let transform = world.register_system(system);
                let signal = register_signal::<Vec<ArrayDiff<Self::Item>>, Vec<ArrayDiff<U>>, _, _, _>(
                    world,
                    move |In(diffs): In<Vec<ArrayDiff<Self::Item>>>, world: &mut World| {
                        let mut out = Vec::with_capacity(diffs.len());
                        for diff in diffs {
                            let mapped = match diff {
                                ArrayDiff::Added { index, value } => {
                                    let Ok(value) = world.run_system_with(transform, value) else {
                                        continue;
                                    };
                                    ArrayDiff::Added { index, value }
                                }
                                ArrayDiff::Removed { index } => ArrayDiff::Removed { index },
                                ArrayDiff::Moved { old_index, new_index } => ArrayDiff::Moved { old_index, new_index },
                            };
                            out.push(mapped);
                        }
                        Some(out)
                    },
                );
                world.entity_mut(*signal).insert(AttachedSystems(vec![transform.entity()]));
                signal
            }),
            _marker: PhantomData,
        }
    }

    /// Pass each item of this [`SignalVec`] to an [`FnMut`].
    ///
    /// Convenient when additional [`SystemParam`](bevy_ecs::system::SystemParam)s aren't necessary.
    fn map_in<U, F>(self, mut function: F) -> Map<Self, U>
    where
        Self: Sized,
        Self::Item: Clone + SSs,
        U: Clone + SSs,
        F: FnMut(Self::Item) -> U + SSs,
    {
        self.map(move |In(item)| function(item))
    }

    /// Wrap each element in a per-element value tracker: `factory` is run with the element to
    /// produce its value [`Signal`], and this node emits the unwrapped values with the same
    /// indices as the source. When an element's signal emits a genuinely different value, the
    /// tracker synthesizes a removal plus re-insertion at the element's current source position
    /// and feeds it through the node's output immediately, so "value changed" and
    /// "removed/inserted" flow through one reconciliation path downstream.
    fn track<S, F, M>(self, factory: F) -> Track<Self, S>
    where
        Self: Sized,
        Self::Item: Clone + SSs,
        S: Signal + SSs,
        S::Item: Clone + PartialEq + SSs,
        F: IntoSystem<In<Self::Item>, S, M> + SSs,
    {
        let upstream = self;
        Track {
            signal: LazySignal::new(move |world: &mut World| {
                let SignalHandle(upstream) = upstream.register_signal_vec(world);
                let factory = world.register_system(factory);
                let node = LazyEntity::new();
                let output = register_signal::<(), Vec<ArrayDiff<S::Item>>, _, _, _>(
                    world,
                    clone!((node) move |_: In<()>, mut queues: Query<&mut QueuedDiffs<S::Item>>| {
                        let mut queue = queues.get_mut(node.get()).ok()?;
                        if queue.0.is_empty() {
                            None
                        } else {
                            Some(core::mem::take(&mut queue.0))
                        }
                    }),
                );
                node.set(*output);
                let node_entity = *output;
                let processing = register_signal::<Vec<ArrayDiff<Self::Item>>, (), _, _, _>(
                    world,
                    clone!((node) move |In(diffs): In<Vec<ArrayDiff<Self::Item>>>, world: &mut World| -> Option<()> {
                        let node_entity = node.get();
                        let mut out: Vec<ArrayDiff<S::Item>> = Vec::new();
                        for diff in diffs {
                            match diff {
                                ArrayDiff::Added { index, value } => {
                                    let processor = world.spawn(SourceIndex(index)).id();
                                    let Ok(element_signal) = world.run_system_with(factory, value) else {
                                        #[cfg(feature = "tracing")]
                                        warn!("tracker factory failed for insertion at source index {}", index);
                                        if let Ok(entity) = world.get_entity_mut(processor) {
                                            entity.despawn();
                                        }
                                        continue;
                                    };
                                    let observer = clone!((node) move |In(value): In<S::Item>, world: &mut World| {
                                        let Ok(mut processor_entity) = world.get_entity_mut(processor) else {
                                            return;
                                        };
                                        let Some(mut last) = processor_entity.get_mut::<LastValue<S::Item>>() else {
                                            processor_entity.insert(LastValue(value));
                                            return;
                                        };
                                        if last.0 == value {
                                            return;
                                        }
                                        last.0 = value.clone();
                                        let Some(index) =
                                            processor_entity.get::<SourceIndex>().map(|source_index| source_index.0)
                                        else {
                                            return;
                                        };
                                        // a value change is a removal plus re-insertion at the
                                        // element's current source position
                                        if let Some(mut queue) = world.get_mut::<QueuedDiffs<S::Item>>(node.get()) {
                                            queue.0.push(ArrayDiff::Removed { index });
                                            queue.0.push(ArrayDiff::Added { index, value });
                                        }
                                        process_signals(world, [output], Box::new(()));
                                    });
                                    let handle = element_signal.map(observer).register(world);
                                    world
                                        .entity_mut(processor)
                                        .insert(SignalHandles::from(vec![handle.clone()]));
                                    // pull the current value through the freshly registered chain
                                    poll_signal(world, *handle);
                                    let Some(initial) =
                                        world.get::<LastValue<S::Item>>(processor).map(|last| last.0.clone())
                                    else {
                                        #[cfg(feature = "tracing")]
                                        warn!("tracked element at source index {} produced no initial value", index);
                                        if let Ok(entity) = world.get_entity_mut(processor) {
                                            entity.despawn();
                                        }
                                        continue;
                                    };
                                    let to_shift = {
                                        let Some(mut state) = world.get_mut::<TrackState>(node_entity) else {
                                            continue;
                                        };
                                        let insert_at = index.min(state.processors.len());
                                        state.processors.insert(insert_at, processor);
                                        state.processors[insert_at + 1..].to_vec()
                                    };
                                    for entity in to_shift {
                                        if let Some(mut source_index) = world.get_mut::<SourceIndex>(entity) {
                                            source_index.0 += 1;
                                        }
                                    }
                                    out.push(ArrayDiff::Added { index, value: initial });
                                }
                                ArrayDiff::Removed { index } => {
                                    let (processor, to_shift) = {
                                        let Some(mut state) = world.get_mut::<TrackState>(node_entity) else {
                                            continue;
                                        };
                                        if index >= state.processors.len() {
                                            #[cfg(feature = "tracing")]
                                            warn!("removal targets source index {} with no live element", index);
                                            continue;
                                        }
                                        let processor = state.processors.remove(index);
                                        (processor, state.processors[index..].to_vec())
                                    };
                                    for entity in to_shift {
                                        if let Some(mut source_index) = world.get_mut::<SourceIndex>(entity) {
                                            source_index.0 -= 1;
                                        }
                                    }
                                    if let Ok(entity) = world.get_entity_mut(processor) {
                                        entity.despawn();
                                    }
                                    out.push(ArrayDiff::Removed { index });
                                }
                                ArrayDiff::Moved { old_index, new_index } => {
                                    let processors = {
                                        let Some(mut state) = world.get_mut::<TrackState>(node_entity) else {
                                            continue;
                                        };
                                        if old_index >= state.processors.len() || new_index >= state.processors.len() {
                                            #[cfg(feature = "tracing")]
                                            warn!("move targets source index {} with no live element", old_index);
                                            continue;
                                        }
                                        let processor = state.processors.remove(old_index);
                                        state.processors.insert(new_index, processor);
                                        state.processors.clone()
                                    };
                                    for (position, entity) in processors.into_iter().enumerate() {
                                        if let Some(mut source_index) = world.get_mut::<SourceIndex>(entity) {
                                            source_index.0 = position;
                                        }
                                    }
                                    out.push(ArrayDiff::Moved { old_index, new_index });
                                }
                            }
                        }
                        if !out.is_empty() {
                            if let Some(mut queue) = world.get_mut::<QueuedDiffs<S::Item>>(node_entity) {
                                queue.0.append(&mut out);
                            }
                            process_signals(world, [output], Box::new(()));
                        }
                        None
                    }),
                );
                pipe_signal(world, upstream, processing);
                world.entity_mut(node_entity).insert((
                    QueuedDiffs::<S::Item>(Vec::new()),
                    TrackState {
                        processors: Vec::new(),
                        factory: factory.entity(),
                    },
                    SignalHandles::from(vec![SignalHandle::new(processing)]),
                ));
                output
            }),
            _marker: PhantomData,
        }
    }

    /// Maintain one total order over this [`SignalVec`] with a three-way comparator [`System`],
    /// emitting output-position diffs as the source mutates. Ties keep discovery position. A
    /// batch whose net effect leaves every element in the same output position with an equal
    /// value emits nothing.
    fn sort_by<F, M>(self, compare: F) -> SortBy<Self>
    where
        Self: Sized,
        Self::Item: Clone + PartialEq + SSs,
        F: IntoSystem<In<(Self::Item, Self::Item)>, Ordering, M> + SSs,
    {
        SortBy {
            upstream: self,
            signal: LazySignal::new(move |world: &mut World| {
                let comparator = world.register_system(compare);
                let signal = register_signal::<Vec<ArrayDiff<Self::Item>>, Vec<ArrayDiff<Self::Item>>, _, _, _>(
                    world,
                    move |In(diffs): In<Vec<ArrayDiff<Self::Item>>>,
                          world: &mut World,
                          mut state: Local<SortState<Self::Item>>| {
                        process_sort_batch(world, &mut state, comparator, diffs)
                    },
                );
                world.entity_mut(*signal).insert(AttachedSystems(vec![comparator.entity()]));
                signal
            }),
        }
    }

    /// [`.sort_by`](SignalVecExt::sort_by) with the natural [`Ord`] order.
    fn sort(self) -> SortBy<Self>
    where
        Self: Sized,
        Self::Item: Clone + Ord + SSs,
    {
        self.sort_by(|In((a, b)): In<(Self::Item, Self::Item)>| a.cmp(&b))
    }

    /// Partition this [`SignalVec`] by the key returned from a [`System`], emitting diffs over
    /// the all-groups list: group creation is an [`ArrayDiff::Added`], a group emptying is an
    /// [`ArrayDiff::Removed`], and a membership change within a live group is a removal plus
    /// re-insertion of that group's refreshed [`Group`] snapshot. Groups are ordered by first
    /// creation; members keep source order.
    fn group_by<K, F, M>(self, key: F) -> GroupBy<Self, K>
    where
        Self: Sized,
        Self::Item: Clone + PartialEq + SSs,
        K: GroupKey,
        F: IntoSystem<In<Self::Item>, K, M> + SSs,
    {
        GroupBy {
            upstream: self,
            signal: LazySignal::new(move |world: &mut World| {
                let key_system = world.register_system(key);
                let signal = register_signal::<Vec<ArrayDiff<Self::Item>>, Vec<ArrayDiff<Group<K, Self::Item>>>, _, _, _>(
                    world,
                    move |In(diffs): In<Vec<ArrayDiff<Self::Item>>>,
                          world: &mut World,
                          mut state: Local<GroupState<K, Self::Item>>| {
                        process_group_batch(world, &mut state, key_system, MemberOrder::SourceIndex, diffs)
                    },
                );
                world.entity_mut(*signal).insert(AttachedSystems(vec![key_system.entity()]));
                signal
            }),
            _marker: PhantomData,
        }
    }

    /// [`.group_by`](SignalVecExt::group_by) with members ordered by a secondary comparator
    /// [`System`] instead of source order.
    fn group_by_ordered<K, F, C, M1, M2>(self, key: F, compare: C) -> GroupBy<Self, K>
    where
        Self: Sized,
        Self::Item: Clone + PartialEq + SSs,
        K: GroupKey,
        F: IntoSystem<In<Self::Item>, K, M1> + SSs,
        C: IntoSystem<In<(Self::Item, Self::Item)>, Ordering, M2> + SSs,
    {
        GroupBy {
            upstream: self,
            signal: LazySignal::new(move |world: &mut World| {
                let key_system = world.register_system(key);
                let comparator = world.register_system(compare);
                let signal = register_signal::<Vec<ArrayDiff<Self::Item>>, Vec<ArrayDiff<Group<K, Self::Item>>>, _, _, _>(
                    world,
                    move |In(diffs): In<Vec<ArrayDiff<Self::Item>>>,
                          world: &mut World,
                          mut state: Local<GroupState<K, Self::Item>>| {
                        process_group_batch(world, &mut state, key_system, MemberOrder::Comparator(comparator), diffs)
                    },
                );
                world
                    .entity_mut(*signal)
                    .insert(AttachedSystems(vec![key_system.entity(), comparator.entity()]));
                signal
            }),
            _marker: PhantomData,
        }
    }

    /// Accumulate this [`SignalVec`]'s batches into its full current contents, emitted as a
    /// scalar [`Signal`] after every batch. This is the aggregate change notification surface.
    fn to_signal(self) -> ForEach<Self, Vec<Self::Item>>
    where
        Self: Sized,
        Self::Item: Clone + SSs,
    {
        self.for_each(
            |In(diffs): In<Vec<ArrayDiff<Self::Item>>>, mut contents: Local<Vec<Self::Item>>| {
                for diff in diffs {
                    diff.apply_to_vec(&mut contents);
                }
                contents.clone()
            },
        )
    }

    #[cfg(feature = "tracing")]
    #[track_caller]
    /// Adds debug logging to this [`SignalVec`]'s batches.
    fn debug(self) -> Debug<Self>
    where
        Self: Sized,
        Self::Item: Clone + core::fmt::Debug + SSs,
    {
        let location = core::panic::Location::caller();
        Debug {
            upstream: self,
            signal: lazy_signal_from_system(move |In(diffs): In<Vec<ArrayDiff<Self::Item>>>| {
                debug!("[{}] {:#?}", location, diffs);
                diffs
            }),
        }
    }

    /// Activate this [`SignalVec`] and all its upstreams, causing them to be evaluated every tick
    /// until they are [`SignalHandle::cleanup`]-ed. `cleanup` is the sole teardown path: it
    /// releases the source subscription, every per-element tracker, and the node itself.
    fn register(self, world: &mut World) -> SignalHandle
    where
        Self: Sized,
    {
        self.register_signal_vec(world)
    }
}

impl<T: ?Sized> SignalVecExt for T where T: SignalVec {}

/// [`Component`] that holds the actual state for a [`MutableVec`].
#[derive(Component)]
pub struct MutableVecData<T: SSs> {
    vec: Vec<T>,
    pending: Vec<ArrayDiff<T>>,
    subscribers: Vec<Entity>,
}

fn flush_mutable_vec_diffs<T: Clone + SSs>(world: &mut World, entity: Entity) {
    let Some(mut data) = world.get_mut::<MutableVecData<T>>(entity) else {
        return;
    };
    if data.pending.is_empty() {
        return;
    }
    let batch = core::mem::take(&mut data.pending);
    let subscribers = core::mem::take(&mut data.subscribers);
    let mut live = Vec::with_capacity(subscribers.len());
    for subscriber in subscribers {
        if let Some(mut queue) = world.get_mut::<QueuedDiffs<T>>(subscriber) {
            queue.0.extend(batch.iter().cloned());
            live.push(subscriber);
        }
    }
    if let Some(mut data) = world.get_mut::<MutableVecData<T>>(entity) {
        data.subscribers = live;
    }
}

/// A reactive ordered collection: an entity-backed [`Vec`] whose mutations are delivered to
/// subscribing [`SignalVec`]s as minimal [`ArrayDiff`] batches, one batch per tick. A freshly
/// registered subscriber first receives the current contents as a run of
/// [`ArrayDiff::Added`] entries, so the initial build flows through the same reconciliation path
/// as live changes.
pub struct MutableVec<T> {
    entity: Entity,
    references: Arc<AtomicUsize>,
    stale_queue: Arc<Mutex<Vec<Entity>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for MutableVec<T> {
    fn clone(&self) -> Self {
        self.references.fetch_add(1, AtomicOrdering::SeqCst);
        Self {
            entity: self.entity,
            references: self.references.clone(),
            stale_queue: self.stale_queue.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for MutableVec<T> {
    fn drop(&mut self) {
        if self.references.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            self.stale_queue.lock().unwrap().push(self.entity);
        }
    }
}

impl<T> MutableVec<T>
where
    T: Clone + SSs,
{
    /// Reads the current contents without involving the signal graph.
    pub fn read<'s>(&self, mutable_vec_data_reader: impl ReadMutableVecData<'s, T>) -> &'s [T] {
        &mutable_vec_data_reader.read(self.entity).vec
    }

    /// Returns a write guard whose mutations queue minimal diff entries, flushed as one batch to
    /// every subscriber at the top of the next tick.
    pub fn write<'w>(&self, mutable_vec_data_writer: impl WriteMutableVecData<'w, T>) -> MutableVecWriteGuard<'w, T> {
        MutableVecWriteGuard {
            data: mutable_vec_data_writer.write(self.entity),
        }
    }

    /// Returns a [`Source`] signal vec from this [`MutableVec`], replaying the current contents
    /// on first propagation after registration and then emitting every flushed batch.
    pub fn signal_vec(&self) -> Source<T> {
        let signal = LazySignal::new(clone!((self => self_) move |world: &mut World| {
            // deliver anything already staged before snapshotting the current contents
            flush_mutable_vec_diffs::<T>(world, self_.entity);
            let source_entity = LazyEntity::new();
            let source_system = clone!((source_entity) move |_: In<()>, mut queues: Query<&mut QueuedDiffs<T>>| {
                let mut queue = queues.get_mut(source_entity.get()).ok()?;
                if queue.0.is_empty() {
                    None
                } else {
                    Some(core::mem::take(&mut queue.0))
                }
            });
            let signal = register_signal::<(), Vec<ArrayDiff<T>>, _, _, _>(world, source_system);
            source_entity.set(*signal);
            let initial = world
                .get::<MutableVecData<T>>(self_.entity)
                .map(|data| {
                    data.vec
                        .iter()
                        .cloned()
                        .enumerate()
                        .map(|(index, value)| ArrayDiff::Added { index, value })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            world.entity_mut(*signal).insert(QueuedDiffs(initial));
            if let Some(mut data) = world.get_mut::<MutableVecData<T>>(self_.entity) {
                data.subscribers.push(*signal);
            }
            signal
        }));

        Source {
            signal,
            _marker: PhantomData,
        }
    }
}

/// Builds a [`MutableVec`] from initial contents.
pub struct MutableVecBuilder<T>(Vec<T>);

impl<T> From<Vec<T>> for MutableVecBuilder<T> {
    fn from(values: Vec<T>) -> Self {
        Self(values)
    }
}

impl<T, const N: usize> From<[T; N]> for MutableVecBuilder<T> {
    fn from(values: [T; N]) -> Self {
        Self(values.into())
    }
}

impl<T> FromIterator<T> for MutableVecBuilder<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T> MutableVecBuilder<T>
where
    T: Clone + SSs,
{
    /// Spawns the backing entity, consuming this builder.
    pub fn spawn(self, world: &mut World) -> MutableVec<T> {
        world.init_resource::<StaleSourceQueue>();
        let stale_queue = world.resource::<StaleSourceQueue>().0.clone();
        let entity = world
            .spawn((
                MutableVecData {
                    vec: self.0,
                    pending: Vec::new(),
                    subscribers: Vec::new(),
                },
                SourceFlusher(Arc::new(|world, entity| flush_mutable_vec_diffs::<T>(world, entity))),
            ))
            .id();
        MutableVec {
            entity,
            references: Arc::new(AtomicUsize::new(1)),
            stale_queue,
            _marker: PhantomData,
        }
    }
}

/// Write access to a [`MutableVec`]'s contents; every mutation queues the corresponding minimal
/// [`ArrayDiff`] entries.
pub struct MutableVecWriteGuard<'w, T: SSs> {
    data: Mut<'w, MutableVecData<T>>,
}

impl<T> Deref for MutableVecWriteGuard<'_, T>
where
    T: SSs,
{
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.data.vec
    }
}

impl<T> MutableVecWriteGuard<'_, T>
where
    T: Clone + SSs,
{
    /// Appends `value`.
    pub fn push(&mut self, value: T) {
        let index = self.data.vec.len();
        self.data.vec.push(value.clone());
        self.data.pending.push(ArrayDiff::Added { index, value });
    }

    /// Inserts `value` at `index`, clamped to the current length.
    pub fn insert(&mut self, index: usize, value: T) {
        let index = index.min(self.data.vec.len());
        self.data.vec.insert(index, value.clone());
        self.data.pending.push(ArrayDiff::Added { index, value });
    }

    /// Removes and returns the element at `index`, or [`None`] if out of range.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.data.vec.len() {
            return None;
        }
        let value = self.data.vec.remove(index);
        self.data.pending.push(ArrayDiff::Removed { index });
        Some(value)
    }

    /// Removes and returns the last element.
    pub fn pop(&mut self) -> Option<T> {
        let value = self.data.vec.pop()?;
        let index = self.data.vec.len();
        self.data.pending.push(ArrayDiff::Removed { index });
        Some(value)
    }

    /// Replaces the element at `index`, queued as a removal plus insertion at the same position.
    /// Returns whether `index` was in range.
    pub fn set(&mut self, index: usize, value: T) -> bool {
        if index >= self.data.vec.len() {
            return false;
        }
        self.data.vec[index] = value.clone();
        self.data.pending.push(ArrayDiff::Removed { index });
        self.data.pending.push(ArrayDiff::Added { index, value });
        true
    }

    /// Moves the element at `old_index` to `new_index`. Returns whether both were in range.
    pub fn move_item(&mut self, old_index: usize, new_index: usize) -> bool {
        let len = self.data.vec.len();
        if old_index >= len || new_index >= len {
            return false;
        }
        if old_index != new_index {
            let value = self.data.vec.remove(old_index);
            self.data.vec.insert(new_index, value);
            self.data.pending.push(ArrayDiff::Moved { old_index, new_index });
        }
        true
    }

    /// Removes every element, queued as repeated removals at index 0.
    pub fn clear(&mut self) {
        let len = self.data.vec.len();
        self.data.vec.clear();
        for _ in 0..len {
            self.data.pending.push(ArrayDiff::Removed { index: 0 });
        }
    }

    /// Replaces the entire contents.
    pub fn replace(&mut self, values: impl Into<Vec<T>>) {
        self.clear();
        let values = values.into();
        for (index, value) in values.iter().cloned().enumerate() {
            self.data.pending.push(ArrayDiff::Added { index, value });
        }
        self.data.vec = values;
    }
}

/// Specifies read accessors for [`MutableVec`]s.
pub trait ReadMutableVecData<'s, T>
where
    T: SSs,
{
    #[allow(missing_docs)]
    fn read(self, entity: Entity) -> &'s MutableVecData<T>;
}

impl<'s, T> ReadMutableVecData<'s, T> for &'s Query<'_, 's, &MutableVecData<T>>
where
    T: SSs,
{
    fn read(self, entity: Entity) -> &'s MutableVecData<T> {
        self.get(entity).unwrap()
    }
}

impl<'s, T> ReadMutableVecData<'s, T> for &'s World
where
    T: SSs,
{
    fn read(self, entity: Entity) -> &'s MutableVecData<T> {
        self.get(entity).unwrap()
    }
}

/// Specifies write accessors for [`MutableVec`]s.
pub trait WriteMutableVecData<'w, T>
where
    T: SSs,
{
    #[allow(missing_docs)]
    fn write(self, entity: Entity) -> Mut<'w, MutableVecData<T>>;
}

impl<'a, 'w, 's, T> WriteMutableVecData<'a, T> for &'a mut Query<'w, 's, &mut MutableVecData<T>>
where
    T: SSs,
{
    fn write(self, entity: Entity) -> Mut<'a, MutableVecData<T>> {
        self.get_mut(entity).unwrap()
    }
}

impl<'w, T> WriteMutableVecData<'w, T> for &'w mut World
where
    T: SSs,
{
    fn write(self, entity: Entity) -> Mut<'w, MutableVecData<T>> {
        self.get_mut(entity).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProjoPlugin, signal::Mutable};
    use bevy::prelude::*;
    use test_log::test;

    #[derive(Resource)]
    struct Snapshot<T: SSs> {
        contents: Vec<T>,
        notifications: usize,
    }

    impl<T: SSs> Default for Snapshot<T> {
        fn default() -> Self {
            Self {
                contents: Vec::new(),
                notifications: 0,
            }
        }
    }

    fn capture<T: Clone + SSs>(In(contents): In<Vec<T>>, mut snapshot: ResMut<Snapshot<T>>) {
        snapshot.contents = contents;
        snapshot.notifications += 1;
    }

    #[derive(Resource, Default)]
    struct Batches(Vec<Vec<ArrayDiff<i32>>>);

    fn capture_batches(In(diffs): In<Vec<ArrayDiff<i32>>>, mut batches: ResMut<Batches>) {
        batches.0.push(diffs);
    }

    fn create_test_app() -> App {
        let mut app = App::new();
        app.add_plugins((MinimalPlugins, ProjoPlugin));
        app
    }

    #[test]
    fn test_sorted_insert_position() {
        let compare = i32::cmp;
        assert_eq!(sorted_insert_position(&[], &5, |a, b| compare(a, b)), 0);
        assert_eq!(sorted_insert_position(&[1, 3, 5], &0, |a, b| compare(a, b)), 0);
        assert_eq!(sorted_insert_position(&[1, 3, 5], &4, |a, b| compare(a, b)), 2);
        assert_eq!(sorted_insert_position(&[1, 3, 5], &9, |a, b| compare(a, b)), 3);
        // an exact match stops at the probed midpoint
        assert_eq!(sorted_insert_position(&[1, 3, 5], &3, |a, b| compare(a, b)), 1);
    }

    #[test]
    fn test_apply_to_vec() {
        let mut target = vec![1, 2, 3];
        ArrayDiff::Added { index: 1, value: 9 }.apply_to_vec(&mut target);
        assert_eq!(target, vec![1, 9, 2, 3]);
        ArrayDiff::Removed { index: 0 }.apply_to_vec(&mut target);
        assert_eq!(target, vec![9, 2, 3]);
        ArrayDiff::<i32>::Moved {
            old_index: 0,
            new_index: 2,
        }
        .apply_to_vec(&mut target);
        assert_eq!(target, vec![2, 3, 9]);
        // out-of-range entries are clamped or ignored
        ArrayDiff::Removed { index: 17 }.apply_to_vec(&mut target);
        assert_eq!(target, vec![2, 3, 9]);
    }

    #[test]
    fn test_replay_initial_contents() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let numbers = MutableVecBuilder::from([1, 2, 3]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());

        app.update();
        let snapshot = app.world().resource::<Snapshot<i32>>();
        assert_eq!(snapshot.contents, vec![1, 2, 3]);
        assert_eq!(snapshot.notifications, 1);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_write_guard_operations() {
        let mut app = create_test_app();
        app.init_resource::<Batches>();

        let numbers = MutableVecBuilder::from([1, 2, 3]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .for_each(capture_batches)
            .register(app.world_mut());
        app.update();

        numbers.write(app.world_mut()).push(4);
        app.update();
        numbers.write(app.world_mut()).insert(1, 9);
        app.update();
        numbers.write(app.world_mut()).set(0, 7);
        app.update();
        assert_eq!(numbers.write(app.world_mut()).remove(2), Some(2));
        app.update();
        numbers.write(app.world_mut()).move_item(0, 2);
        app.update();
        assert_eq!(numbers.write(app.world_mut()).pop(), Some(4));
        app.update();
        numbers.write(app.world_mut()).clear();
        app.update();

        let batches = &app.world().resource::<Batches>().0;
        assert_eq!(
            *batches,
            vec![
                vec![
                    ArrayDiff::Added { index: 0, value: 1 },
                    ArrayDiff::Added { index: 1, value: 2 },
                    ArrayDiff::Added { index: 2, value: 3 },
                ],
                vec![ArrayDiff::Added { index: 3, value: 4 }],
                vec![ArrayDiff::Added { index: 1, value: 9 }],
                vec![ArrayDiff::Removed { index: 0 }, ArrayDiff::Added { index: 0, value: 7 }],
                vec![ArrayDiff::Removed { index: 2 }],
                vec![ArrayDiff::Moved {
                    old_index: 0,
                    new_index: 2
                }],
                vec![ArrayDiff::Removed { index: 3 }],
                vec![
                    ArrayDiff::Removed { index: 0 },
                    ArrayDiff::Removed { index: 0 },
                    ArrayDiff::Removed { index: 0 },
                ],
            ]
        );
        assert_eq!(numbers.read(&*app.world()), &[] as &[i32]);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_map_items() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let numbers = MutableVecBuilder::from([1, 2, 3]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .map_in(|x: i32| x * 2)
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());

        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![2, 4, 6]);

        numbers.write(app.world_mut()).push(5);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![2, 4, 6, 10]);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_sort_initial_and_delete() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let numbers = MutableVecBuilder::from([3, 1, 2]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .sort()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());

        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![1, 2, 3]);

        // deleting source index 1 removes the value 1
        numbers.write(app.world_mut()).remove(1);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![2, 3]);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_sort_incremental_matches_batch_rebuild() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let numbers = MutableVecBuilder::from([5, 1, 4]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .sort()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());
        app.update();

        {
            let mut guard = numbers.write(app.world_mut());
            guard.push(3);
            guard.insert(0, 2);
            guard.remove(2);
            guard.set(1, 6);
        }
        app.update();

        let mut expected: Vec<i32> = numbers.read(&*app.world()).to_vec();
        expected.sort();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, expected);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_sort_same_value_set_is_suppressed() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let numbers = MutableVecBuilder::from([1, 2, 3]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .sort()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());
        app.update();
        let notifications = app.world().resource::<Snapshot<i32>>().notifications;

        // a removal plus re-insertion that lands the same value back in the same output position
        numbers.write(app.world_mut()).set(1, 2);
        app.update();
        let snapshot = app.world().resource::<Snapshot<i32>>();
        assert_eq!(snapshot.notifications, notifications);
        assert_eq!(snapshot.contents, vec![1, 2, 3]);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_sort_moved_source_is_noop() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let numbers = MutableVecBuilder::from([1, 2, 3]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .sort()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());
        app.update();
        let notifications = app.world().resource::<Snapshot<i32>>().notifications;

        numbers.write(app.world_mut()).move_item(0, 2);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().notifications, notifications);

        // source bookkeeping stays addressable after the move
        numbers.write(app.world_mut()).remove(0);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![1, 3]);

        handle.cleanup(app.world_mut());
    }

    fn parity(In(n): In<i32>) -> &'static str {
        if n % 2 == 0 { "even" } else { "odd" }
    }

    #[test]
    fn test_group_by_parity() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<Group<&'static str, i32>>>();

        let numbers = MutableVecBuilder::from([1, 2, 3, 4]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .group_by(parity)
            .to_signal()
            .map(capture::<Group<&'static str, i32>>)
            .register(app.world_mut());

        app.update();
        {
            let groups = &app.world().resource::<Snapshot<Group<&'static str, i32>>>().contents;
            assert_eq!(groups.len(), 2);
            assert_eq!(groups[0].key, "odd");
            assert_eq!(groups[0].members, vec![1, 3]);
            assert_eq!(groups[1].key, "even");
            assert_eq!(groups[1].members, vec![2, 4]);
        }

        // inserting 5 at source index 2 lands it between 1 and 3 within "odd"
        numbers.write(app.world_mut()).insert(2, 5);
        app.update();
        {
            let groups = &app.world().resource::<Snapshot<Group<&'static str, i32>>>().contents;
            assert_eq!(groups[0].members, vec![1, 5, 3]);
            assert_eq!(groups[1].members, vec![2, 4]);
        }

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_group_empty_cleanup() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<Group<&'static str, i32>>>();

        let numbers = MutableVecBuilder::from([1, 2]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .group_by(parity)
            .to_signal()
            .map(capture::<Group<&'static str, i32>>)
            .register(app.world_mut());
        app.update();
        assert_eq!(
            app.world().resource::<Snapshot<Group<&'static str, i32>>>().contents.len(),
            2
        );

        // removing the only even member removes the "even" group entirely
        numbers.write(app.world_mut()).remove(1);
        app.update();
        {
            let groups = &app.world().resource::<Snapshot<Group<&'static str, i32>>>().contents;
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].key, "odd");
            assert_eq!(groups[0].members, vec![1]);
        }

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_group_by_ordered_members() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<Group<&'static str, i32>>>();

        let numbers = MutableVecBuilder::from([5, 1, 3]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .group_by_ordered(parity, |In((a, b)): In<(i32, i32)>| a.cmp(&b))
            .to_signal()
            .map(capture::<Group<&'static str, i32>>)
            .register(app.world_mut());

        app.update();
        {
            let groups = &app.world().resource::<Snapshot<Group<&'static str, i32>>>().contents;
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].members, vec![1, 3, 5]);
        }

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_group_same_value_set_is_suppressed() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<Group<&'static str, i32>>>();

        let numbers = MutableVecBuilder::from([1, 3, 2]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .group_by(parity)
            .to_signal()
            .map(capture::<Group<&'static str, i32>>)
            .register(app.world_mut());
        app.update();
        let notifications = app
            .world()
            .resource::<Snapshot<Group<&'static str, i32>>>()
            .notifications;

        // the member lands back in the same slot of a group that survives in place
        numbers.write(app.world_mut()).set(0, 1);
        app.update();
        {
            let snapshot = app.world().resource::<Snapshot<Group<&'static str, i32>>>();
            assert_eq!(snapshot.notifications, notifications);
            assert_eq!(snapshot.contents[0].members, vec![1, 3]);
            assert_eq!(snapshot.contents[1].members, vec![2]);
        }

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_group_rebuilt_group_notifies() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<Group<&'static str, i32>>>();

        let numbers = MutableVecBuilder::from([1, 2, 4]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .group_by(parity)
            .to_signal()
            .map(capture::<Group<&'static str, i32>>)
            .register(app.world_mut());
        app.update();
        let notifications = app
            .world()
            .resource::<Snapshot<Group<&'static str, i32>>>()
            .notifications;

        // same value, but the sole "odd" member is removed and re-added, so its group is dropped
        // and re-created at the end of the all-groups list; the new order must reach downstream
        numbers.write(app.world_mut()).set(0, 1);
        app.update();
        {
            let snapshot = app.world().resource::<Snapshot<Group<&'static str, i32>>>();
            assert_eq!(snapshot.notifications, notifications + 1);
            assert_eq!(snapshot.contents[0].key, "even");
            assert_eq!(snapshot.contents[0].members, vec![2, 4]);
            assert_eq!(snapshot.contents[1].key, "odd");
            assert_eq!(snapshot.contents[1].members, vec![1]);
        }

        // later group-position-addressed diffs land on the right group
        numbers.write(app.world_mut()).push(6);
        app.update();
        {
            let snapshot = app.world().resource::<Snapshot<Group<&'static str, i32>>>();
            assert_eq!(snapshot.contents[0].members, vec![2, 4, 6]);
            assert_eq!(snapshot.contents[1].members, vec![1]);
        }

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_track_regroups_on_value_change() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<Group<&'static str, i32>>>();

        let a = Mutable::new(app.world_mut(), 1);
        let b = Mutable::new(app.world_mut(), 3);
        let c = Mutable::new(app.world_mut(), 2);
        let elements = MutableVecBuilder::from(vec![a.clone(), b.clone(), c.clone()]).spawn(app.world_mut());
        let handle = elements
            .signal_vec()
            .track(|In(element): In<Mutable<i32>>| element.signal())
            .group_by(parity)
            .to_signal()
            .map(capture::<Group<&'static str, i32>>)
            .register(app.world_mut());

        app.update();
        {
            let groups = &app.world().resource::<Snapshot<Group<&'static str, i32>>>().contents;
            assert_eq!(groups[0].key, "odd");
            assert_eq!(groups[0].members, vec![1, 3]);
            assert_eq!(groups[1].key, "even");
            assert_eq!(groups[1].members, vec![2]);
        }
        let notifications = app
            .world()
            .resource::<Snapshot<Group<&'static str, i32>>>()
            .notifications;

        // a parity flip moves the element across groups in one notification
        a.set(app.world_mut(), 4);
        app.update();
        {
            let snapshot = app.world().resource::<Snapshot<Group<&'static str, i32>>>();
            assert_eq!(snapshot.notifications, notifications + 1);
            assert_eq!(snapshot.contents[0].key, "odd");
            assert_eq!(snapshot.contents[0].members, vec![3]);
            assert_eq!(snapshot.contents[1].key, "even");
            assert_eq!(snapshot.contents[1].members, vec![4, 2]);
        }

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_group_moved_source_reorders_members() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<Group<&'static str, i32>>>();

        let numbers = MutableVecBuilder::from([1, 3, 5]).spawn(app.world_mut());
        let handle = numbers
            .signal_vec()
            .group_by(parity)
            .to_signal()
            .map(capture::<Group<&'static str, i32>>)
            .register(app.world_mut());
        app.update();

        numbers.write(app.world_mut()).move_item(0, 2);
        app.update();
        {
            let groups = &app.world().resource::<Snapshot<Group<&'static str, i32>>>().contents;
            assert_eq!(groups[0].members, vec![3, 5, 1]);
        }

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_track_value_change_resorts() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let a = Mutable::new(app.world_mut(), 3);
        let b = Mutable::new(app.world_mut(), 4);
        let c = Mutable::new(app.world_mut(), 6);
        let elements = MutableVecBuilder::from(vec![a.clone(), b.clone(), c.clone()]).spawn(app.world_mut());
        let handle = elements
            .signal_vec()
            .track(|In(element): In<Mutable<i32>>| element.signal())
            .sort()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());

        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![3, 4, 6]);
        let notifications = app.world().resource::<Snapshot<i32>>().notifications;

        // in-place value change: same output position, different value, exactly one notification
        b.set(app.world_mut(), 5);
        app.update();
        {
            let snapshot = app.world().resource::<Snapshot<i32>>();
            assert_eq!(snapshot.contents, vec![3, 5, 6]);
            assert_eq!(snapshot.notifications, notifications + 1);
        }

        // re-emitting the same value notifies nothing
        b.set(app.world_mut(), 5);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().notifications, notifications + 1);

        // a change that crosses neighbors repositions the element
        b.set(app.world_mut(), 9);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![3, 6, 9]);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_track_structural_changes() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let a = Mutable::new(app.world_mut(), 2);
        let b = Mutable::new(app.world_mut(), 1);
        let elements = MutableVecBuilder::from(vec![a.clone(), b.clone()]).spawn(app.world_mut());
        let handle = elements
            .signal_vec()
            .track(|In(element): In<Mutable<i32>>| element.signal())
            .sort()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![1, 2]);

        let c = Mutable::new(app.world_mut(), 0);
        elements.write(app.world_mut()).push(c.clone());
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![0, 1, 2]);

        elements.write(app.world_mut()).remove(0);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![0, 1]);

        // a removed element's tracker is disposed, so its signal no longer feeds the view
        a.set(app.world_mut(), 100);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().contents, vec![0, 1]);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_cleanup_disposes_projection() {
        let mut app = create_test_app();
        app.init_resource::<Snapshot<i32>>();

        let a = Mutable::new(app.world_mut(), 1);
        let elements = MutableVecBuilder::from(vec![a.clone()]).spawn(app.world_mut());
        let handle = elements
            .signal_vec()
            .track(|In(element): In<Mutable<i32>>| element.signal())
            .sort()
            .to_signal()
            .map(capture::<i32>)
            .register(app.world_mut());
        app.update();
        assert_eq!(app.world_mut().query::<&SourceIndex>().iter(app.world()).count(), 1);

        handle.cleanup(app.world_mut());
        app.update();
        assert_eq!(app.world_mut().query::<&SourceIndex>().iter(app.world()).count(), 0);

        let notifications = app.world().resource::<Snapshot<i32>>().notifications;
        let b = Mutable::new(app.world_mut(), 2);
        elements.write(app.world_mut()).push(b);
        a.set(app.world_mut(), 9);
        app.update();
        assert_eq!(app.world().resource::<Snapshot<i32>>().notifications, notifications);
    }
}
