//! Signal graph management and runtime.
//!
//! Every signal node is a registered [`System`] living on its own [`Entity`]; [`Upstream`] and
//! [`Downstream`] components wire the nodes into a DAG. Once per [`Last`](bevy_app::Last) tick,
//! [`process_signal_graph`] runs every root node and pushes outputs depth-first, terminating any
//! branch whose [`System`] returns [`None`] for the tick. Propagation is synchronous and may be
//! re-entered from inside a running node via [`process_signals`], which is how per-element value
//! changes inject their synthetic diffs without waiting a tick.

use super::utils::*;

use bevy_derive::Deref;
use bevy_ecs::{
    component::HookContext,
    prelude::*,
    system::{RunSystemOnce, SystemId},
    world::DeferredWorld,
};
#[cfg(feature = "tracing")]
use bevy_log::prelude::*;
use bevy_platform::{
    collections::{HashMap, HashSet},
    prelude::*,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};
use core::any::Any;
use dyn_clone::{DynClone, clone_trait_object};

/// Newtype wrapper for [`Entity`]s that hold systems in the signal graph.
#[derive(Clone, Copy, Deref, Debug, PartialEq, Eq, Hash)]
pub struct SignalSystem(pub Entity);

impl From<Entity> for SignalSystem {
    fn from(entity: Entity) -> Self {
        Self(entity)
    }
}

impl<I: 'static, O> From<SystemId<In<I>, O>> for SignalSystem {
    fn from(system_id: SystemId<In<I>, O>) -> Self {
        system_id.entity().into()
    }
}

/// How many live registrations refer to this node; the node is only despawned once this reaches
/// zero and no lazy handles remain.
#[derive(Component, Deref)]
pub(crate) struct SignalRegistrationCount(i32);

impl SignalRegistrationCount {
    fn new() -> Self {
        Self(1)
    }

    fn increment(&mut self) {
        self.0 += 1
    }

    fn decrement(&mut self) {
        self.0 -= 1
    }
}

pub(crate) fn register_signal<I, O, IOO, F, M>(world: &mut World, system: F) -> SignalSystem
where
    I: 'static,
    O: Clone + 'static,
    IOO: Into<Option<O>> + 'static,
    F: IntoSystem<In<I>, IOO, M> + SSs,
{
    lazy_signal_from_system(system).register(world)
}

fn unlink_downstreams(mut world: DeferredWorld, HookContext { entity, .. }: HookContext) {
    world.commands().queue(move |world: &mut World| {
        let _ = world.run_system_once(
            move |upstreams: Query<&Upstream>, mut downstreams: Query<&mut Downstream>, mut commands: Commands| {
                if let Ok(upstream) = upstreams.get(entity) {
                    for &upstream_system in upstream.iter() {
                        if let Ok(mut downstreams) = downstreams.get_mut(*upstream_system) {
                            downstreams.0.remove(&SignalSystem(entity));
                            if downstreams.0.is_empty()
                                && let Ok(mut entity) = commands.get_entity(*upstream_system)
                            {
                                entity.remove::<Downstream>();
                            }
                        }
                    }
                }
            },
        );
    });
}

/// The nodes this node receives inputs from.
#[derive(Component, Deref, Clone)]
#[component(on_remove = unlink_downstreams)]
pub(crate) struct Upstream(pub(crate) HashSet<SignalSystem>);

impl<'a> IntoIterator for &'a Upstream {
    type Item = <Self::IntoIter as Iterator>::Item;

    type IntoIter = bevy_platform::collections::hash_set::Iter<'a, SignalSystem>;

    #[inline(always)]
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The nodes this node forwards outputs to.
#[derive(Component, Deref, Clone)]
pub(crate) struct Downstream(HashSet<SignalSystem>);

impl<'a> IntoIterator for &'a Downstream {
    type Item = <Self::IntoIter as Iterator>::Item;

    type IntoIter = bevy_platform::collections::hash_set::Iter<'a, SignalSystem>;

    #[inline(always)]
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn would_create_cycle(world: &World, source: SignalSystem, target: SignalSystem) -> bool {
    if source == target {
        return true;
    }

    let mut stack = vec![target];
    let mut visited = HashSet::new();

    while let Some(node) = stack.pop() {
        if node == source {
            return true;
        }
        if visited.insert(node)
            && let Some(down) = world.get::<Downstream>(*node)
        {
            stack.extend(down.iter().copied());
        }
    }
    false
}

pub(crate) fn pipe_signal(world: &mut World, source: SignalSystem, target: SignalSystem) {
    if would_create_cycle(world, source, target) {
        #[cfg(feature = "tracing")]
        error!("cycle detected when attempting to pipe {:?} -> {:?}", source, target);
        return;
    }
    if let Ok(mut upstream) = world.get_entity_mut(*source) {
        if let Some(mut downstream) = upstream.get_mut::<Downstream>() {
            downstream.0.insert(target);
        } else {
            upstream.insert(Downstream(HashSet::from([target])));
        }
    }
    if let Ok(mut downstream) = world.get_entity_mut(*target) {
        if let Some(mut upstream) = downstream.get_mut::<Upstream>() {
            upstream.0.insert(source);
        } else {
            downstream.insert(Upstream(HashSet::from([source])));
        }
    }
}

/// An extension trait for [`Any`] types that implement [`Clone`].
pub trait AnyClone: Any + DynClone {}
clone_trait_object!(AnyClone);

impl<T: Clone + 'static> AnyClone for T {}

/// Type-erased runner for the [`System`] backing a node; inputs are downcast to the concrete
/// [`In`] type before the system is run.
#[derive(Component, Clone)]
struct NodeRunner {
    #[allow(clippy::type_complexity)]
    runner: Arc<dyn Fn(&mut World, Box<dyn Any>) -> Option<Box<dyn AnyClone>> + Send + Sync>,
}

impl NodeRunner {
    fn new<I, O, IOO>(system: SystemId<In<I>, IOO>) -> Self
    where
        I: 'static,
        O: Clone + 'static,
        IOO: Into<Option<O>> + 'static,
    {
        Self {
            runner: Arc::new(move |world: &mut World, input: Box<dyn Any>| match input.downcast::<I>() {
                Ok(input) => world
                    .run_system_with(system, *input)
                    .ok()
                    .and_then(Into::into)
                    .map(|output| Box::new(output) as Box<dyn AnyClone>),
                Err(_input) => {
                    #[cfg(feature = "tracing")]
                    error!("failed to downcast input for signal system {:?}", system);
                    None
                }
            }),
        }
    }

    fn run(&self, world: &mut World, input: Box<dyn Any>) -> Option<Box<dyn AnyClone>> {
        (self.runner)(world, input)
    }
}

/// Runs `input` through each of `signals` and recursively pushes any outputs to their downstreams.
///
/// Safe to call from inside a node that is itself being processed; the nested propagation runs to
/// completion before control returns to the caller.
pub(crate) fn process_signals(
    world: &mut World,
    signals: impl IntoIterator<Item = SignalSystem>,
    input: Box<dyn AnyClone>,
) {
    for signal in signals {
        if let Some(runner) = world
            .get_entity(*signal)
            .ok()
            .and_then(|entity| entity.get::<NodeRunner>().cloned())
            && let Some(output) = runner.run(world, input.clone())
            && let Some(downstream) = world.get::<Downstream>(*signal).cloned()
        {
            let targets = downstream.iter().copied().collect::<Vec<_>>();
            process_signals(world, targets, output);
        }
    }
}

/// Runs every root node (a node with downstreams but no upstreams) in the graph, pushing outputs
/// through their downstream chains.
pub(crate) fn process_signal_graph(world: &mut World) {
    let mut roots = world.query_filtered::<Entity, (With<NodeRunner>, Without<Upstream>, With<Downstream>)>();
    let roots = roots.iter(world).map(SignalSystem).collect::<Vec<_>>();
    process_signals(world, roots, Box::new(()));
}

/// Handle to a particular node of the signal graph, returned by
/// [`SignalExt::register`](super::signal::SignalExt) and
/// [`SignalVecExt::register`](super::signal_vec::SignalVecExt::register). In order for signals to
/// be appropriately cleaned up, for every call to `.register` made to some particular signal or its
/// clones, [`SignalHandle::cleanup`] must be called on a corresponding [`SignalHandle`] or a
/// downstream [`SignalHandle`]. Adding [`SignalHandle`]s to the [`SignalHandles`] [`Component`]
/// will take care of this when the corresponding [`Entity`] is despawned.
#[derive(Clone, Deref)]
pub struct SignalHandle(pub SignalSystem);

impl From<SignalSystem> for SignalHandle {
    fn from(signal: SignalSystem) -> Self {
        Self(signal)
    }
}

impl SignalHandle {
    pub(crate) fn new(signal: SignalSystem) -> Self {
        Self(signal)
    }

    /// Decrements the usage tracking of the corresponding signal and all its upstreams,
    /// potentially despawning the backing [`System`]s, see [`SignalHandle`].
    ///
    /// This is the sole teardown path for a registered projection: the source subscription, every
    /// intermediate node, and any per-element state they own are released here.
    pub fn cleanup(self, world: &mut World) {
        cleanup_signals(world, [self.0]);
    }
}

fn cleanup_signals(world: &mut World, signals: impl IntoIterator<Item = SignalSystem>) {
    for signal in signals {
        if let Some(upstreams) = world.get::<Upstream>(*signal).cloned() {
            cleanup_signals(world, upstreams.0);
        }
        if let Ok(mut entity) = world.get_entity_mut(*signal) {
            let mut no_registrations = false;
            if let Some(mut registration_count) = entity.get_mut::<SignalRegistrationCount>() {
                registration_count.decrement();
                if **registration_count == 0 {
                    entity.remove::<Upstream>();
                    entity.remove::<Downstream>();
                    no_registrations = true;
                }
            }
            if no_registrations
                && let Some(LazySignalHolder(lazy_signal)) = entity.get::<LazySignalHolder>()
                && lazy_signal.inner.references.load(Ordering::SeqCst) == 1
            {
                entity.despawn();
            }
        }
    }
}

fn cleanup_signal_handles(mut world: DeferredWorld, HookContext { entity, .. }: HookContext) {
    if let Some(handles) = world.get_entity_mut(entity).ok().and_then(|mut entity| {
        entity
            .get_mut::<SignalHandles>()
            .map(|mut handles| handles.0.drain(..).collect::<Vec<_>>())
    }) {
        let mut commands = world.commands();
        for handle in handles {
            commands.queue(|world: &mut World| handle.cleanup(world));
        }
    }
}

/// Stores [`SignalHandle`]s tied to the lifetime of some [`Entity`],
/// [`.cleanup`](SignalHandle::cleanup)-ing them when the [`Entity`] is despawned.
#[derive(Component, Default)]
#[component(on_remove = cleanup_signal_handles)]
pub struct SignalHandles(Vec<SignalHandle>);

impl<T> From<T> for SignalHandles
where
    Vec<SignalHandle>: From<T>,
{
    #[inline]
    fn from(values: T) -> Self {
        SignalHandles(values.into())
    }
}

impl SignalHandles {
    #[allow(missing_docs)]
    pub fn add(&mut self, handle: SignalHandle) {
        self.0.push(handle);
    }
}

fn spawn_signal<I, O, IOO, F, M>(world: &mut World, system: F) -> SignalSystem
where
    I: 'static,
    O: Clone + 'static,
    IOO: Into<Option<O>> + 'static,
    F: IntoSystem<In<I>, IOO, M> + 'static,
{
    let system = world.register_system(system);
    let entity = system.entity();
    world
        .entity_mut(entity)
        .insert((SignalRegistrationCount::new(), NodeRunner::new::<I, O, IOO>(system)));
    entity.into()
}

pub(crate) struct LazySignalState {
    references: AtomicUsize,
    pub(crate) system: RwLock<LazySystem>,
}

pub(crate) enum LazySystem {
    #[allow(clippy::type_complexity)]
    System(Option<Box<dyn FnOnce(&mut World) -> SignalSystem + Send + Sync>>),
    Registered {
        signal: SignalSystem,
        cleanup_queue: Arc<Mutex<Vec<SignalSystem>>>,
    },
}

impl LazySystem {
    fn register(&mut self, world: &mut World) -> SignalSystem {
        match self {
            LazySystem::System(spawner) => {
                let signal = spawner.take().unwrap()(world);
                world.init_resource::<SignalCleanupQueue>();
                let cleanup_queue = world.resource::<SignalCleanupQueue>().0.clone();
                *self = LazySystem::Registered { signal, cleanup_queue };
                signal
            }
            LazySystem::Registered { signal, .. } => {
                if let Ok(mut system) = world.get_entity_mut(**signal)
                    && let Some(mut registration_count) = system.get_mut::<SignalRegistrationCount>()
                {
                    registration_count.increment();
                }
                *signal
            }
        }
    }
}

/// A signal node description whose backing [`System`] is only spawned on first registration;
/// subsequent registrations of clones bump the shared registration count instead.
pub(crate) struct LazySignal {
    pub(crate) inner: Arc<LazySignalState>,
}

impl LazySignal {
    pub(crate) fn new<F: FnOnce(&mut World) -> SignalSystem + SSs>(system: F) -> Self {
        LazySignal {
            inner: Arc::new(LazySignalState {
                references: AtomicUsize::new(1),
                system: RwLock::new(LazySystem::System(Some(Box::new(system)))),
            }),
        }
    }

    pub(crate) fn register(self, world: &mut World) -> SignalSystem {
        let signal = self.inner.system.write().unwrap().register(world);
        if let Ok(mut entity) = world.get_entity_mut(*signal)
            && !entity.contains::<LazySignalHolder>()
        {
            entity.insert(LazySignalHolder(self));
        }
        signal
    }
}

impl Clone for LazySignal {
    fn clone(&self) -> Self {
        self.inner.references.fetch_add(1, Ordering::SeqCst);
        LazySignal {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for LazySignal {
    fn drop(&mut self) {
        // <= 2 because the holder on the node entity also keeps a reference
        if self.inner.references.fetch_sub(1, Ordering::SeqCst) <= 2
            && let LazySystem::Registered {
                signal,
                ref cleanup_queue,
            } = *self.inner.system.read().unwrap()
        {
            cleanup_queue.lock().unwrap().push(signal);
        }
    }
}

#[derive(Component)]
pub(crate) struct LazySignalHolder(LazySignal);

/// Signals whose last user-held registration dropped, staged for despawn consideration. One per
/// [`World`]; registration captures the owning world's queue so drops from any thread stage into
/// the right world.
#[derive(Resource, Clone, Default)]
pub(crate) struct SignalCleanupQueue(pub(crate) Arc<Mutex<Vec<SignalSystem>>>);

pub(crate) fn flush_cleanup_signals(world: &mut World) {
    let Some(queue) = world.get_resource::<SignalCleanupQueue>().map(|queue| queue.0.clone()) else {
        return;
    };
    let signals = queue.lock().unwrap().drain(..).collect::<Vec<_>>();
    for signal in signals {
        if let Ok(entity) = world.get_entity_mut(*signal)
            && let Some(registration_count) = entity.get::<SignalRegistrationCount>()
            && **registration_count == 0
        {
            entity.despawn();
        }
    }
}

pub(crate) fn lazy_signal_from_system<I, O, IOO, F, M>(system: F) -> LazySignal
where
    I: 'static,
    O: Clone + 'static,
    IOO: Into<Option<O>> + 'static,
    F: IntoSystem<In<I>, IOO, M> + SSs,
{
    LazySignal::new(move |world: &mut World| spawn_signal(world, system))
}

/// Type-erased flush for a source entity's staged writes. [`Mutable`](super::signal::Mutable) and
/// [`MutableVec`](super::signal_vec::MutableVec) spawn one alongside their data; each is run at
/// the top of every [`Last`](bevy_app::Last) tick, before the graph is processed, copying any
/// pending change into every live subscriber's queue.
#[derive(Component, Clone)]
pub(crate) struct SourceFlusher(pub(crate) Arc<dyn Fn(&mut World, Entity) + Send + Sync>);

pub(crate) fn flush_pending_sources(world: &mut World) {
    let mut sources = world.query::<(Entity, &SourceFlusher)>();
    let sources = sources
        .iter(world)
        .map(|(entity, flusher)| (entity, flusher.clone()))
        .collect::<Vec<_>>();
    for (entity, SourceFlusher(flush)) in sources {
        flush(world, entity);
    }
}

/// Entities backing dropped [`Mutable`](super::signal::Mutable)s and
/// [`MutableVec`](super::signal_vec::MutableVec)s, reaped once per tick. One per [`World`];
/// construction captures the owning world's queue so an [`Entity`] id never crosses worlds.
#[derive(Resource, Clone, Default)]
pub(crate) struct StaleSourceQueue(pub(crate) Arc<Mutex<Vec<Entity>>>);

pub(crate) fn despawn_stale_sources(world: &mut World) {
    let Some(queue) = world.get_resource::<StaleSourceQueue>().map(|queue| queue.0.clone()) else {
        return;
    };
    let stale = queue.lock().unwrap().drain(..).collect::<Vec<_>>();
    for entity in stale {
        if let Ok(entity) = world.get_entity_mut(entity)
            && entity.contains::<SourceFlusher>()
        {
            entity.despawn();
        }
    }
}

fn poll_signal_one_shot(In(signal): In<SignalSystem>, world: &mut World) -> Option<Box<dyn AnyClone>> {
    fn visit(
        world: &mut World,
        node: SignalSystem,
        cache: &mut HashMap<SignalSystem, Option<Box<dyn AnyClone>>>,
    ) -> Option<Box<dyn AnyClone>> {
        if let Some(cached) = cache.get(&node) {
            return cached.clone();
        }

        let runner = match world.get::<NodeRunner>(*node) {
            Some(runner) => runner.clone(),
            None => {
                cache.insert(node, None);
                return None;
            }
        };

        let upstreams: Vec<SignalSystem> = world
            .get::<Upstream>(*node)
            .map(|upstream| {
                let mut upstreams: Vec<_> = upstream.0.iter().copied().collect();
                upstreams.sort_by_key(|signal| **signal);
                upstreams
            })
            .unwrap_or_default();

        let mut last_output = None;

        if upstreams.is_empty() {
            last_output = runner.run(world, Box::new(()));
        } else {
            for upstream in upstreams {
                if let Some(input) = visit(world, upstream, cache)
                    && let Some(output) = runner.run(world, input)
                {
                    last_output = Some(output);
                }
            }
        }

        cache.insert(node, last_output.clone());
        last_output
    }

    let mut cache = HashMap::new();
    visit(world, signal, &mut cache)
}

/// Get a signal's current value by running all of its dependencies.
pub fn poll_signal(world: &mut World, signal: SignalSystem) -> Option<Box<dyn AnyClone>> {
    world
        .run_system_cached_with(poll_signal_one_shot, signal)
        .ok()
        .flatten()
}

/// Utility function for extracting values from [`AnyClone`]s, e.g. those returned by
/// [`poll_signal`].
pub fn downcast_any_clone<T: 'static>(any_clone: Box<dyn AnyClone>) -> Option<T> {
    (any_clone as Box<dyn Any>).downcast::<T>().map(|value| *value).ok()
}
