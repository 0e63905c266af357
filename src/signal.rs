//! Scalar signal builders and combinators, plus [`Mutable`], the reactive scalar container that
//! per-element value tracking is built on, see [`SignalExt`] and [`Mutable`].

use super::{graph::*, utils::*};
use bevy_ecs::{change_detection::Mut, prelude::*};
#[cfg(feature = "tracing")]
use bevy_log::prelude::*;
use bevy_platform::{
    prelude::*,
    sync::{Arc, Mutex, atomic::AtomicUsize, atomic::Ordering as AtomicOrdering},
};
use core::marker::PhantomData;

/// Monadic registration facade for structs that encapsulate some [`System`] which is a valid member
/// of the signal graph.
pub trait Signal: SSs {
    /// Output type.
    type Item;

    /// Registers the [`System`]s associated with this [`Signal`] by consuming its boxed form.
    ///
    /// All concrete signal types must implement this method.
    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle;

    /// Registers the [`System`]s associated with this [`Signal`].
    fn register_signal(self, world: &mut World) -> SignalHandle
    where
        Self: Sized,
    {
        self.boxed().register_boxed_signal(world)
    }
}

impl<O: 'static> Signal for Box<dyn Signal<Item = O> + Send + Sync> {
    type Item = O;

    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
        (*self).register_boxed_signal(world)
    }
}

/// Signal graph node which takes an input of [`In<()>`] and has no upstreams. See
/// [`SignalBuilder`] methods for examples.
#[derive(Clone)]
pub struct Source<O> {
    signal: LazySignal,
    _marker: PhantomData<fn() -> O>,
}

impl<O> Signal for Source<O>
where
    O: 'static,
{
    type Item = O;

    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
        SignalHandle::new(self.signal.register(world))
    }
}

/// Signal graph node which applies a [`System`] to its upstream, see [`.map`](SignalExt::map).
#[derive(Clone)]
pub struct Map<Upstream, O> {
    upstream: Upstream,
    signal: LazySignal,
    _marker: PhantomData<fn() -> O>,
}

impl<Upstream, O> Signal for Map<Upstream, O>
where
    Upstream: Signal,
    O: 'static,
{
    type Item = O;

    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
        let SignalHandle(upstream) = self.upstream.register(world);
        let signal = self.signal.register(world);
        pipe_signal(world, upstream, signal);
        signal.into()
    }
}

/// Signal graph node which only forwards upstream values that differ from the previous one, see
/// [`.dedupe`](SignalExt::dedupe).
#[derive(Clone)]
pub struct Dedupe<Upstream>
where
    Upstream: Signal,
{
    signal: Map<Upstream, Upstream::Item>,
}

impl<Upstream> Signal for Dedupe<Upstream>
where
    Upstream: Signal,
    Upstream::Item: 'static,
{
    type Item = Upstream::Item;

    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
        self.signal.register(world)
    }
}

/// Signal graph node which only forwards the first upstream value, see
/// [`.first`](SignalExt::first).
#[derive(Clone)]
pub struct First<Upstream>
where
    Upstream: Signal,
{
    signal: Map<Upstream, Upstream::Item>,
}

impl<Upstream> Signal for First<Upstream>
where
    Upstream: Signal,
    Upstream::Item: 'static,
{
    type Item = Upstream::Item;

    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
        self.signal.register(world)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "tracing")] {
        /// Signal graph node that debug logs its upstream's outputs, see
        /// [`.debug`](SignalExt::debug).
        #[derive(Clone)]
        pub struct Debug<Upstream>
        where
            Upstream: Signal,
        {
            signal: Map<Upstream, Upstream::Item>,
        }

        impl<Upstream> Signal for Debug<Upstream>
        where
            Upstream: Signal,
            Upstream::Item: 'static,
        {
            type Item = Upstream::Item;

            fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
                self.signal.register(world)
            }
        }
    }
}

/// Provides methods for creating root [`Signal`]s.
pub struct SignalBuilder;

impl SignalBuilder {
    /// Creates a [`Source`] signal from a [`System`] that takes [`In<()>`].
    pub fn from_system<O, IOO, F, M>(system: F) -> Source<O>
    where
        O: Clone + 'static,
        IOO: Into<Option<O>> + 'static,
        F: IntoSystem<In<()>, IOO, M> + SSs,
    {
        Source {
            signal: lazy_signal_from_system(system),
            _marker: PhantomData,
        }
    }
}

/// Extension trait providing combinator methods for [`Signal`]s.
pub trait SignalExt: Signal {
    /// Pass the output of this [`Signal`] to a [`System`], continuing propagation if the [`System`]
    /// returns [`Some`] or terminating for the tick if it returns [`None`]. If the [`System`]
    /// logic is infallible, wrapping the result in an [`Option`] is unnecessary.
    fn map<O, IOO, F, M>(self, system: F) -> Map<Self, O>
    where
        Self: Sized,
        Self::Item: 'static,
        O: Clone + 'static,
        IOO: Into<Option<O>> + 'static,
        F: IntoSystem<In<Self::Item>, IOO, M> + SSs,
    {
        Map {
            upstream: self,
            signal: lazy_signal_from_system(system),
            _marker: PhantomData,
        }
    }

    /// Pass the output of this [`Signal`] to an [`FnMut`], continuing propagation if the [`FnMut`]
    /// returns [`Some`] or terminating for the tick if it returns [`None`].
    ///
    /// Convenient when additional [`SystemParam`](bevy_ecs::system::SystemParam)s aren't necessary.
    fn map_in<O, IOO, F>(self, mut function: F) -> Map<Self, O>
    where
        Self: Sized,
        Self::Item: 'static,
        O: Clone + 'static,
        IOO: Into<Option<O>> + 'static,
        F: FnMut(Self::Item) -> IOO + SSs,
    {
        self.map(move |In(item)| function(item))
    }

    /// Only forward this [`Signal`]'s output when it changes, comparing with [`PartialEq`]; the
    /// first output always propagates.
    ///
    /// Per-element value tracking applies the same "only notify on a genuine change" comparison
    /// at its own site, see [`.track`](super::signal_vec::SignalVecExt::track).
    fn dedupe(self) -> Dedupe<Self>
    where
        Self: Sized,
        Self::Item: PartialEq + Clone + Send + 'static,
    {
        Dedupe {
            signal: self.map(|In(current): In<Self::Item>, mut cache: Local<Option<Self::Item>>| {
                let changed = match &*cache {
                    Some(previous) => *previous != current,
                    None => true,
                };

                if changed {
                    *cache = Some(current.clone());
                    Some(current)
                } else {
                    None
                }
            }),
        }
    }

    /// Only forward this [`Signal`]'s first output, terminating propagation afterwards.
    fn first(self) -> First<Self>
    where
        Self: Sized,
        Self::Item: Clone + 'static,
    {
        First {
            signal: self.map(|In(item): In<Self::Item>, mut seen: Local<bool>| {
                if *seen {
                    None
                } else {
                    *seen = true;
                    Some(item)
                }
            }),
        }
    }

    #[cfg(feature = "tracing")]
    #[track_caller]
    /// Adds debug logging to this [`Signal`]'s outputs.
    fn debug(self) -> Debug<Self>
    where
        Self: Sized,
        Self::Item: core::fmt::Debug + Clone + 'static,
    {
        let location = core::panic::Location::caller();
        Debug {
            signal: self.map(move |In(item): In<Self::Item>| {
                debug!("[{}] {:#?}", location, item);
                item
            }),
        }
    }

    /// Erases the type of this [`Signal`], allowing it to be used in conjunction with [`Signal`]s
    /// of other concrete types.
    fn boxed(self) -> Box<dyn Signal<Item = Self::Item> + Send + Sync>
    where
        Self: Sized,
    {
        Box::new(self)
    }

    /// Activate this [`Signal`] and all its upstreams, causing them to be evaluated every tick
    /// until they are [`SignalHandle::cleanup`]-ed, see [`SignalHandle`].
    fn register(self, world: &mut World) -> SignalHandle
    where
        Self: Sized,
    {
        self.register_signal(world)
    }
}

impl<T: ?Sized> SignalExt for T where T: Signal {}

/// [`Component`] that holds the actual state for a [`Mutable`].
#[derive(Component)]
pub struct MutableData<T: SSs> {
    value: T,
    pending: Option<T>,
    subscribers: Vec<Entity>,
}

/// Values staged for one subscriber of a [`Mutable`], drained by that subscriber's source system.
#[derive(Component)]
struct QueuedValues<T: SSs>(Vec<T>);

fn flush_mutable_value<T: Clone + SSs>(world: &mut World, entity: Entity) {
    let Some(mut data) = world.get_mut::<MutableData<T>>(entity) else {
        return;
    };
    let Some(value) = data.pending.take() else {
        return;
    };
    let subscribers = core::mem::take(&mut data.subscribers);
    let mut live = Vec::with_capacity(subscribers.len());
    for subscriber in subscribers {
        if let Some(mut queue) = world.get_mut::<QueuedValues<T>>(subscriber) {
            queue.0.push(value.clone());
            live.push(subscriber);
        }
    }
    if let Some(mut data) = world.get_mut::<MutableData<T>>(entity) {
        data.subscribers = live;
    }
}

/// A reactive scalar: a container holding one value with change notification and an explicit
/// no-notify read ([`.read`](Mutable::read), i.e. a peek). [`.set`](Mutable::set) queues the new
/// value for broadcast to the [`Signal`] returned by [`.signal`](Mutable::signal), which replays
/// the current value to each fresh registration.
pub struct Mutable<T> {
    entity: Entity,
    references: Arc<AtomicUsize>,
    stale_queue: Arc<Mutex<Vec<Entity>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Mutable<T> {
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

impl<T> Drop for Mutable<T> {
    fn drop(&mut self) {
        if self.references.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            self.stale_queue.lock().unwrap().push(self.entity);
        }
    }
}

impl<T> Mutable<T>
where
    T: Clone + SSs,
{
    /// Spawns a [`Mutable`] holding `value`.
    pub fn new(world: &mut World, value: T) -> Self {
        world.init_resource::<StaleSourceQueue>();
        let stale_queue = world.resource::<StaleSourceQueue>().0.clone();
        let entity = world
            .spawn((
                MutableData {
                    value,
                    pending: None,
                    subscribers: Vec::new(),
                },
                SourceFlusher(Arc::new(|world, entity| flush_mutable_value::<T>(world, entity))),
            ))
            .id();
        Self {
            entity,
            references: Arc::new(AtomicUsize::new(1)),
            stale_queue,
            _marker: PhantomData,
        }
    }

    /// Reads the current value without involving the signal graph (a peek).
    pub fn read<'s>(&self, mutable_data_reader: impl ReadMutableData<'s, T>) -> &'s T {
        &mutable_data_reader.read(self.entity).value
    }

    /// Replaces the current value, staging it for delivery to subscribers at the top of the next
    /// tick. Only the latest of multiple [`.set`](Mutable::set)s within one tick is delivered.
    pub fn set<'w>(&self, mutable_data_writer: impl WriteMutableData<'w, T>, value: T) {
        let mut data = mutable_data_writer.write(self.entity);
        data.value = value.clone();
        data.pending = Some(value);
    }

    /// Returns a [`Source`] signal from this [`Mutable`] which emits the current value on first
    /// propagation after registration and then on every [`.set`](Mutable::set).
    pub fn signal(&self) -> Source<T> {
        let signal = LazySignal::new(clone!((self => self_) move |world: &mut World| {
            // deliver anything already staged before snapshotting the current value
            flush_mutable_value::<T>(world, self_.entity);
            let source_entity = LazyEntity::new();
            let source_system = clone!((source_entity) move |_: In<()>, mut queues: Query<&mut QueuedValues<T>>| {
                let mut queue = queues.get_mut(source_entity.get()).ok()?;
                if queue.0.is_empty() {
                    None
                } else {
                    queue.0.drain(..).last()
                }
            });
            let signal = register_signal::<(), T, _, _, _>(world, source_system);
            source_entity.set(*signal);
            let current = world.get::<MutableData<T>>(self_.entity).map(|data| data.value.clone());
            world.entity_mut(*signal).insert(QueuedValues(current.into_iter().collect::<Vec<_>>()));
            if let Some(mut data) = world.get_mut::<MutableData<T>>(self_.entity) {
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

/// Specifies read accessors for [`Mutable`]s.
pub trait ReadMutableData<'s, T>
where
    T: SSs,
{
    #[allow(missing_docs)]
    fn read(self, entity: Entity) -> &'s MutableData<T>;
}

impl<'s, T> ReadMutableData<'s, T> for &'s Query<'_, 's, &MutableData<T>>
where
    T: SSs,
{
    fn read(self, entity: Entity) -> &'s MutableData<T> {
        self.get(entity).unwrap()
    }
}

impl<'s, T> ReadMutableData<'s, T> for &'s World
where
    T: SSs,
{
    fn read(self, entity: Entity) -> &'s MutableData<T> {
        self.get(entity).unwrap()
    }
}

/// Specifies write accessors for [`Mutable`]s.
pub trait WriteMutableData<'w, T>
where
    T: SSs,
{
    #[allow(missing_docs)]
    fn write(self, entity: Entity) -> Mut<'w, MutableData<T>>;
}

impl<'a, 'w, 's, T> WriteMutableData<'a, T> for &'a mut Query<'w, 's, &mut MutableData<T>>
where
    T: SSs,
{
    fn write(self, entity: Entity) -> Mut<'a, MutableData<T>> {
        self.get_mut(entity).unwrap()
    }
}

impl<'w, T> WriteMutableData<'w, T> for &'w mut World
where
    T: SSs,
{
    fn write(self, entity: Entity) -> Mut<'w, MutableData<T>> {
        self.get_mut(entity).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProjoPlugin;
    use bevy::prelude::*;
    use test_log::test;

    #[derive(Resource, Default, Debug)]
    struct SignalOutput<T: SSs + Clone + core::fmt::Debug>(Vec<T>);

    fn capture_output<T>(In(value): In<T>, mut output: ResMut<SignalOutput<T>>)
    where
        T: SSs + Clone + core::fmt::Debug,
    {
        output.0.push(value);
    }

    fn create_test_app() -> App {
        let mut app = App::new();
        app.add_plugins((MinimalPlugins, ProjoPlugin));
        app
    }

    fn drain_output<T: SSs + Clone + core::fmt::Debug>(world: &mut World) -> Vec<T> {
        core::mem::take(&mut world.resource_mut::<SignalOutput<T>>().0)
    }

    #[test]
    fn test_mutable_replay_and_set() {
        let mut app = create_test_app();
        app.init_resource::<SignalOutput<i32>>();

        let value = Mutable::new(app.world_mut(), 7);
        let handle = value.signal().map(capture_output::<i32>).register(app.world_mut());

        // registration replays the current value
        app.update();
        assert_eq!(drain_output::<i32>(app.world_mut()), vec![7]);

        // a quiet tick emits nothing
        app.update();
        assert_eq!(drain_output::<i32>(app.world_mut()), Vec::<i32>::new());

        value.set(app.world_mut(), 11);
        app.update();
        assert_eq!(drain_output::<i32>(app.world_mut()), vec![11]);
        assert_eq!(*value.read(&*app.world()), 11);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_stale_reaping_is_world_local() {
        let mut first = create_test_app();
        let mut second = create_test_app();

        // both worlds allocate their source at the same point, so the entity ids coincide
        let first_value = Mutable::new(first.world_mut(), 1);
        let second_value = Mutable::new(second.world_mut(), 2);
        drop(first_value);

        second.update();
        second_value.set(second.world_mut(), 3);
        assert_eq!(*second_value.read(&*second.world()), 3);

        first.update();
        second.update();
        assert_eq!(*second_value.read(&*second.world()), 3);
    }

    #[test]
    fn test_dedupe_suppresses_same_value() {
        let mut app = create_test_app();
        app.init_resource::<SignalOutput<i32>>();

        let value = Mutable::new(app.world_mut(), 1);
        let handle = value
            .signal()
            .dedupe()
            .map(capture_output::<i32>)
            .register(app.world_mut());

        app.update();
        assert_eq!(drain_output::<i32>(app.world_mut()), vec![1]);

        // setting the same value notifies the graph but dedupe swallows it
        value.set(app.world_mut(), 1);
        app.update();
        assert_eq!(drain_output::<i32>(app.world_mut()), Vec::<i32>::new());

        value.set(app.world_mut(), 2);
        app.update();
        assert_eq!(drain_output::<i32>(app.world_mut()), vec![2]);

        handle.cleanup(app.world_mut());
    }

    #[test]
    fn test_map_chain_and_first() {
        let mut app = create_test_app();
        app.init_resource::<SignalOutput<String>>();

        let value = Mutable::new(app.world_mut(), 3);
        let handle = value
            .signal()
            .map_in(|x: i32| x * 2)
            .first()
            .map_in(|x: i32| x.to_string())
            .map(capture_output::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(drain_output::<String>(app.world_mut()), vec!["6".to_string()]);

        // first() terminates propagation for every later emission
        value.set(app.world_mut(), 10);
        app.update();
        assert_eq!(drain_output::<String>(app.world_mut()), Vec::<String>::new());

        handle.cleanup(app.world_mut());
    }
}
