#![doc = include_str!("../README.md")]
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

use bevy_app::prelude::*;
use bevy_ecs::prelude::*;

pub mod graph;
pub mod group;
pub mod signal;
pub mod signal_vec;
#[allow(missing_docs)]
pub mod utils;

/// Includes the systems required for [projo](crate) to function.
#[derive(Default)]
pub struct ProjoPlugin;

impl Plugin for ProjoPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<graph::SignalCleanupQueue>()
            .init_resource::<graph::StaleSourceQueue>()
            .add_systems(
                Last,
                (
                    graph::flush_pending_sources,
                    graph::process_signal_graph,
                    graph::flush_cleanup_signals,
                    graph::despawn_stale_sources,
                )
                    .chain(),
            );
    }
}

/// `use projo::prelude::*;` imports everything one needs to use start using [projo](crate).
pub mod prelude {
    pub use crate::{
        ProjoPlugin,
        graph::{SignalHandle, SignalHandles},
        group::{Group, GroupKey},
        signal::{Mutable, Signal, SignalBuilder, SignalExt},
        signal_vec::{ArrayDiff, MutableVec, MutableVecBuilder, SignalVec, SignalVecExt},
        utils::{LazyEntity, clone},
    };
    #[doc(no_inline)]
    pub use apply::{Also, Apply};
}
