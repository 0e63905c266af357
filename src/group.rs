//! Key to ordered-member-list indexing for the grouping view, see
//! [`.group_by`](super::signal_vec::SignalVecExt::group_by).
//!
//! Keys bucket at their [`canonical`](GroupKey::canonical) string but membership within a bucket is
//! decided by [`PartialEq`] on the original key, so two distinct keys that canonicalize identically
//! remain distinguishable.

use super::{signal_vec::sorted_insert_position, utils::*};
use alloc::string::ToString;
use bevy_ecs::{prelude::*, system::SystemId};
use bevy_platform::{collections::HashMap, prelude::*};
use core::cmp::Ordering;

/// A grouping key: cloneable, comparable, and canonicalizable to a [`String`] for bucketing.
///
/// Implemented for the primitive integer types, `bool`, `char`, [`String`], and `&'static str`;
/// user types implement [`canonical`](GroupKey::canonical) directly to override how they bucket.
pub trait GroupKey: Clone + PartialEq + SSs {
    /// The bucketing form of this key.
    fn canonical(&self) -> String;
}

macro_rules! impl_group_key {
    ($($t:ty),* $(,)?) => {
        $(
            impl GroupKey for $t {
                fn canonical(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_group_key!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char);

impl GroupKey for String {
    fn canonical(&self) -> String {
        self.clone()
    }
}

impl GroupKey for &'static str {
    fn canonical(&self) -> String {
        (*self).to_string()
    }
}

/// One partition of the grouping view: its key and its ordered member values. This is the output
/// item type of [`.group_by`](super::signal_vec::SignalVecExt::group_by).
#[derive(Clone, PartialEq, Debug)]
pub struct Group<K, V> {
    /// The grouping key shared by every member.
    pub key: K,
    /// Member values, ordered by the view's [`MemberOrder`].
    pub members: Vec<V>,
}

/// A member slot within a [`GroupEntry`]: the value plus the source position it currently
/// occupies, kept fresh by [`GroupIndex::shift_source_indices`].
#[derive(Clone, Debug)]
pub struct GroupMember<V> {
    #[allow(missing_docs)]
    pub source_index: usize,
    #[allow(missing_docs)]
    pub value: V,
}

/// A live group inside a [`GroupIndex`].
#[derive(Debug)]
pub struct GroupEntry<K, V> {
    key: K,
    members: Vec<GroupMember<V>>,
}

impl<K, V> GroupEntry<K, V> {
    #[allow(missing_docs)]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[allow(missing_docs)]
    pub fn members(&self) -> &[GroupMember<V>] {
        &self.members
    }
}

/// Where a new member lands within its group's member list.
pub enum MemberOrder<V: 'static> {
    /// Insert at position 0, most-recent-first. The default.
    Newest,
    /// Binary insert by the member's current source position, preserving source order within the
    /// group.
    SourceIndex,
    /// Binary insert by a caller-supplied comparator over member values.
    Comparator(SystemId<In<(V, V)>, Ordering>),
}

impl<V: 'static> Clone for MemberOrder<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V: 'static> Copy for MemberOrder<V> {}

impl<V: 'static> Default for MemberOrder<V> {
    fn default() -> Self {
        Self::Newest
    }
}

/// Result of a [`GroupIndex::put`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Put {
    /// Position of the member's group within the all-groups list.
    pub group_position: usize,
    /// Position of the member within its group.
    pub member_position: usize,
    /// Whether the group was created by this insertion.
    pub created: bool,
}

/// Result of a [`GroupIndex::remove`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Removal {
    /// Position the member's group occupied within the all-groups list at removal time.
    pub group_position: usize,
    /// Whether the removal emptied the group, dropping it from the index entirely.
    pub group_removed: bool,
}

/// Key to ordered-member-list index plus the insertion-ordered all-groups list the grouping view
/// projects. A group with zero members is never retained.
pub struct GroupIndex<K, V> {
    groups: Vec<GroupEntry<K, V>>,
    buckets: HashMap<String, Vec<usize>>,
}

impl<K, V> Default for GroupIndex<K, V> {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            buckets: HashMap::default(),
        }
    }
}

impl<K, V> GroupIndex<K, V>
where
    K: GroupKey,
    V: Clone + SSs,
{
    /// Position of `key`'s group within the all-groups list, if it exists.
    pub fn position(&self, key: &K) -> Option<usize> {
        self.buckets
            .get(&key.canonical())
            .and_then(|bucket| bucket.iter().copied().find(|&i| self.groups[i].key == *key))
    }

    /// The existing group for `key`, if any.
    pub fn get(&self, key: &K) -> Option<(usize, &GroupEntry<K, V>)> {
        self.position(key).map(|position| (position, &self.groups[position]))
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[allow(missing_docs)]
    pub fn groups(&self) -> impl Iterator<Item = &GroupEntry<K, V>> {
        self.groups.iter()
    }

    /// A cloned [`Group`] of the group at `group_position`.
    pub fn snapshot(&self, group_position: usize) -> Group<K, V> {
        let entry = &self.groups[group_position];
        Group {
            key: entry.key.clone(),
            members: entry.members.iter().map(|member| member.value.clone()).collect(),
        }
    }

    /// Inserts `member` into `key`'s group, creating the group (appended to the all-groups list)
    /// if absent; the member's position is chosen by `order`.
    pub fn put(&mut self, world: &mut World, key: K, member: GroupMember<V>, order: MemberOrder<V>) -> Put {
        let (group_position, created) = match self.position(&key) {
            Some(position) => (position, false),
            None => {
                let position = self.groups.len();
                self.groups.push(GroupEntry {
                    key: key.clone(),
                    members: Vec::new(),
                });
                self.buckets.entry(key.canonical()).or_default().push(position);
                (position, true)
            }
        };
        let members = &mut self.groups[group_position].members;
        let member_position = match order {
            MemberOrder::Newest => 0,
            MemberOrder::SourceIndex => {
                sorted_insert_position(members, &member, |a, b| a.source_index.cmp(&b.source_index))
            }
            MemberOrder::Comparator(comparator) => sorted_insert_position(members, &member, |a, b| {
                world
                    .run_system_with(comparator, (a.value.clone(), b.value.clone()))
                    .unwrap_or(Ordering::Equal)
            }),
        };
        members.insert(member_position, member);
        Put {
            group_position,
            member_position,
            created,
        }
    }

    /// Removes the member at `member_position` from `key`'s group, dropping the group from the
    /// index and the all-groups list if it empties. Returns [`None`] when `key` has no group or
    /// `member_position` is out of range.
    pub fn remove(&mut self, key: &K, member_position: usize) -> Option<Removal> {
        let group_position = self.position(key)?;
        let members = &mut self.groups[group_position].members;
        if member_position >= members.len() {
            return None;
        }
        members.remove(member_position);
        let group_removed = members.is_empty();
        if group_removed {
            self.groups.remove(group_position);
            let canonical = key.canonical();
            if let Some(bucket) = self.buckets.get_mut(&canonical) {
                bucket.retain(|&i| i != group_position);
                if bucket.is_empty() {
                    self.buckets.remove(&canonical);
                }
            }
            for bucket in self.buckets.values_mut() {
                for index in bucket.iter_mut() {
                    if *index > group_position {
                        *index -= 1;
                    }
                }
            }
        }
        Some(Removal {
            group_position,
            group_removed,
        })
    }

    /// Shifts the recorded source position of every member with `source_index >= start` by
    /// `delta`, keeping member bookkeeping in lockstep with structural shifts.
    pub fn shift_source_indices(&mut self, start: usize, delta: isize) {
        for group in &mut self.groups {
            for member in &mut group.members {
                if member.source_index >= start {
                    member.source_index = (member.source_index as isize + delta) as usize;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn member(source_index: usize, value: i32) -> GroupMember<i32> {
        GroupMember { source_index, value }
    }

    #[test]
    fn test_newest_is_default_and_prepends() {
        let mut world = World::new();
        let mut index = GroupIndex::<&'static str, i32>::default();

        let first = index.put(&mut world, "k", member(0, 1), MemberOrder::default());
        assert_eq!(
            first,
            Put {
                group_position: 0,
                member_position: 0,
                created: true
            }
        );

        let second = index.put(&mut world, "k", member(1, 2), MemberOrder::default());
        assert_eq!(
            second,
            Put {
                group_position: 0,
                member_position: 0,
                created: false
            }
        );
        assert_eq!(index.snapshot(0).members, vec![2, 1]);
    }

    #[test]
    fn test_source_index_order() {
        let mut world = World::new();
        let mut index = GroupIndex::<&'static str, i32>::default();

        index.put(&mut world, "k", member(0, 10), MemberOrder::SourceIndex);
        index.put(&mut world, "k", member(4, 50), MemberOrder::SourceIndex);
        let middle = index.put(&mut world, "k", member(2, 30), MemberOrder::SourceIndex);

        assert_eq!(middle.member_position, 1);
        assert_eq!(index.snapshot(0).members, vec![10, 30, 50]);
    }

    #[test]
    fn test_comparator_order() {
        let mut world = World::new();
        let comparator = world.register_system(|In((a, b)): In<(i32, i32)>| a.cmp(&b));
        let mut index = GroupIndex::<&'static str, i32>::default();

        // one order value reused across insertions
        let order = MemberOrder::Comparator(comparator);
        for (source_index, value) in [(0, 5), (1, 1), (2, 3)] {
            index.put(&mut world, "k", member(source_index, value), order);
        }
        assert_eq!(index.snapshot(0).members, vec![1, 3, 5]);
    }

    #[test]
    fn test_collision_bucket_distinguishes_keys() {
        #[derive(Clone, PartialEq, Debug)]
        struct Colliding(u8);

        impl GroupKey for Colliding {
            fn canonical(&self) -> String {
                "same".to_string()
            }
        }

        let mut world = World::new();
        let mut index = GroupIndex::<Colliding, i32>::default();

        index.put(&mut world, Colliding(1), member(0, 1), MemberOrder::SourceIndex);
        index.put(&mut world, Colliding(2), member(1, 2), MemberOrder::SourceIndex);

        assert_eq!(index.len(), 2);
        assert_eq!(index.position(&Colliding(1)), Some(0));
        assert_eq!(index.position(&Colliding(2)), Some(1));
        assert_eq!(index.snapshot(0).members, vec![1]);
        assert_eq!(index.snapshot(1).members, vec![2]);
    }

    #[test]
    fn test_empty_group_removed_and_positions_fixed() {
        let mut world = World::new();
        let mut index = GroupIndex::<&'static str, i32>::default();

        index.put(&mut world, "a", member(0, 1), MemberOrder::SourceIndex);
        index.put(&mut world, "b", member(1, 2), MemberOrder::SourceIndex);
        index.put(&mut world, "c", member(2, 3), MemberOrder::SourceIndex);

        let removal = index.remove(&"b", 0).unwrap();
        assert!(removal.group_removed);
        assert_eq!(removal.group_position, 1);

        assert_eq!(index.len(), 2);
        assert_eq!(index.position(&"a"), Some(0));
        assert_eq!(index.position(&"c"), Some(1));
        assert_eq!(index.position(&"b"), None);
    }

    #[test]
    fn test_remove_without_match_is_noop() {
        let mut world = World::new();
        let mut index = GroupIndex::<&'static str, i32>::default();
        index.put(&mut world, "a", member(0, 1), MemberOrder::SourceIndex);

        assert_eq!(index.remove(&"missing", 0), None);
        assert_eq!(index.remove(&"a", 5), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_shift_source_indices() {
        let mut world = World::new();
        let mut index = GroupIndex::<&'static str, i32>::default();
        index.put(&mut world, "a", member(0, 1), MemberOrder::SourceIndex);
        index.put(&mut world, "a", member(2, 3), MemberOrder::SourceIndex);

        index.shift_source_indices(1, 1);
        let sources: Vec<usize> = index.groups().next().unwrap().members().iter().map(|m| m.source_index).collect();
        assert_eq!(sources, vec![0, 3]);
    }
}
