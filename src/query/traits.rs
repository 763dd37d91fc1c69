//! Declarative properties attached to physical nodes.
//!
//! Traits are computed while a node is constructed and propagate upward from
//! its inputs. Rules and the scheduler read them; nothing mutates them.
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::value::ColumnDef;

/// Identity of a trait kind, used as lookup key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraitType {
    /// Output is bounded by a skip/limit pair.
    Limit,
    /// Output is ordered.
    Order,
    /// Operator buffers its whole input before emitting.
    Materialized,
    /// Subtree must not be split into partitions.
    NotPartitionable,
}

/// Sort direction of one column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Ascending => write!(f, "ASC"),
            SortOrder::Descending => write!(f, "DESC"),
        }
    }
}

/// `skip` rows are dropped, at most `limit` rows follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitTrait {
    /// Number of leading rows dropped.
    pub skip: u64,
    /// Maximum number of rows emitted after skipping.
    pub limit: u64,
}

/// Output is ordered by the given columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderTrait {
    /// Sort keys, most significant first.
    pub order: Vec<(ColumnDef, SortOrder)>,
}

/// Output is fully materialized before the first tuple is emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaterializedTrait;

/// The subtree cannot be partitioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotPartitionableTrait;

/// Closed set of traits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trait {
    /// See [`LimitTrait`].
    Limit(LimitTrait),
    /// See [`OrderTrait`].
    Order(OrderTrait),
    /// See [`MaterializedTrait`].
    Materialized(MaterializedTrait),
    /// See [`NotPartitionableTrait`].
    NotPartitionable(NotPartitionableTrait),
}

impl Trait {
    /// Kind of this trait.
    pub fn trait_type(&self) -> TraitType {
        match self {
            Trait::Limit(_) => TraitType::Limit,
            Trait::Order(_) => TraitType::Order,
            Trait::Materialized(_) => TraitType::Materialized,
            Trait::NotPartitionable(_) => TraitType::NotPartitionable,
        }
    }
}

/// Links a concrete trait struct to its [`TraitType`] for typed lookup.
pub trait TraitKind: Sized {
    /// Key of the trait kind.
    const TYPE: TraitType;

    /// Downcasts a [`Trait`] of the matching kind.
    fn from_trait(value: &Trait) -> Option<&Self>;
}

macro_rules! trait_kind {
    ($ty:ty, $variant:ident) => {
        impl TraitKind for $ty {
            const TYPE: TraitType = TraitType::$variant;

            fn from_trait(value: &Trait) -> Option<&Self> {
                match value {
                    Trait::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Trait {
            fn from(value: $ty) -> Self {
                Trait::$variant(value)
            }
        }
    };
}

trait_kind!(LimitTrait, Limit);
trait_kind!(OrderTrait, Order);
trait_kind!(MaterializedTrait, Materialized);
trait_kind!(NotPartitionableTrait, NotPartitionable);

/// Set of traits with at most one trait per [`TraitType`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraitSet {
    traits: SmallVec<[Trait; 4]>,
}

impl TraitSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the set with `value` added, replacing a trait of the same kind.
    pub fn with(mut self, value: impl Into<Trait>) -> Self {
        self.insert(value.into());
        self
    }

    /// Returns the set without traits of kind `ty`.
    pub fn without(mut self, ty: TraitType) -> Self {
        self.traits.retain(|t| t.trait_type() != ty);
        self
    }

    /// Adds `value`, replacing a trait of the same kind.
    pub fn insert(&mut self, value: Trait) {
        let ty = value.trait_type();
        match self.traits.iter_mut().find(|t| t.trait_type() == ty) {
            Some(slot) => *slot = value,
            None => self.traits.push(value),
        }
    }

    /// Untyped lookup by kind.
    pub fn get_type(&self, ty: TraitType) -> Option<&Trait> {
        self.traits.iter().find(|t| t.trait_type() == ty)
    }

    /// Typed lookup, absent-safe.
    pub fn get<T: TraitKind>(&self) -> Option<&T> {
        self.get_type(T::TYPE).and_then(T::from_trait)
    }

    /// Returns `true` when a trait of kind `ty` is present.
    pub fn has(&self, ty: TraitType) -> bool {
        self.get_type(ty).is_some()
    }

    /// Iterates the traits.
    pub fn iter(&self) -> impl Iterator<Item = &Trait> {
        self.traits.iter()
    }

    /// Number of traits in the set.
    pub fn len(&self) -> usize {
        self.traits.len()
    }

    /// Returns `true` when no trait is present.
    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }
}

/// Anything that exposes a trait set.
pub trait NodeWithTrait {
    /// Traits of this node, including those inherited from its inputs.
    fn traits(&self) -> TraitSet;

    /// Returns `true` when a trait of kind `ty` is present.
    fn has_trait(&self, ty: TraitType) -> bool {
        self.traits().has(ty)
    }

    /// Typed lookup of a trait.
    fn get_trait<T: TraitKind + Clone>(&self) -> Option<T> {
        self.traits().get::<T>().cloned()
    }
}
