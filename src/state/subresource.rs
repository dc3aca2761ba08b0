// Subresources
//
// A resource is split into mip levels × array slices × planes. Each of those cells
// carries its own usage state, flattened into one table in the canonical order
// `mip + array * mips + plane * mips * arrays`.

use std::fmt;

use super::usage::UsageState;
use super::view::REMAINING;

/// One individually-stateful slice of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Subresource {
    pub mip: u32,
    pub array: u32,
    pub plane: u32,
}

impl Subresource {
    pub const fn new(mip: u32, array: u32, plane: u32) -> Self {
        Self { mip, array, plane }
    }
}

impl fmt::Display for Subresource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mip {} / array {} / plane {}", self.mip, self.array, self.plane)
    }
}

/// Shape of a resource's subresource table. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceLayout {
    pub mip_levels: u32,
    pub array_size: u32,
    pub plane_count: u32,
}

impl SubresourceLayout {
    /// Buffers have exactly one subresource.
    pub const BUFFER: Self = Self::new(1, 1, 1);

    pub const fn new(mip_levels: u32, array_size: u32, plane_count: u32) -> Self {
        Self {
            mip_levels,
            array_size,
            plane_count,
        }
    }

    pub fn count(&self) -> u32 {
        self.mip_levels * self.array_size * self.plane_count
    }

    /// Panics if `sub` is not part of the resource: a wrapped index would silently
    /// alias some other subresource.
    pub fn index_of(&self, sub: Subresource) -> u32 {
        assert!(self.contains(sub), "{} outside {:?}", sub, self);
        sub.mip + sub.array * self.mip_levels + sub.plane * self.mip_levels * self.array_size
    }

    pub fn decompose(&self, index: u32) -> Subresource {
        debug_assert!(index < self.count());
        let mip = index % self.mip_levels;
        let array = (index / self.mip_levels) % self.array_size;
        let plane = index / (self.mip_levels * self.array_size);
        Subresource::new(mip, array, plane)
    }

    pub fn contains(&self, sub: Subresource) -> bool {
        sub.mip < self.mip_levels && sub.array < self.array_size && sub.plane < self.plane_count
    }

    /// The range covering every subresource.
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange {
            base_mip: 0,
            mip_count: self.mip_levels,
            base_array: 0,
            array_count: self.array_size,
            base_plane: 0,
            plane_count: self.plane_count,
        }
    }
}

/// A box of subresources: contiguous mips × contiguous slices × contiguous planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_array: u32,
    pub array_count: u32,
    pub base_plane: u32,
    pub plane_count: u32,
}

impl SubresourceRange {
    /// The range containing a single subresource.
    pub fn single(sub: Subresource) -> Self {
        Self {
            base_mip: sub.mip,
            mip_count: 1,
            base_array: sub.array,
            array_count: 1,
            base_plane: sub.plane,
            plane_count: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mip_count == 0 || self.array_count == 0 || self.plane_count == 0
    }

    pub fn len(&self) -> u32 {
        self.mip_count * self.array_count * self.plane_count
    }

    /// Resolve `REMAINING` counts against `layout`. `None` if the range is empty or
    /// any part of it lies outside the resource.
    pub fn fit(&self, layout: &SubresourceLayout) -> Option<Self> {
        fn axis(base: u32, count: u32, limit: u32) -> Option<u32> {
            let available = limit.checked_sub(base).filter(|n| *n > 0)?;
            match count {
                REMAINING => Some(available),
                0 => None,
                count => (count <= available).then_some(count),
            }
        }
        Some(Self {
            base_mip: self.base_mip,
            mip_count: axis(self.base_mip, self.mip_count, layout.mip_levels)?,
            base_array: self.base_array,
            array_count: axis(self.base_array, self.array_count, layout.array_size)?,
            base_plane: self.base_plane,
            plane_count: axis(self.base_plane, self.plane_count, layout.plane_count)?,
        })
    }

    pub fn covers(&self, layout: &SubresourceLayout) -> bool {
        *self == layout.full_range()
    }

    /// Flat table indices of every subresource in the range, in table order.
    pub fn indices<'a>(&'a self, layout: &'a SubresourceLayout) -> impl Iterator<Item = u32> + 'a {
        let planes = self.base_plane..self.base_plane + self.plane_count;
        planes.flat_map(move |plane| {
            (self.base_array..self.base_array + self.array_count).flat_map(move |array| {
                (self.base_mip..self.base_mip + self.mip_count)
                    .map(move |mip| layout.index_of(Subresource::new(mip, array, plane)))
            })
        })
    }
}

/// Per-subresource entry of the state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubresourceState {
    pub state: UsageState,
    pub lock_count: u32,
    /// Set by the first transition out of the creation state. Until then the
    /// contents are undefined, whatever `state` says.
    pub initialized: bool,
}

impl SubresourceState {
    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }
}

/// The per-resource state table.
#[derive(Debug, Clone)]
pub struct SubresourceTable {
    layout: SubresourceLayout,
    entries: Vec<SubresourceState>,
}

impl SubresourceTable {
    pub fn new(layout: SubresourceLayout, initial: UsageState) -> Self {
        // A resource created straight into a real usage already has defined contents
        let entry = SubresourceState {
            state: initial,
            lock_count: 0,
            initialized: !initial.is_empty(),
        };
        Self {
            layout,
            entries: vec![entry; layout.count() as usize],
        }
    }

    pub fn layout(&self) -> &SubresourceLayout {
        &self.layout
    }

    pub fn get(&self, index: u32) -> &SubresourceState {
        &self.entries[index as usize]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut SubresourceState {
        &mut self.entries[index as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubresourceState> {
        self.entries.iter()
    }
}
