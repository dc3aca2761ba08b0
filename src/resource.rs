// Resource identity
//
// The tracker never touches GPU memory. It only needs to know which resource it is
// talking about, how its subresources are laid out, and the raw backend handle so the
// recorded barriers can be lowered to real API calls.

use std::fmt;

use crate::state::SubresourceLayout;

/// Session-unique identifier of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture {
        /// Plane 0 is depth and plane 1 (if present) is stencil.
        depth_stencil: bool,
    },
}

/// Everything the tracker and the barrier lowering need to know about a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub name: String,
    pub kind: ResourceKind,
    pub layout: SubresourceLayout,
    /// Backend handle (`vk::Image` / `vk::Buffer` as raw u64, or a simulated id).
    pub raw: u64,
}

impl ResourceDesc {
    pub fn buffer(name: impl Into<String>, raw: u64) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Buffer,
            layout: SubresourceLayout::BUFFER,
            raw,
        }
    }

    pub fn texture(name: impl Into<String>, layout: SubresourceLayout, raw: u64) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Texture { depth_stencil: false },
            layout,
            raw,
        }
    }

    pub fn depth_stencil(name: impl Into<String>, mip_levels: u32, array_size: u32, raw: u64) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Texture { depth_stencil: true },
            layout: SubresourceLayout::new(mip_levels, array_size, 2),
            raw,
        }
    }

    /// Depth without stencil: a single depth plane.
    pub fn depth(name: impl Into<String>, mip_levels: u32, array_size: u32, raw: u64) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Texture { depth_stencil: true },
            layout: SubresourceLayout::new(mip_levels, array_size, 1),
            raw,
        }
    }
}
