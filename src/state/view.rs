// Views and scopes
//
// A transition can be requested for the whole resource, an explicit range, a single
// subresource, or "whatever this view touches". Views are a closed set of kinds, each
// knowing which mips / slices / planes it covers.

use super::subresource::{Subresource, SubresourceLayout, SubresourceRange};

/// "Everything from the base onwards" for counts in view descriptions.
pub const REMAINING: u32 = u32::MAX;

/// Description of a view onto a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDesc {
    /// Sampled read of a mip chain.
    ShaderResource {
        most_detailed_mip: u32,
        mip_levels: u32,
        first_array_slice: u32,
        array_size: u32,
        plane_slice: u32,
    },
    /// Color attachment: one mip, a run of slices, one plane.
    RenderTarget {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
        plane_slice: u32,
    },
    /// Depth-stencil attachment: one mip, a run of slices, every plane.
    DepthStencil {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
    },
    /// Storage read/write: one mip, a run of slices, one plane.
    UnorderedAccess {
        mip_slice: u32,
        first_array_slice: u32,
        array_size: u32,
        plane_slice: u32,
    },
    /// Buffer bound as constants.
    ConstantBuffer,
}

impl ViewDesc {
    /// Shader-resource view over the whole mip chain of every slice.
    pub const fn whole_texture() -> Self {
        Self::ShaderResource {
            most_detailed_mip: 0,
            mip_levels: REMAINING,
            first_array_slice: 0,
            array_size: REMAINING,
            plane_slice: 0,
        }
    }

    /// Render-target view of one mip of slice 0.
    pub const fn render_target(mip_slice: u32) -> Self {
        Self::RenderTarget {
            mip_slice,
            first_array_slice: 0,
            array_size: 1,
            plane_slice: 0,
        }
    }

    /// The subresources this view touches, or `None` if the view doesn't fit the
    /// resource.
    pub fn subresource_range(&self, layout: &SubresourceLayout) -> Option<SubresourceRange> {
        let range = match *self {
            ViewDesc::ShaderResource {
                most_detailed_mip,
                mip_levels,
                first_array_slice,
                array_size,
                plane_slice,
            } => SubresourceRange {
                base_mip: most_detailed_mip,
                mip_count: mip_levels,
                base_array: first_array_slice,
                array_count: array_size,
                base_plane: plane_slice,
                plane_count: 1,
            },
            ViewDesc::RenderTarget {
                mip_slice,
                first_array_slice,
                array_size,
                plane_slice,
            }
            | ViewDesc::UnorderedAccess {
                mip_slice,
                first_array_slice,
                array_size,
                plane_slice,
            } => SubresourceRange {
                base_mip: mip_slice,
                mip_count: 1,
                base_array: first_array_slice,
                array_count: array_size,
                base_plane: plane_slice,
                plane_count: 1,
            },
            ViewDesc::DepthStencil {
                mip_slice,
                first_array_slice,
                array_size,
            } => SubresourceRange {
                base_mip: mip_slice,
                mip_count: 1,
                base_array: first_array_slice,
                array_count: array_size,
                base_plane: 0,
                plane_count: REMAINING,
            },
            ViewDesc::ConstantBuffer => SubresourceRange::single(Subresource::default()),
        };
        range.fit(layout)
    }
}

/// Which subresources a state request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Range(SubresourceRange),
    Subresource(Subresource),
    View(ViewDesc),
}

impl Scope {
    /// The concrete box this scope names. `None` if it is empty or reaches past the
    /// end of the resource; nothing is ever clipped.
    pub fn resolve(&self, layout: &SubresourceLayout) -> Option<SubresourceRange> {
        match self {
            Scope::All => Some(layout.full_range()),
            Scope::Range(range) => range.fit(layout),
            Scope::Subresource(sub) => SubresourceRange::single(*sub).fit(layout),
            Scope::View(view) => view.subresource_range(layout),
        }
    }
}

/// A missing view means the whole resource.
impl From<Option<ViewDesc>> for Scope {
    fn from(view: Option<ViewDesc>) -> Self {
        view.map_or(Scope::All, Scope::View)
    }
}

impl From<ViewDesc> for Scope {
    fn from(view: ViewDesc) -> Self {
        Scope::View(view)
    }
}

impl From<Subresource> for Scope {
    fn from(sub: Subresource) -> Self {
        Scope::Subresource(sub)
    }
}

impl From<SubresourceRange> for Scope {
    fn from(range: SubresourceRange) -> Self {
        Scope::Range(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_view_is_all() {
        let layout = SubresourceLayout::new(4, 2, 1);
        let scope: Scope = None.into();
        assert_eq!(scope, Scope::All);
        assert!(scope.resolve(&layout).unwrap().covers(&layout));
    }

    #[test]
    fn test_srv_mip_tail() {
        let layout = SubresourceLayout::new(5, 1, 1);
        let view = ViewDesc::ShaderResource {
            most_detailed_mip: 2,
            mip_levels: REMAINING,
            first_array_slice: 0,
            array_size: 1,
            plane_slice: 0,
        };
        let range = view.subresource_range(&layout).unwrap();
        assert_eq!((range.base_mip, range.mip_count), (2, 3));
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_dsv_covers_both_planes() {
        let layout = SubresourceLayout::new(1, 1, 2);
        let view = ViewDesc::DepthStencil {
            mip_slice: 0,
            first_array_slice: 0,
            array_size: 1,
        };
        assert!(view.subresource_range(&layout).unwrap().covers(&layout));
    }

    #[test]
    fn test_rtv_and_uav_single_mip() {
        let layout = SubresourceLayout::new(3, 4, 1);
        let rtv = ViewDesc::render_target(1).subresource_range(&layout).unwrap();
        assert_eq!(rtv.len(), 1);
        assert_eq!(rtv.base_mip, 1);

        let uav = ViewDesc::UnorderedAccess {
            mip_slice: 2,
            first_array_slice: 1,
            array_size: REMAINING,
            plane_slice: 0,
        }
        .subresource_range(&layout)
        .unwrap();
        assert_eq!((uav.base_array, uav.array_count), (1, 3));
    }

    #[test]
    fn test_cbv_is_whole_buffer() {
        let range = ViewDesc::ConstantBuffer.subresource_range(&SubresourceLayout::BUFFER);
        assert!(range.unwrap().covers(&SubresourceLayout::BUFFER));
    }

    #[test]
    fn test_views_past_the_end_do_not_resolve() {
        let layout = SubresourceLayout::new(2, 1, 1);
        assert_eq!(ViewDesc::render_target(7).subresource_range(&layout), None);
        assert_eq!(Scope::Subresource(Subresource::new(5, 0, 0)).resolve(&layout), None);

        let srv = ViewDesc::ShaderResource {
            most_detailed_mip: 1,
            mip_levels: 4,
            first_array_slice: 0,
            array_size: 1,
            plane_slice: 0,
        };
        assert_eq!(srv.subresource_range(&layout), None);
    }
}
