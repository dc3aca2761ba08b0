// Usage states
//
// What the hardware is currently doing with a subresource. Single bits are the
// primitive usages; read-only bits may be OR'ed together into one compatible state
// (e.g. a depth buffer that is both depth-tested and sampled).

use std::fmt;

bitflags::bitflags! {
    /// Hardware usage state of one subresource.
    ///
    /// The empty set is `COMMON`: no particular usage, valid as a starting point for
    /// any transition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsageState: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        const INDIRECT_ARGUMENT = 1 << 8;
        const COPY_DEST = 1 << 9;
        const COPY_SOURCE = 1 << 10;
        const PRESENT = 1 << 11;
    }
}

impl UsageState {
    /// No particular usage.
    pub const COMMON: Self = Self::empty();

    /// Sampled from any shader stage.
    pub const ALL_SHADER_RESOURCE: Self =
        Self::NON_PIXEL_SHADER_RESOURCE.union(Self::PIXEL_SHADER_RESOURCE);

    /// Every read-only usage at once.
    pub const GENERIC_READ: Self = Self::VERTEX_AND_CONSTANT_BUFFER
        .union(Self::INDEX_BUFFER)
        .union(Self::NON_PIXEL_SHADER_RESOURCE)
        .union(Self::PIXEL_SHADER_RESOURCE)
        .union(Self::INDIRECT_ARGUMENT)
        .union(Self::COPY_SOURCE);

    const READ_ONLY: Self = Self::GENERIC_READ
        .union(Self::DEPTH_READ)
        .union(Self::PRESENT);

    /// True if no bit of this state lets the GPU write.
    pub fn is_read_only(self) -> bool {
        Self::READ_ONLY.contains(self)
    }

    /// True if at least one bit lets the GPU write.
    pub fn is_write(self) -> bool {
        !self.is_read_only()
    }
}

impl Default for UsageState {
    fn default() -> Self {
        Self::COMMON
    }
}

impl fmt::Display for UsageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("COMMON");
        }
        if *self == Self::GENERIC_READ {
            return f.write_str("GENERIC_READ");
        }

        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }

        // Bits without a name (should never happen through the public API)
        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{:#x}", unknown)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_is_default_and_named() {
        assert_eq!(UsageState::default(), UsageState::COMMON);
        assert_eq!(UsageState::COMMON.to_string(), "COMMON");
    }

    #[test]
    fn test_display_joins_bits() {
        let state = UsageState::DEPTH_READ | UsageState::PIXEL_SHADER_RESOURCE;
        assert_eq!(state.to_string(), "DEPTH_READ|PIXEL_SHADER_RESOURCE");
        assert_eq!(UsageState::RENDER_TARGET.to_string(), "RENDER_TARGET");
        assert_eq!(UsageState::GENERIC_READ.to_string(), "GENERIC_READ");
    }

    #[test]
    fn test_read_only_classification() {
        assert!(UsageState::ALL_SHADER_RESOURCE.is_read_only());
        assert!(UsageState::GENERIC_READ.is_read_only());
        assert!(UsageState::COMMON.is_read_only());
        assert!(UsageState::RENDER_TARGET.is_write());
        assert!((UsageState::COPY_SOURCE | UsageState::COPY_DEST).is_write());
    }
}
