/// One of the eight orientations of the dihedral group used for test-time
/// augmentation. Variants 4..8 swap width and height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transform {
    Identity,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Transpose,
    Rotate90,
    Transverse,
    Rotate270,
}

impl Transform {
    pub const ALL: [Transform; 8] = [
        Self::Identity,
        Self::FlipHorizontal,
        Self::Rotate180,
        Self::FlipVertical,
        Self::Transpose,
        Self::Rotate90,
        Self::Transverse,
        Self::Rotate270,
    ];

    pub fn swaps_axes(self) -> bool {
        matches!(
            self,
            Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270
        )
    }

    /// Extent of the variant of a `width x height` region.
    pub fn extent(self, width: usize, height: usize) -> (usize, usize) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Where pixel `(x, y)` of a `w x h` region lands in this variant.
    #[inline]
    pub fn apply(self, x: usize, y: usize, w: usize, h: usize) -> (usize, usize) {
        match self {
            Self::Identity => (x, y),
            Self::FlipHorizontal => (w - 1 - x, y),
            Self::Rotate180 => (w - 1 - x, h - 1 - y),
            Self::FlipVertical => (x, h - 1 - y),
            Self::Transpose => (y, x),
            Self::Rotate90 => (h - 1 - y, x),
            Self::Transverse => (h - 1 - y, w - 1 - x),
            Self::Rotate270 => (y, w - 1 - x),
        }
    }
}
