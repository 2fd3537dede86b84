//! Position of a node in scale and translation space.
use std::cmp::Ordering;
use std::fmt;

/// Index of a cell: the scale `n` and the translation `l`, covering `[l 2^-n, (l + 1) 2^-n)` along
/// each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex<const D: usize> {
    scale: i32,
    translation: [i32; D],
}

impl<const D: usize> NodeIndex<D> {
    /// Create an index.
    pub fn new(scale: i32, translation: [i32; D]) -> Self {
        Self { scale, translation }
    }

    /// The scale.
    pub fn scale(&self) -> i32 {
        self.scale
    }

    /// The translation.
    pub fn translation(&self) -> &[i32; D] {
        &self.translation
    }

    /// Index of the child in slot `child`; bit `d` of the slot selects the upper half along axis `d`.
    pub fn child(&self, child: usize) -> Self {
        assert!(child < 1 << D, "child index {child} out of range");
        Self {
            scale: self.scale + 1,
            translation: std::array::from_fn(|d| {
                2 * self.translation[d] + ((child >> d) & 1) as i32
            }),
        }
    }

    /// Index of the parent.
    pub fn parent(&self) -> Self {
        self.ancestor(self.scale - 1)
    }

    /// Index of the ancestor at `scale`.
    pub fn ancestor(&self, scale: i32) -> Self {
        assert!(
            scale <= self.scale,
            "ancestor at scale {scale} requested for {self}"
        );
        let shift = (self.scale - scale).min(31);
        Self {
            scale,
            translation: self.translation.map(|l| l >> shift),
        }
    }

    /// Slot of this index among the children of its parent.
    pub fn child_slot(&self) -> usize {
        (0..D).fold(0, |slot, d| slot | (((self.translation[d] & 1) as usize) << d))
    }

    /// Whether `other` is this index or lies below it.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.scale >= self.scale && other.ancestor(self.scale) == *self
    }

    /// Slot of the child on the path from this index down to `target`.
    pub fn child_slot_towards(&self, target: &Self) -> usize {
        assert!(
            target.scale > self.scale && self.is_ancestor_of(target),
            "{target} is not below {self}"
        );
        let bit = target.scale - self.scale - 1;
        (0..D).fold(0, |slot, d| {
            slot | ((((target.translation[d] >> bit) & 1) as usize) << d)
        })
    }

    /// Slot of the child whose cell holds the point `r`, which must lie in this cell.
    pub fn child_slot_at(&self, r: &[f64; D]) -> usize {
        let width = self.width();
        (0..D).fold(0, |slot, d| {
            if r[d] > width * (f64::from(self.translation[d]) + 0.5) {
                slot | (1 << d)
            } else {
                slot
            }
        })
    }

    /// Side length of the cell.
    pub fn width(&self) -> f64 {
        2f64.powi(-self.scale)
    }

    /// Lower corner of the cell.
    pub fn lower_bounds(&self) -> [f64; D] {
        let width = self.width();
        self.translation.map(|l| width * f64::from(l))
    }

    /// Upper corner of the cell.
    pub fn upper_bounds(&self) -> [f64; D] {
        let width = self.width();
        self.translation.map(|l| width * f64::from(l + 1))
    }

    /// Midpoint of the cell.
    pub fn center(&self) -> [f64; D] {
        let width = self.width();
        self.translation.map(|l| width * (f64::from(l) + 0.5))
    }

    /// Whether the point `r` lies in the half-open cell.
    pub fn contains(&self, r: &[f64; D]) -> bool {
        let lower = self.lower_bounds();
        let upper = self.upper_bounds();
        (0..D).all(|d| lower[d] <= r[d] && r[d] < upper[d])
    }
}

impl<const D: usize> Ord for NodeIndex<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scale
            .cmp(&other.scale)
            .then_with(|| self.translation.cmp(&other.translation))
    }
}

impl<const D: usize> PartialOrd for NodeIndex<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const D: usize> fmt::Display for NodeIndex<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ {} |", self.scale)?;
        for (d, l) in self.translation.iter().enumerate() {
            if d == 0 {
                write!(f, " {l}")?;
            } else {
                write!(f, ", {l}")?;
            }
        }
        write!(f, " ]")
    }
}
