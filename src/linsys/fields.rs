//! Field data container with a configurable memory layout.
//!
//! Holds `nprop` real properties for each of `nunk` unknowns (mesh nodes).
//! The layout is chosen at construction: unknown-major stores all
//! properties of one unknown contiguously, equation-major stores one
//! property for all unknowns contiguously. Hot loops that sweep unknowns
//! for a fixed component use the split-address pair [`Fields::cptr`] /
//! [`Fields::var`] so the component offset is resolved once.

/// Memory layout of a [`Fields`] container.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// `data[unknown * nprop + prop]`
    UnknownMajor,
    /// `data[prop * nunk + unknown]`
    EquationMajor,
}

/// Pre-resolved property address for [`Fields::var`].
#[derive(Copy, Clone, Debug)]
pub struct FieldHandle(usize);

/// Dense real-valued field storage over unknowns and properties.
#[derive(Clone, Debug, PartialEq)]
pub struct Fields {
    layout: Layout,
    nunk: usize,
    nprop: usize,
    data: Vec<f64>,
}

impl Fields {
    /// Zero-initialized container.
    pub fn new(layout: Layout, nunk: usize, nprop: usize) -> Self {
        Self {
            layout,
            nunk,
            nprop,
            data: vec![0.0; nunk * nprop],
        }
    }

    pub fn nunk(&self) -> usize {
        self.nunk
    }

    pub fn nprop(&self) -> usize {
        self.nprop
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    fn index(&self, unknown: usize, prop: usize) -> usize {
        debug_assert!(unknown < self.nunk && prop < self.nprop);
        match self.layout {
            Layout::UnknownMajor => unknown * self.nprop + prop,
            Layout::EquationMajor => prop * self.nunk + unknown,
        }
    }

    /// Value of property `component + offset` at `unknown`.
    #[inline]
    pub fn get(&self, unknown: usize, component: usize, offset: usize) -> f64 {
        self.data[self.index(unknown, component + offset)]
    }

    /// Mutable value of property `component + offset` at `unknown`.
    #[inline]
    pub fn get_mut(&mut self, unknown: usize, component: usize, offset: usize) -> &mut f64 {
        let i = self.index(unknown, component + offset);
        &mut self.data[i]
    }

    /// Resolve a property address once; pair with [`Fields::var`] in loops
    /// over unknowns.
    #[inline]
    pub fn cptr(&self, component: usize, offset: usize) -> FieldHandle {
        FieldHandle(component + offset)
    }

    /// Value at a pre-resolved property address.
    #[inline]
    pub fn var(&self, handle: FieldHandle, unknown: usize) -> f64 {
        self.data[self.index(unknown, handle.0)]
    }

    /// Mutable value at a pre-resolved property address.
    #[inline]
    pub fn var_mut(&mut self, handle: FieldHandle, unknown: usize) -> &mut f64 {
        let i = self.index(unknown, handle.0);
        &mut self.data[i]
    }

    /// All properties of one unknown, in property order (copies; the
    /// equation-major layout is strided).
    pub fn unknown(&self, unknown: usize) -> Vec<f64> {
        (0..self.nprop)
            .map(|p| self.data[self.index(unknown, p)])
            .collect()
    }

    /// Flatten to unknown-major order, the form the contribution calls
    /// consume.
    pub fn flatten(&self) -> Vec<f64> {
        match self.layout {
            Layout::UnknownMajor => self.data.clone(),
            Layout::EquationMajor => {
                let mut out = Vec::with_capacity(self.data.len());
                for u in 0..self.nunk {
                    for p in 0..self.nprop {
                        out.push(self.data[p * self.nunk + u]);
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_layouts_agree_through_the_accessor() {
        let mut um = Fields::new(Layout::UnknownMajor, 3, 2);
        let mut em = Fields::new(Layout::EquationMajor, 3, 2);
        for u in 0..3 {
            for p in 0..2 {
                let v = (u * 10 + p) as f64;
                *um.get_mut(u, p, 0) = v;
                *em.get_mut(u, p, 0) = v;
            }
        }
        for u in 0..3 {
            for p in 0..2 {
                assert_eq!(um.get(u, p, 0), em.get(u, p, 0));
            }
        }
        assert_eq!(um.flatten(), em.flatten());
    }

    #[test]
    fn split_address_matches_direct_access() {
        let mut f = Fields::new(Layout::EquationMajor, 4, 3);
        for u in 0..4 {
            *f.get_mut(u, 1, 1) = u as f64 + 0.5;
        }
        let h = f.cptr(1, 1);
        for u in 0..4 {
            assert_eq!(f.var(h, u), f.get(u, 1, 1));
        }
    }

    #[test]
    fn unknown_extraction_is_layout_independent() {
        let mut f = Fields::new(Layout::EquationMajor, 2, 3);
        for p in 0..3 {
            *f.get_mut(1, p, 0) = p as f64;
        }
        assert_eq!(f.unknown(1), vec![0.0, 1.0, 2.0]);
        assert_eq!(f.unknown(0), vec![0.0, 0.0, 0.0]);
    }
}
