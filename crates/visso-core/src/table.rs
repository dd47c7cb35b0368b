//! Arena storage for per-parameter, per-component state
//!
//! A Gaussian-mixture posterior keeps one tensor per (parameter, component)
//! pair: means, mixture weights, curvature inverses, responsibilities.
//! [`ComponentTable`] stores them in one flat vector, parameter-major, so a
//! lookup is a single multiply-add and all components of a parameter are a
//! contiguous slice.
//!
//! ```
//! use visso_core::table::ComponentTable;
//!
//! let table = ComponentTable::from_fn(2, 3, |p, k| p * 10 + k);
//! assert_eq!(*table.get(1, 2), 12);
//! assert_eq!(table.components(0), &[0, 1, 2]);
//! ```

use crate::error::{Result, ShapeError};

/// Fixed-size `num_params × num_components` table
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentTable<X> {
    num_params: usize,
    num_components: usize,
    entries: Vec<X>,
}

impl<X> ComponentTable<X> {
    /// Build a table by evaluating `f(param_index, component_index)`
    pub fn from_fn<F>(num_params: usize, num_components: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> X,
    {
        let mut entries = Vec::with_capacity(num_params * num_components);
        for p in 0..num_params {
            for k in 0..num_components {
                entries.push(f(p, k));
            }
        }
        Self {
            num_params,
            num_components,
            entries,
        }
    }

    /// Wrap an existing parameter-major vector
    pub fn from_vec(num_params: usize, num_components: usize, entries: Vec<X>) -> Result<Self> {
        if entries.len() != num_params * num_components {
            return Err(ShapeError::Length {
                expected: num_params * num_components,
                got: entries.len(),
            }
            .into());
        }
        Ok(Self {
            num_params,
            num_components,
            entries,
        })
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    #[inline]
    fn offset(&self, param: usize, component: usize) -> usize {
        assert!(
            param < self.num_params && component < self.num_components,
            "component table index ({param}, {component}) out of bounds ({}, {})",
            self.num_params,
            self.num_components
        );
        param * self.num_components + component
    }

    /// Entry for `(param, component)`
    ///
    /// # Panics
    ///
    /// Panics when either index is out of bounds.
    pub fn get(&self, param: usize, component: usize) -> &X {
        &self.entries[self.offset(param, component)]
    }

    /// Mutable entry for `(param, component)`
    ///
    /// # Panics
    ///
    /// Panics when either index is out of bounds.
    pub fn get_mut(&mut self, param: usize, component: usize) -> &mut X {
        let idx = self.offset(param, component);
        &mut self.entries[idx]
    }

    /// All components of one parameter
    pub fn components(&self, param: usize) -> &[X] {
        let start = param * self.num_components;
        &self.entries[start..start + self.num_components]
    }

    /// All components of one parameter, mutably
    pub fn components_mut(&mut self, param: usize) -> &mut [X] {
        let start = param * self.num_components;
        &mut self.entries[start..start + self.num_components]
    }

    /// Iterate `((param, component), entry)` in storage order
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &X)> {
        let k = self.num_components.max(1);
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, x)| ((i / k, i % k), x))
    }

    /// Iterate mutably in storage order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = ((usize, usize), &mut X)> {
        let k = self.num_components.max(1);
        self.entries
            .iter_mut()
            .enumerate()
            .map(move |(i, x)| ((i / k, i % k), x))
    }

    /// Plain slice of all entries
    pub fn as_slice(&self) -> &[X] {
        &self.entries
    }

    /// Mutable slice of all entries
    pub fn as_mut_slice(&mut self) -> &mut [X] {
        &mut self.entries
    }

    /// Map every entry into a new table of the same layout
    pub fn map<Y, F>(&self, mut f: F) -> ComponentTable<Y>
    where
        F: FnMut((usize, usize), &X) -> Y,
    {
        ComponentTable {
            num_params: self.num_params,
            num_components: self.num_components,
            entries: self.iter().map(|(idx, x)| f(idx, x)).collect(),
        }
    }

    /// Fallible variant of [`ComponentTable::map`]
    pub fn try_map<Y, E, F>(&self, mut f: F) -> std::result::Result<ComponentTable<Y>, E>
    where
        F: FnMut((usize, usize), &X) -> std::result::Result<Y, E>,
    {
        let entries = self
            .iter()
            .map(|(idx, x)| f(idx, x))
            .collect::<std::result::Result<Vec<_>, E>>()?;
        Ok(ComponentTable {
            num_params: self.num_params,
            num_components: self.num_components,
            entries,
        })
    }

    /// Check that another table has the same layout
    pub fn check_layout<Y>(&self, other: &ComponentTable<Y>) -> Result<()> {
        if self.num_params != other.num_params || self.num_components != other.num_components {
            return Err(ShapeError::Tensor {
                expected: vec![self.num_params, self.num_components],
                got: vec![other.num_params, other.num_components],
            }
            .into());
        }
        Ok(())
    }
}
