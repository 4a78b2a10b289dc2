use std::collections::HashMap;

use nalgebra::DVector;

use crate::variables::{VarValue, VariableMetadata};

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    name: String,
    offset: usize,
    size: usize,
    shape: Vec<usize>,
}

/// Name-indexed buffer. All variables share one contiguous `DVector<f64>`;
/// each name maps to a slot (offset, size, shape) inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableVector {
    data: DVector<f64>,
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl VariableVector {
    /// Build a vector keyed by relative names and filled with the declared
    /// initial values.
    pub fn from_metadata<'a, I>(vars: I) -> Self
    where
        I: IntoIterator<Item = &'a VariableMetadata>,
    {
        let mut slots = Vec::new();
        let mut values = Vec::new();
        for meta in vars {
            slots.push(Slot {
                name: meta.relative_name.clone(),
                offset: values.len(),
                size: meta.size(),
                shape: meta.shape.clone(),
            });
            values.extend_from_slice(meta.value.as_slice());
        }
        Self::from_parts(slots, DVector::from_vec(values))
    }

    /// Same layout as `from_metadata`, all entries zero.
    pub fn zeros<'a, I>(vars: I) -> Self
    where
        I: IntoIterator<Item = &'a VariableMetadata>,
    {
        let mut vector = Self::from_metadata(vars);
        vector.data.fill(0.0);
        vector
    }

    fn from_parts(slots: Vec<Slot>, data: DVector<f64>) -> Self {
        let index = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.name.clone(), i))
            .collect();
        Self { data, slots, index }
    }

    fn slot(&self, name: &str) -> Option<&Slot> {
        self.index.get(name).map(|&i| &self.slots[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Variable names in layout order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.name.as_str())
    }

    /// Total number of scalars.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size_of(&self, name: &str) -> Option<usize> {
        self.slot(name).map(|slot| slot.size)
    }

    pub fn shape_of(&self, name: &str) -> Option<&[usize]> {
        self.slot(name).map(|slot| slot.shape.as_slice())
    }

    /// Position of the variable's first scalar in the backing buffer.
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.slot(name).map(|slot| slot.offset)
    }

    /// Flattened view of one variable.
    pub fn flat(&self, name: &str) -> Option<&[f64]> {
        let slot = self.slot(name)?;
        Some(&self.data.as_slice()[slot.offset..slot.offset + slot.size])
    }

    pub fn flat_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        let (offset, size) = self.slot(name).map(|slot| (slot.offset, slot.size))?;
        Some(&mut self.data.as_mut_slice()[offset..offset + size])
    }

    /// First scalar of a variable; convenient for size-1 variables.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.flat(name).and_then(|values| values.first().copied())
    }

    /// Overwrite a variable. Returns `false` when the name is unknown or the
    /// length does not match.
    pub fn set(&mut self, name: &str, values: &[f64]) -> bool {
        match self.flat_mut(name) {
            Some(target) if target.len() == values.len() => {
                target.copy_from_slice(values);
                true
            }
            _ => false,
        }
    }

    /// Current value in the shape it was declared with.
    pub fn value(&self, name: &str) -> Option<VarValue> {
        let slot = self.slot(name)?;
        let values = self.flat(name)?;
        if slot.shape.is_empty() || slot.shape == [1] {
            Some(VarValue::Scalar(values[0]))
        } else {
            Some(VarValue::Array(values.to_vec()))
        }
    }

    pub fn as_vector(&self) -> &DVector<f64> {
        &self.data
    }

    pub fn as_vector_mut(&mut self) -> &mut DVector<f64> {
        &mut self.data
    }

    pub fn same_layout(&self, other: &VariableVector) -> bool {
        self.slots == other.slots
    }
}

/// The three vectors a component evaluates against.
#[derive(Debug, Clone, PartialEq)]
pub struct Vectors {
    pub params: VariableVector,
    pub unknowns: VariableVector,
    pub resids: VariableVector,
}
