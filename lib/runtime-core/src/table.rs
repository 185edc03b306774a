//! Table instances. A table lives in its compartment's indexed vector; each
//! element cell stores the callee's canonical signature next to its function
//! so indirect calls can check the signature before dispatching.

use crate::{
    compartment::{Compartment, TableId},
    error::{CreationError, GrowError},
    object::Function,
    types::{FuncSig, TableType},
};
use std::sync::{Arc, RwLock};

/// An occupied table element: the canonical signature and the function.
#[derive(Clone)]
pub struct Anyfunc {
    /// The canonical signature of the element.
    pub signature: Arc<FuncSig>,
    /// The callable function object.
    pub function: Arc<Function>,
}

/// A table instance.
pub struct Table {
    ty: TableType,
    id: TableId,
    compartment_id: u64,
    elements: RwLock<Vec<Option<Anyfunc>>>,
}

/// Error type indicating why a table access failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableAccessError {
    /// The index wasn't valid, so no element could be accessed.
    IndexError,
}

impl Table {
    /// Creates a table of `ty.minimum` null elements inside the compartment
    /// and registers it under a stable id.
    pub fn new(compartment: &Arc<Compartment>, ty: TableType) -> Result<Arc<Table>, CreationError> {
        if let Some(max) = ty.maximum {
            if max < ty.minimum {
                return Err(CreationError::InvalidDescriptor(
                    "Max table size is less than the minimum size".to_string(),
                ));
            }
        }

        let mut inner = compartment.lock();
        let id = TableId(inner.tables.len());
        let table = Arc::new(Table {
            ty,
            id,
            compartment_id: compartment.id(),
            elements: RwLock::new(vec![None; ty.minimum as usize]),
        });
        inner.tables.push(Arc::clone(&table));
        Ok(table)
    }

    /// The descriptor this table was created from.
    pub fn ty(&self) -> TableType {
        self.ty
    }

    /// The table's stable id within its compartment.
    pub fn id(&self) -> TableId {
        self.id
    }

    /// The id of the owning compartment.
    pub fn compartment_id(&self) -> u64 {
        self.compartment_id
    }

    /// The current size of this table.
    pub fn size(&self) -> u32 {
        self.elements.read().expect("table poisoned").len() as u32
    }

    /// Gets the element at `index`; `Ok(None)` is a null element.
    pub fn get(&self, index: u32) -> Result<Option<Anyfunc>, TableAccessError> {
        let elements = self.elements.read().expect("table poisoned");
        elements
            .get(index as usize)
            .cloned()
            .ok_or(TableAccessError::IndexError)
    }

    /// Sets the element at `index`, returning the previous element.
    pub fn set(
        &self,
        index: u32,
        element: Option<Anyfunc>,
    ) -> Result<Option<Anyfunc>, TableAccessError> {
        let mut elements = self.elements.write().expect("table poisoned");
        let slot = elements
            .get_mut(index as usize)
            .ok_or(TableAccessError::IndexError)?;
        Ok(std::mem::replace(slot, element))
    }

    /// Grows this table by `delta` null elements, returning the previous
    /// size.
    pub fn grow(&self, delta: u32) -> Result<u32, GrowError> {
        let mut elements = self.elements.write().expect("table poisoned");
        let previous = elements.len() as u32;
        if delta == 0 {
            return Ok(previous);
        }
        let new_size = previous
            .checked_add(delta)
            .ok_or(GrowError::TableGrowError)?;
        if let Some(max) = self.ty.maximum {
            if new_size > max {
                return Err(GrowError::TableGrowError);
            }
        }
        elements.resize(new_size as usize, None);
        Ok(previous)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("ty", &self.ty)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;
    use crate::types::ElementType;

    fn table(min: u32, max: Option<u32>) -> Arc<Table> {
        let compartment = Compartment::new();
        Table::new(
            &compartment,
            TableType {
                element: ElementType::Anyfunc,
                minimum: min,
                maximum: max,
            },
        )
        .unwrap()
    }

    #[test]
    fn initial_elements_are_null() {
        let t = table(10, Some(20));
        assert_eq!(t.size(), 10);
        assert!(t.get(3).unwrap().is_none());
        assert!(matches!(t.get(10), Err(TableAccessError::IndexError)));
    }

    #[test]
    fn grow_is_bounded_by_the_maximum() {
        let t = table(1, Some(2));
        assert_eq!(t.grow(1).unwrap(), 1);
        assert!(t.grow(1).is_err());
        assert_eq!(t.size(), 2);
    }
}
