use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// Shared mutable state for the single-threaded runtime; every connection
/// task holds a clone.
pub struct WrappedRcRefCell<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    pub fn wrap(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(value)),
        }
    }

    pub fn get(&self) -> Ref<T> {
        self.inner.borrow()
    }

    pub fn get_mut(&self) -> RefMut<T> {
        self.inner.borrow_mut()
    }
}

impl<T> Clone for WrappedRcRefCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
