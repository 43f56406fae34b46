use std::ops::{Deref, DerefMut};

/// Mutable access to a value that the accessor may take ownership of.
///
/// Handed to [`Layer::receive`](crate::Layer::receive) so a layer can either
/// inspect the request and leave it for the next layer, or claim it entirely.
pub struct MayClaim<'v, T> {
    value: &'v mut Option<T>,
}

impl<'v, T> MayClaim<'v, T> {
    pub fn new(value: &'v mut Option<T>) -> Self {
        Self { value }
    }

    /// Take ownership of the value
    pub fn claim(self) -> T {
        self.value.take().expect("MayClaim constructed over None")
    }

    /// Borrow the inner option, allowing conditional claiming
    pub fn inner(&mut self) -> &mut Option<T> {
        self.value
    }
}

impl<T> Deref for MayClaim<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("MayClaim constructed over None")
    }
}

impl<T> DerefMut for MayClaim<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("MayClaim constructed over None")
    }
}
