use serde::{Deserialize, Serialize};

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    pub const INVALID: Handle = Handle(u64::MAX);

    const OWNER_SHIFT: u32 = 32;

    /// Packs the id of the owning context with a sequence number local to that owner.
    #[inline]
    pub const fn compose(owner: u32, seq: u32) -> Self {
        Handle(((owner as u64) << Self::OWNER_SHIFT) | seq as u64)
    }

    #[inline]
    pub const fn owner_id(&self) -> u32 {
        (self.0 >> Self::OWNER_SHIFT) as u32
    }

    #[inline]
    pub const fn seq(&self) -> u32 {
        self.0 as u32
    }

    /// The handle of the owner itself, i.e., the same owner id with a zero sequence number.
    #[inline]
    pub const fn owner(&self) -> Handle {
        Handle::compose(self.owner_id(), 0)
    }
}

pub trait AsHandle {
    #[must_use]
    fn as_handle(&self) -> Handle;
}

impl AsHandle for Handle {
    #[inline]
    fn as_handle(&self) -> Handle {
        *self
    }
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::size_of;
    const_assert_eq!(size_of::<Handle>(), size_of::<u64>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_and_split() {
        let h = Handle::compose(7, 42);
        assert_eq!(h.owner_id(), 7);
        assert_eq!(h.seq(), 42);
        assert_eq!(h.owner(), Handle::compose(7, 0));
        assert_eq!(h.owner().owner(), h.owner());
    }

    #[test]
    fn owner_is_distinct_from_objects() {
        let ctx = Handle::compose(3, 0);
        let pd = Handle::compose(3, 1);
        assert_ne!(ctx, pd);
        assert_eq!(pd.owner(), ctx);
        assert_ne!(Handle::compose(4, 1).owner(), ctx);
    }
}
