// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use mycelium_bitfield::{bitfield, enum_from_bits};

bitfield! {
    /// The packed representation of an object's refcount owner, stored in
    /// an atomic word in the object header.
    #[derive(Eq, PartialEq)]
    pub(crate) struct OwnerWord<u64> {
        /// What kind of owner the object currently has.
        const KIND: OwnerKind;
        /// The owning thread's id, meaningful only when `KIND` is
        /// [`OwnerKind::Thread`].
        const THREAD = ..;
    }
}

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    pub(crate) enum OwnerKind<u8> {
        /// Owned by one thread, which mutates the refcount without
        /// synchronization.
        Thread = 0b00,
        /// Statically initialized and never refcounted yet; the first
        /// toucher claims ownership.
        StaticInit = 0b01,
        /// Shared: every refcount change goes through the per-thread
        /// asynchronous tables.
        Async = 0b10,
        /// The object has been deallocated; any refcount operation is a
        /// fault.
        Deleted = 0b11,
    }
}

/// Decoded owner state. See [`OwnerKind`] for the meaning of each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Thread(u64),
    StaticInit,
    Async,
    Deleted,
}

// === impl Owner ===

impl Owner {
    pub(crate) fn encode(self) -> u64 {
        match self {
            Owner::Thread(id) => {
                debug_assert!(id < 1 << 62, "thread id exceeds the owner word");
                OwnerWord::new()
                    .with(OwnerWord::KIND, OwnerKind::Thread)
                    .with(OwnerWord::THREAD, id)
                    .0
            }
            Owner::StaticInit => OwnerWord::new()
                .with(OwnerWord::KIND, OwnerKind::StaticInit)
                .0,
            Owner::Async => OwnerWord::new().with(OwnerWord::KIND, OwnerKind::Async).0,
            Owner::Deleted => OwnerWord::new()
                .with(OwnerWord::KIND, OwnerKind::Deleted)
                .0,
        }
    }

    pub(crate) fn decode(bits: u64) -> Self {
        let word = OwnerWord::from_bits(bits);
        match word.get(OwnerWord::KIND) {
            OwnerKind::Thread => Owner::Thread(word.get(OwnerWord::THREAD)),
            OwnerKind::StaticInit => Owner::StaticInit,
            OwnerKind::Async => Owner::Async,
            OwnerKind::Deleted => Owner::Deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for owner in [
            Owner::Thread(1),
            Owner::Thread(0x3fff_ffff_ffff_ffff),
            Owner::StaticInit,
            Owner::Async,
            Owner::Deleted,
        ] {
            assert_eq!(Owner::decode(owner.encode()), owner);
        }
    }

    #[test]
    fn thread_ids_are_disjoint_from_sentinels() {
        let a = Owner::Thread(7).encode();
        assert_ne!(a, Owner::StaticInit.encode());
        assert_ne!(a, Owner::Async.encode());
        assert_ne!(a, Owner::Deleted.encode());
        assert_ne!(Owner::Thread(7).encode(), Owner::Thread(8).encode());
    }
}
