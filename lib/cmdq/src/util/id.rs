// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Define a newtype for a kind of run-time identifier.  These are handed out
// from a per-type counter as adapters and devices are created within a
// process, and carry no meaning beyond it: they identify items in log output
// and USDT probes.  Bus ids, unit numbers and path ids, which are assigned by
// the transport, are tracked separately.
//
// The macro takes syntax matching the newtype definition so that grepping for
// `struct DeviceId` finds the invocation.
macro_rules! define_id {
    {
        $(#[$meta_items:meta])*
        pub struct $id_name:ident($visibility:vis u32);
    } => {
        $(#[$meta_items])*
        pub struct $id_name($visibility u32);

        impl $id_name {
            pub const INVALID: $id_name = $id_name(u32::MAX);
            pub fn new() -> Self {
                static NEXT: ::std::sync::atomic::AtomicU32 =
                    ::std::sync::atomic::AtomicU32::new(0);

                let id = NEXT.fetch_add(
                    1,
                    ::std::sync::atomic::Ordering::Relaxed
                );
                $id_name(id)
            }
        }
        impl ::std::fmt::Display for $id_name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    }
}

define_id! {
    /// Distinguishes adapter instances within the process.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct AdapterId(pub(crate) u32);
}

define_id! {
    /// Distinguishes device queues within the process, independent of which
    /// adapter they are attached to.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DeviceId(pub(crate) u32);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = DeviceId::new();
        let b = DeviceId::new();
        assert_ne!(a, b);
        assert_ne!(a, DeviceId::INVALID);
        assert_eq!(format!("{}", DeviceId(12)), "12");
    }
}
