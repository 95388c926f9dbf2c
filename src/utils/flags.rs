//! Helper macro for compact bit-flag set newtypes.

/// Declares a `Copy` newtype over an unsigned integer that behaves as a set
/// of named bit flags and is serializable for on-wire use.
///
/// Example:
/// ```no_compile
/// flag_set! {
///     /// Flags of something.
///     pub struct MyFlags: u32 {
///         const A = 1 << 0;
///         const B = 1 << 1;
///     }
/// }
/// ```
#[macro_export]
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $val:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug,
            PartialEq,
            Eq,
            Hash,
            Clone,
            Copy,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name($repr);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: $name = $name($val);
            )*

            /// Empty flag set.
            #[inline]
            pub const fn empty() -> Self {
                $name(0)
            }

            /// Raw bits value.
            #[inline]
            pub fn bits(&self) -> $repr {
                self.0
            }

            /// Is the set empty?
            #[inline]
            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            /// Are all flags of `other` set?
            #[inline]
            pub fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Is any flag of `other` set?
            #[inline]
            pub fn intersects(&self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Sets all flags of `other`.
            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clears all flags of `other`.
            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }

        impl get_size::GetSize for $name {}
    };
}
