/// Formats an integer as zero-padded hexadecimal, padded to the width of
/// its type.
pub(crate) fn fmt_hex<T>(f: &mut ::std::fmt::Formatter, value: T) -> ::std::fmt::Result
where
    T: Copy + ::std::fmt::LowerHex,
{
    let width = 2 * size_of::<T>();
    write!(f, "0x{value:0width$x}")
}

/// Declares a guest address newtype.
///
/// Offsets and masks are plain integers (`pa + 8`, `va & !0xfff`), the
/// result keeps the address type. Both `{}` and `{:?}` print the full
/// zero-padded width so that log lines stay aligned.
macro_rules! guest_address {
    ($name:ident, $type:ty, $doc:expr) => {
        #[doc = concat!("A ", $doc, ".")]
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        pub struct $name(pub $type);

        impl $name {
            /// Checks whether the address is zero.
            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl From<$type> for $name {
            fn from(value: $type) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $type {
            fn from(value: $name) -> $type {
                value.0
            }
        }

        $crate::core::macros::guest_address!(@op $name, $type, Add, add, +);
        $crate::core::macros::guest_address!(@op $name, $type, Sub, sub, -);
        $crate::core::macros::guest_address!(@op $name, $type, BitAnd, bitand, &);

        $crate::core::macros::guest_address!(@fmt $name, Debug);
        $crate::core::macros::guest_address!(@fmt $name, Display);

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };

    (@op $name:ident, $type:ty, $trait:ident, $method:ident, $op:tt) => {
        impl ::std::ops::$trait<$type> for $name {
            type Output = $name;

            fn $method(self, rhs: $type) -> $name {
                $name(self.0 $op rhs)
            }
        }
    };

    (@fmt $name:ident, $trait:ident) => {
        impl ::std::fmt::$trait for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                $crate::core::macros::fmt_hex(f, self.0)
            }
        }
    };
}

pub(crate) use guest_address;
