use super::macros::fmt_hex;

/// Displays a value, or a sequence of bytes, in hexadecimal.
///
/// # Examples
///
/// ```
/// # use vmi_core::Hex;
/// assert_eq!(format!("{}", Hex(42u16)), "0x002a");
/// assert_eq!(format!("{}", Hex(&[0x55u8, 0xcc][..])), "[0x55, 0xcc]");
/// ```
pub struct Hex<T>(pub T);

macro_rules! impl_hex {
    ($($type:ty),*) => {
        $(
            impl std::fmt::Display for Hex<$type> {
                fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    fmt_hex(f, self.0)
                }
            }

            impl std::fmt::Debug for Hex<$type> {
                fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    fmt_hex(f, self.0)
                }
            }
        )*
    };
}

impl_hex!(u8, u16, u32, u64, usize);

impl std::fmt::Display for Hex<&[u8]> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("[")?;

        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }

            fmt_hex(f, *byte)?;
        }

        f.write_str("]")
    }
}

impl std::fmt::Debug for Hex<&[u8]> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
