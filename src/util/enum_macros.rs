/// Generates an enum backed by a fixed-width wire code.
///
/// Named variants convert to and from their code; every other code is
/// carried losslessly in an `Other` variant, so decoding never fails and
/// re-encoding reproduces the original octets. This fits wire fields like
/// BVLL result codes where the standard names a handful of values but
/// peers may legitimately send others.
///
/// # Arguments
///
/// * `$name:ident($unit:ident)` - The enum name and its underlying integer
///   type (e.g. `u8`, `u16`).
/// * `$variant:ident = $value:expr` - The named variants and their codes.
///
/// # Example
///
/// ```rust
/// use bacnet_bip::wire_code_enum;
///
/// wire_code_enum! {
///     /// Demo codes.
///     Demo(u16) {
///         /// Everything worked.
///         Success = 0x0000,
///         Failure = 0x0001,
///     }
/// }
///
/// assert_eq!(u16::from(Demo::Success), 0x0000);
/// assert_eq!(Demo::from(0x0001u16), Demo::Failure);
/// let other = Demo::from(0xBEEFu16);
/// assert_eq!(u16::from(other), 0xBEEF);
/// ```
#[macro_export]
macro_rules! wire_code_enum {
    ($(#[$doc:meta])* $name:ident($unit:ident) { $($(#[$vdoc:meta])* $variant:ident = $value:expr,)+ }) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($(#[$vdoc])* $variant,)+
                /// A code this implementation does not name.
                Other([<$name Value>]),
            }

            /// Carrier for codes without a named variant.
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] {
                value: $unit,
            }

            impl [<$name Value>] {
                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)+
                        $name::Other(value) => write!(f, "Other(0x{:04X})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)+
                        $name::Other(value) => value.value,
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)+
                        v => $name::Other([<$name Value>] { value: v }),
                    }
                }
            }
        }
    };
}
