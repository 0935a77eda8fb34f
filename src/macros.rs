/// Define an enum that has a well-known set of variants, plus an `Unknown`
/// catch-all for any other representable value.
///
/// Wire formats are full of small integer codes (ARP operation, IP protocol
/// number, ...) where most values are unused or reserved. Parsing such a
/// field into a bare integer loses the documentation value of an enum;
/// parsing it into a plain enum panics or errors on reserved values we'd
/// rather just pass through. This macro gives the best of both: a typed
/// enum for recognized values and `Unknown(repr)` for everything else.
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $( $( #[$variant_attr:meta] )* $variant:ident = $value:expr ),+
        }
    ) => {
        $( #[$enum_attr] )*
        #[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        pub enum $name {
            $( $( #[$variant_attr] )* $variant ),*,
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}
