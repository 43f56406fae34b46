macro_rules! impl_from_str {
    ($ty:ty) => {
        impl std::str::FromStr for $ty {
            type Err = $crate::parse::ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                use nom::Finish;

                let src = bytesstr::BytesStr::from(s);

                <$ty as $crate::parse::Parse>::parse(src.as_ref())(src.as_str())
                    .finish()
                    .map(|(_, this)| this)
                    .map_err(|_| $crate::parse::ParseError(stringify!($ty)))
            }
        }
    };
}
