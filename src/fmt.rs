//! Internal logging macros. With the `defmt` feature these forward to the
//! defmt transport; without it they compile to nothing, which keeps host
//! test builds free of a global-logger requirement.

#![allow(unused_macros)]

macro_rules! trace {
    ($($arg:expr),* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::trace!($($arg),*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($(&$arg),*);
    }};
}

macro_rules! debug {
    ($($arg:expr),* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::debug!($($arg),*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($(&$arg),*);
    }};
}

macro_rules! warn {
    ($($arg:expr),* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::warn!($($arg),*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($(&$arg),*);
    }};
}

macro_rules! error {
    ($($arg:expr),* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::error!($($arg),*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($(&$arg),*);
    }};
}
