//! Logging shim.
//!
//! Every level macro routes through `__emit!`, which picks `log` when that
//! feature is on, `defmt` otherwise, and swallows the arguments when neither
//! backend is compiled in. Format strings must therefore stay within the
//! subset both backends accept (`{}`, `{:?}`, `{:#x}`).

#![macro_use]
#![allow(unused_macros)]

macro_rules! __emit {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            cfg_if::cfg_if! {
                if #[cfg(feature = "log")] {
                    ::log::$level!($s $(, $x)*);
                } else if #[cfg(feature = "defmt")] {
                    ::defmt::$level!($s $(, $x)*);
                } else {
                    let _ = ($( & $x ),*);
                }
            }
        }
    };
}

macro_rules! trace {
    ($($t:tt)*) => {
        __emit!(trace, $($t)*)
    };
}

macro_rules! debug {
    ($($t:tt)*) => {
        __emit!(debug, $($t)*)
    };
}

macro_rules! info {
    ($($t:tt)*) => {
        __emit!(info, $($t)*)
    };
}

macro_rules! warn {
    ($($t:tt)*) => {
        __emit!(warn, $($t)*)
    };
}

macro_rules! error {
    ($($t:tt)*) => {
        __emit!(error, $($t)*)
    };
}
