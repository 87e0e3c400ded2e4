//! Logging hooks (feature: `tracing`).
//!
//! The macros expand to nothing unless the feature is enabled, so pool hot
//! paths pay nothing for logging in lean builds.

#[cfg(feature = "tracing")]
macro_rules! debug_event {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_event {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! warn_event {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_event {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_event;
pub(crate) use warn_event;
