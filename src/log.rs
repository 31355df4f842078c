/// Emits a `tracing` event when diagnostics are enabled.
///
/// `diag!(always, ..)` logs regardless of the policy toggle; any other first
/// argument is evaluated as the toggle. Compiles to nothing without the
/// `tracing` feature.
macro_rules! diag {
    (always, $level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        tracing::event!(tracing::Level::$level, $($arg)+);
    }};
    ($enabled:expr, $level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        {
            if $enabled {
                tracing::event!(tracing::Level::$level, $($arg)+);
            }
        }
    }};
}

pub(crate) use diag;
