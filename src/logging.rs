// macros only; no direct imports needed

#[macro_export]
macro_rules! wf_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(run_id = %$ctx.run_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! wf_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(run_id = %$ctx.run_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! wf_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(run_id = %$ctx.run_id(), $($arg)+);
        }
    }};
}
