// stderr may be closed when the launcher is started from Finder or launchd;
// `eprintln!` panics on write errors there, so failures are ignored instead.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
