/// Joins string literals into a single newline-terminated block at compile time.
#[macro_export]
macro_rules! lines {
    () => {
        ""
    };

    ($line:expr) => {
        concat!($line, "\n")
    };

    ($line:expr, $($tail:expr),* $(,)?) => {
        concat!(concat!($line, "\n"), $crate::lines!($($tail),*))
    };
}
