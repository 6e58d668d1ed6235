#[macro_use]
pub mod macros;
pub mod log_setup;
pub mod parallel;

pub const EPSILON: f64 = 1e-6;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
