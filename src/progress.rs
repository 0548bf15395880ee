//! Progress reporting
//!
//! A single callback type shared by every long-running operation (flashing,
//! erasing, OTA transfer) instead of a global progress-bar singleton. The
//! CLI wires an `indicatif` bar into this closure; library callers can do
//! whatever they like, including nothing.

/// Called with `(done, total)` bytes as an operation progresses. `total` is
/// `0` when the size isn't known ahead of time.
pub type ProgressCallback = Box<dyn FnMut(u64, u64) + Send>;
