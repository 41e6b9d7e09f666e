// Caller-facing entry points: the install pipeline, the read-only status view, and progress
// reporting shared by both.

pub mod installer;
pub mod progress;
pub mod status;
