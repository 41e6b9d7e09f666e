// Startup orchestration
//
// Phased startup (data -> application -> edge), the health monitor that decides readiness, and
// the compensating rollback applied when startup fails.

pub mod health;
pub mod rollback;
pub mod startup;
