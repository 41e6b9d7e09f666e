pub mod logging;
pub mod path_resolver;
pub mod retry;
pub mod validation;
