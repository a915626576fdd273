pub mod compose;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod logging;
pub mod promote_config;
pub mod publish;
pub mod retry;
pub mod revision;
pub mod submit;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
