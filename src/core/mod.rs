/*!
 * Engine-wide sizing and retry plumbing
 */

pub mod concurrency;
pub mod handles;
pub mod retry;

pub use concurrency::{ConcurrencyResolver, ConcurrencySettings};
pub use handles::{resolve_max_file_and_socket_handles, HandleLimit, HandleLimitSource};
pub use retry::{new_read_log_fn, ReadLogFn};
