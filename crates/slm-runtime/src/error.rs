pub use slm_types::{AdapterError, Result};
