//! Services built on the runtime.
//!
//! Each service is a session factory handed to a `Server`:
//! - `echo`: one loopback channel per connection
//! - `proxy`: two opposite channels between the client and an upstream
//! - `postgres`: a proxy that also decodes client frames and logs queries

pub mod echo;
pub mod postgres;
pub mod proxy;
