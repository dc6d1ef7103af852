//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, layer stack per pipeline)
//!     → [instrumentation stamps request, binds context]
//!     → handlers.rs (health, echo or relay)
//!     → [instrumentation stamps response]
//!     → Send to client
//! ```

pub mod handlers;
pub mod server;

pub use handlers::{AppState, EchoReply, RelayClient};
pub use server::{HttpServer, ServerError};
