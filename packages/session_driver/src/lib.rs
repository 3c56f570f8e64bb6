//! Session Driver - interactive terminal sessions behind one interface
//!
//! A [`Session`] is either a process on this machine attached to a PTY or a
//! fresh Docker container with a TTY. Both expose the same operations: read
//! output, write input, resize, wait for exit and close.
//!
//! # Example
//!
//! ```no_run
//! use session_driver::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SessionConfig {
//!         init_command: "uname -a".to_string(),
//!         ..Default::default()
//!     };
//!     let session = Session::connect(config).await.unwrap();
//!
//!     let mut buf = [0u8; 4096];
//!     while let Ok(n) = session.read(&mut buf).await {
//!         if n == 0 {
//!             break;
//!         }
//!         print!("{}", String::from_utf8_lossy(&buf[..n]));
//!     }
//!
//!     session.wait().await.unwrap();
//!     session.close().await.unwrap();
//! }
//! ```

mod config;
mod container;
mod error;
mod host;
mod session;

pub use config::{DEFAULT_IMAGE, DEFAULT_SHELL, Driver, SessionConfig};
pub use container::ContainerSession;
pub use error::SessionError;
pub use host::HostSession;
pub use session::Session;
