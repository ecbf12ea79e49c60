//! # Termshare Protocol Library
//!
//! Wire contract shared between the termshare daemon, the per-user backend
//! ("user server") it launches, and the supervising process it notifies.
//!
//! ## Overview
//!
//! - **Sentinel markers**: the strings a user server prints to report that it
//!   started or failed ([`flags`])
//! - **Supervisor events**: newline-delimited JSON notifications ([`events`])
//! - **Session views**: the serializable, handle-free snapshot shape ([`views`])
//! - **Errors**: encoding failures ([`error`])
//!
//! ## Example Usage
//!
//! ```rust
//! use termshare_protocol::{StartupSignal, SupervisorEvent, UserServerFlags};
//!
//! let flags = UserServerFlags::default();
//! let output = flags.error_line("port already in use");
//! assert_eq!(
//!     flags.scan(&output),
//!     Some(StartupSignal::Failed("port already in use".to_string()))
//! );
//!
//! let event = SupervisorEvent::RemoveUser {
//!     sid: "sid".to_string(),
//!     username: "alice".to_string(),
//! };
//! assert!(event.to_json_line().unwrap().ends_with('\n'));
//! ```

pub mod error;
pub mod events;
pub mod flags;
pub mod views;

pub use error::{ProtocolError, Result};
pub use events::SupervisorEvent;
pub use flags::{StartupSignal, UserServerFlags, ERR_FLAG_END, ERR_FLAG_START, START_FLAG};
pub use views::{Metadata, RegistrySnapshot, SessionView, UserView, PTY_KEY, USER_MAP_KEY};
