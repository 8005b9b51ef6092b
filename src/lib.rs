//! epochrt
//!
//! A runtime for fine-grained task graphs. Every task, event, data object and
//! task template is named by a [`Guid`]; tasks declare dependency slots that
//! are satisfied by events or data objects, and run exactly once when the last
//! slot resolves. Finish tasks additionally wait for every task transitively
//! created inside them.
//!
//! # Example
//!
//! ```no_run
//! use epochrt::runtime::{EventKind, Runtime};
//! use epochrt::{Guid, Result};
//!
//! fn main() -> Result<()> {
//!     let rt = Runtime::inline()?;
//!     let leaf = rt.create_template("leaf", |_ctx, _params, _deps| Ok(Guid::NULL))?;
//!     let root = rt.create_template("root", move |ctx, _params, _deps| {
//!         for _ in 0..4 {
//!             ctx.task_builder(leaf).slots(0).spawn()?;
//!         }
//!         Ok(Guid::NULL)
//!     })?;
//!     let done = rt.task_builder(root).slots(0).finish().with_output_event().spawn()?;
//!     rt.wait_idle();
//!     assert!(rt.event_payload(done.output_event.unwrap())?.is_some());
//!     # let _ = EventKind::Once;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod error;
pub mod runtime;
pub mod util;

pub use anyhow::{Context, Result};
pub use error::{RuntimeError, RuntimeResult};
pub use runtime::{Guid, Runtime};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "epochrt";
