#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/sluice-rs/sluice/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

extern crate alloc;

#[macro_use]
extern crate tracing;

mod cause;
pub use cause::{Cause, Defect, Exit};

mod cell;
pub use cell::Ref;

mod context;
pub use context::Context;

mod deferred;
pub use deferred::Deferred;

mod errors;
pub use errors::{QueueError, QueueResult};

mod fiber;
pub use fiber::{acquire_use_release, fork, race_with, Fiber, FiberContext, FiberId};

mod hub;
pub use hub::{Hub, Subscription};

mod queue;
pub use queue::{Queue, QueueStrategy};

mod scope;
pub use scope::{Scope, ScopeExit};
