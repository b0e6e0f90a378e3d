#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/sluice-rs/sluice/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(any(test, feature = "test-utils")), warn(unused_crate_dependencies))]

extern crate alloc;

#[macro_use]
extern crate tracing;

mod chunk;
pub use chunk::Chunk;

mod signals;
pub use signals::{HandoffSignal, SinkEndReason, Take, TerminationStrategy};

mod errors;
pub use errors::ExecutorError;

mod config;
pub use config::{BufferConfig, MergeConfig};

mod node;
mod executor;

mod channel;
pub use channel::{Channel, ChannelPull, Source, Step, Value};

mod merge;
pub use merge::{merge_all, MergeDecision, MergeStrategy};

mod handoff;
pub use handoff::Handoff;

mod buffer;

mod broadcast;
pub use broadcast::Broadcast;

pub mod transducers;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use sluice_runtime::{
    Cause, Context, Deferred, Exit, Fiber, FiberContext, FiberId, Hub, Queue, QueueStrategy, Ref,
    Scope, ScopeExit,
};
