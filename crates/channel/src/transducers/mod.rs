//! Stateful channels that reshape the elements flowing through them.
//!
//! Each transducer keeps its state in a [sluice_runtime::Ref] allocated when the channel starts,
//! so a transducer value can be run any number of times.

mod group_adjacent;
pub use group_adjacent::group_adjacent_by;

mod split;
pub use split::split_on_chunk;

mod debounce;
