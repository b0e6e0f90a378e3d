//! Tag types exchanged between the producing and consuming halves of concurrent channels.

use sluice_runtime::Cause;

/// Why a consuming loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SinkEndReason<C = ()> {
    /// The sink finished on its own.
    #[display("sink end")]
    SinkEnd,
    /// A schedule timed out.
    #[display("schedule timeout")]
    ScheduleTimeout,
    /// A schedule finished with the given output.
    #[display("schedule end")]
    ScheduleEnd(C),
    /// The upstream finished.
    #[display("upstream end")]
    UpstreamEnd,
}

/// Which side's completion terminates a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TerminationStrategy {
    /// The merge ends when the left side ends.
    #[display("left")]
    Left,
    /// The merge ends when the right side ends.
    #[display("right")]
    Right,
    /// The merge ends when both sides have ended.
    #[default]
    #[display("both")]
    Both,
    /// The merge ends when either side ends.
    #[display("either")]
    Either,
}

/// A message passed through a [crate::Handoff] from a producer fiber to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffSignal<E, A> {
    /// An element.
    Emit(A),
    /// The producer failed.
    Halt(Cause<E>),
    /// The producer finished.
    End(SinkEndReason),
}

/// One buffered unit of a producer's output: an element, a failure, or the end with its done
/// value.
#[derive(Debug, Clone, PartialEq)]
pub enum Take<E, A, D = ()> {
    /// An element.
    Elem(A),
    /// The producer failed.
    Fail(Cause<E>),
    /// The producer finished.
    End(D),
}
