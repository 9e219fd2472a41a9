/// What a node step produced, per `spec.md` §9's "Dynamic action dispatch"
/// design note. The outer loop in [`super::FlowExecutor::run`] interprets
/// this against the flow's edges rather than the node having to know its
/// own graph position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The conversation has a user-visible answer; stop looping.
    FinalResponse,
    /// The node failed in a way the conversation should surface to the
    /// caller rather than silently retry.
    Error(String),
    /// Waiting on something external (tool approval, more user input);
    /// stop looping without marking the conversation finished or failed.
    StayOnNode,
    /// Reserved for node types that hand tool dispatch to the outer loop
    /// instead of resolving it internally; `process` nodes never emit this
    /// themselves since their own `exec` loop absorbs tool calls.
    ToolCall,
    /// An edge's action label to follow to the next node.
    Handoff(String),
    /// An action label with no matching outgoing edge. Per the
    /// interpretation table this is treated the same as `FinalResponse`
    /// rather than as an error — an unlabeled dead end is not a failure.
    Unknown(String),
}
