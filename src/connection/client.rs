//! Collaborator interface for the external resource a sequencer drives

use devseq_shared::{Command, CorrelationId, DispatchError};

/// The native HAL bridge or remote service binding behind a sequencer.
///
/// `dispatch` is fire-and-forget: it must not block, and every accepted
/// command must eventually be answered through
/// [`Sequencer::on_command_completed`](crate::command::Sequencer::on_command_completed)
/// or by the resource's death signal.
pub trait ResourceClient<T>: Send + Sync {
    /// Human-readable name for this resource
    fn name(&self) -> &str;

    /// Whether the resource is currently bound and able to take commands
    fn is_available(&self) -> bool;

    /// Begin executing a command
    fn dispatch(&self, command: &Command<T>) -> Result<(), DispatchError>;

    /// Interrupt in-flight work, for resources that support it
    fn cancel_in_flight(&self, _id: CorrelationId) -> bool {
        false
    }
}
