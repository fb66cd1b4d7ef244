//! Switchyard core: the routing envelope, worker process capabilities, and
//! status snapshots shared by brokers and their remote peers.

pub mod envelope;
pub mod process;
pub mod status;

pub use envelope::{
    Envelope, MessageReply, Payload, SystemRequest, DEFAULT_TIMEOUT_MS, HOST_SERVICE,
    LOCAL_CONNECTION, TIMEOUT_RETURN,
};
pub use process::{ForwardRequest, ProcessError, ProcessFactory, ProcessInstance, ProcessStatus};
pub use status::StatusSnapshot;
