// ============================================================================
// IPC (Channel Dispatch) Module
// 多数の論理接続を小さなワーカープールへ多重化する
// ============================================================================
pub mod channel;
pub mod domain;
pub mod runtime;
pub mod transport;

pub use channel::{Channel, ChannelId, ClosedHandler, ProcessHandler, drain_messages};
pub use domain::{DomainId, ExecutionDomain};
pub use runtime::DispatchRuntime;
pub use transport::{Endpoint, EndpointId, EndpointSignal, Message};
