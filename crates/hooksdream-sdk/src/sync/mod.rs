/// 同步模块
///
/// 职责：
/// - 按入队顺序回放待同步操作（SyncDispatcher）
/// - 把服务端确认写回缓存（ServerResponseApplier）
/// - 传输层抽象（ActionTransport）

pub mod applier;
pub mod dispatcher;
pub mod transport;

pub use applier::{unwrap_envelope, ServerResponseApplier};
pub use dispatcher::{DispatcherStats, DrainReport, EnqueueResult, SyncDispatcher};
pub use transport::{ActionTransport, TransportResponse};
