pub mod rpc;
pub mod service;
pub mod timing_wheel;

pub use rpc::{rpc_routes, RpcState};
pub use service::{run_wheel_loop, WorkerMetrics, WorkerService};
pub use timing_wheel::TimingWheel;
