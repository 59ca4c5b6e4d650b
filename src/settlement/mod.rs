//! Epoch settlement: integer weights at epoch close and the on-demand reward/APY pass.

pub mod abi;
pub mod rewards;
pub mod rpc_sink;
pub mod sink;
pub mod weights;

pub use rewards::{compute_rewards, reward_report, RewardInputs, RewardReport, SettlementError};
pub use rpc_sink::RpcSettlementSink;
pub use sink::SettlementSink;
pub use weights::compute_weights;
