pub mod erc20;
pub mod multicall;
pub mod transfer;

pub use erc20::IERC20;
pub use multicall::{Call3, IMulticall3, McResult};
pub use transfer::Transfer;
