pub mod constants;
mod error;
mod types;
pub mod util;

pub use constants::*;
pub use error::{BridgeError, ErrorClass, Result};
pub use types::{hx32, ChainAddress, Hash20, Hash32, MemberIndex, OperatorAddress, OperatorId, WalletId};
