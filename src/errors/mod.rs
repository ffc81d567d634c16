mod gateway_error;
mod rpc_error;

pub use gateway_error::{GatewayError, GatewayErrorKind, Severity};
pub use rpc_error::{ErrorCode, RpcError};
