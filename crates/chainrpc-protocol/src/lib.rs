mod inbound;
mod protocol;

pub use inbound::{parse_frame, Inbound, ProtocolError, ResponseFrame, SubscriptionPush};
pub use protocol::{
    RemoteId, Request, RequestId, RpcError, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR,
};
