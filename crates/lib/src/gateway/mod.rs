//! Gateway: HTTP + WebSocket front door to the relay.
//!
//! Single port serves HTTP and WebSocket. Protocol: first frame must be `connect`
//! (session and user); afterwards vote/card events are relayed to the session and
//! requests (req/res) are answered on the same socket.

mod protocol;
mod server;

pub use protocol::{
    decode_client_frame, ClientFrame, ConnectAuth, ConnectParams, FrameError, HelloOk, HelloPolicy,
    WsRequest, WsResponse,
};
pub use server::{router, run_gateway, serve, GatewayState};
