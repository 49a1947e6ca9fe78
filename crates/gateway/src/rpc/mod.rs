//! JSON-RPC plumbing: the method dispatcher and the server→client request
//! correlation table.

pub mod dispatch;
pub mod server_requests;
