//! Wire format for dynamic backend registration.
//!
//! Backends announce themselves by POSTing a protobuf-encoded
//! [`RegisterRequest`] to the configured register path, and take
//! themselves out with a [`DeregisterRequest`] on the deregister path.
//! The messages are declared with prost field attributes directly, so no
//! protoc step is involved.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct RegisterRequest {
    #[prost(string, optional, tag = "1")]
    pub host: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub port: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeregisterRequest {
    #[prost(string, optional, tag = "1")]
    pub host: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub port: Option<i32>,
}

/// Builds the backend URL announced by a registration request:
/// `http://host` or `http://host:port`.
pub fn backend_url(host: &str, port: Option<i32>) -> String {
    match port {
        Some(port) => format!("http://{host}:{port}"),
        None => format!("http://{host}"),
    }
}
