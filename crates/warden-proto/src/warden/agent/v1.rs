// Messages for the `warden.agent.v1.Agent` service.
//
// Kept by hand in the same shape prost-build would emit, so the crate has no
// build-time protoc requirement. Tags are part of the wire contract: never
// renumber, only append.

pub use crate::rpc_error::RpcError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProcessState {
    Unspecified = 0,
    NotStarted = 1,
    Running = 2,
    Exited = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<RpcError>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<RpcError>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopOrKillRequest {
    #[prost(uint64, tag = "1")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopOrKillResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<RpcError>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitResponse {
    #[prost(int32, tag = "1")]
    pub exit_code: i32,
    #[prost(string, tag = "2")]
    pub exit_string: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub error: ::core::option::Option<RpcError>,
    // Set when the process ended by signal; exit_code is -1 then.
    #[prost(int32, tag = "4")]
    pub signal: i32,
    #[prost(bool, tag = "5")]
    pub has_signal: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStdioRequest {
    /// Last sequence number the caller has seen; 0 means from the start.
    #[prost(uint64, tag = "1")]
    pub since_seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StdioLine {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(string, tag = "2")]
    pub text: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStdioResponse {
    #[prost(message, repeated, tag = "1")]
    pub lines: ::prost::alloc::vec::Vec<StdioLine>,
    /// The producing stream has closed; no further lines will appear for
    /// this process lifetime.
    #[prost(bool, tag = "2")]
    pub finished: bool,
    #[prost(message, optional, tag = "3")]
    pub error: ::core::option::Option<RpcError>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatusRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatusResponse {
    #[prost(enumeration = "ProcessState", tag = "1")]
    pub state: i32,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
    #[prost(bool, tag = "3")]
    pub has_pid: bool,
    #[prost(int32, tag = "4")]
    pub exit_code: i32,
    #[prost(bool, tag = "5")]
    pub has_exit_code: bool,
    #[prost(int64, tag = "6")]
    pub started_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHumanStatusRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHumanStatusResponse {
    #[prost(string, tag = "1")]
    pub status: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(int64, tag = "1")]
    pub timestamp_unix_nanos: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(int64, tag = "1")]
    pub timestamp_unix_nanos: i64,
}
