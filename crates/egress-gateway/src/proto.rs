//! Wire types and client for the node agent's `felix.PolicySync` service.
//!
//! Maintained by hand against `proto/policysync.proto` so the build does not
//! need `protoc`. Only the payloads the route synchronizer consumes are
//! declared; prost skips unknown fields and unknown oneof arms decode as
//! `payload: None`.

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncRequest {
    #[prost(string, tag = "1")]
    pub subscription_type: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToDataplane {
    #[prost(uint64, tag = "15")]
    pub sequence_number: u64,
    #[prost(oneof = "to_dataplane::Payload", tags = "1, 24, 25")]
    pub payload: ::core::option::Option<to_dataplane::Payload>,
}

pub mod to_dataplane {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        InSync(super::InSync),
        #[prost(message, tag = "24")]
        RouteUpdate(super::RouteUpdate),
        #[prost(message, tag = "25")]
        RouteRemove(super::RouteRemove),
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct InSync {}

/// Bit values of [`RouteUpdate::types`].
pub mod route_type {
    pub const CIDR_INFO: i32 = 0;
    pub const REMOTE_WORKLOAD: i32 = 1;
    pub const REMOTE_HOST: i32 = 2;
    pub const LOCAL_WORKLOAD: i32 = 4;
    pub const LOCAL_HOST: i32 = 8;
    pub const REMOTE_TUNNEL: i32 = 16;
    pub const LOCAL_TUNNEL: i32 = 32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IpPoolType {
    None = 0,
    NoEncap = 1,
    Vxlan = 2,
    Ipip = 3,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct TunnelType {
    #[prost(bool, tag = "1")]
    pub ipip: bool,
    #[prost(bool, tag = "2")]
    pub vxlan: bool,
    #[prost(bool, tag = "3")]
    pub wireguard: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteUpdate {
    #[prost(int32, tag = "1")]
    pub types: i32,
    #[prost(enumeration = "IpPoolType", tag = "2")]
    pub ip_pool_type: i32,
    #[prost(string, tag = "3")]
    pub dst: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub dst_node_name: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub dst_node_ip: ::prost::alloc::string::String,
    #[prost(bool, tag = "7")]
    pub same_subnet: bool,
    #[prost(bool, tag = "8")]
    pub nat_outgoing: bool,
    #[prost(bool, tag = "9")]
    pub local_workload: bool,
    #[prost(message, optional, tag = "10")]
    pub tunnel_type: ::core::option::Option<TunnelType>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteRemove {
    #[prost(string, tag = "2")]
    pub dst: ::prost::alloc::string::String,
}

/// Client for `felix.PolicySync`.
#[derive(Debug, Clone)]
pub struct PolicySyncClient {
    inner: tonic::client::Grpc<Channel>,
}

impl PolicySyncClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Opens the server-streaming `Sync` call.
    pub async fn sync(
        &mut self,
        request: impl tonic::IntoRequest<SyncRequest>,
    ) -> std::result::Result<tonic::Response<tonic::codec::Streaming<ToDataplane>>, tonic::Status>
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("Service was not ready: {}", e)))?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/felix.PolicySync/Sync");
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_route_update_decodes_through_envelope() {
        let msg = ToDataplane {
            sequence_number: 7,
            payload: Some(to_dataplane::Payload::RouteUpdate(RouteUpdate {
                types: route_type::REMOTE_WORKLOAD,
                ip_pool_type: IpPoolType::Vxlan as i32,
                dst: "10.0.1.0/24".into(),
                dst_node_name: "node-b".into(),
                dst_node_ip: "192.168.1.2".into(),
                tunnel_type: Some(TunnelType {
                    wireguard: true,
                    ..Default::default()
                }),
                ..Default::default()
            })),
        };

        let decoded = ToDataplane::decode(msg.encode_to_vec().as_slice()).unwrap();
        let Some(to_dataplane::Payload::RouteUpdate(update)) = decoded.payload else {
            panic!("expected a route update");
        };
        assert_eq!(update.ip_pool_type(), IpPoolType::Vxlan);
        assert_eq!(update.dst_node_name, "node-b");
        assert!(update.tunnel_type.unwrap().wireguard);
    }

    #[test]
    fn test_unknown_pool_type_reads_as_default() {
        let update = RouteUpdate {
            ip_pool_type: 42,
            ..Default::default()
        };
        assert_eq!(update.ip_pool_type(), IpPoolType::None);
    }

    #[test]
    fn test_empty_envelope_has_no_payload() {
        let decoded = ToDataplane::decode(&[][..]).unwrap();
        assert!(decoded.payload.is_none());
    }
}
