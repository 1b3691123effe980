//! gRPC bindings for the part of the etcd v3 API used by `etcd-config`.
//!
//! Only `KV/Range` and `Watch/Watch` are declared. Field numbers match the
//! upstream etcd definitions, so these stubs talk to a real etcd cluster.

pub mod mvccpb {
    tonic::include_proto!("mvccpb");
}

pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}
