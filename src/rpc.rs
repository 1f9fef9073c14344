//! Generated protobuf types for the push gateway service

pub mod delivery {
    tonic::include_proto!("delivery");
}
