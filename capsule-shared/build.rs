//! Build script generating the gRPC service stubs.
//!
//! Messages are hand-written prost structs in `src/protocol.rs`; only the
//! client/server plumbing is generated, so no `protoc` is required.

use tonic_build::manual::{Builder, Method, Service};

const PACKAGE: &str = "capsule.v1";
const CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::protocol::{}", input))
        .output_type(format!("crate::protocol::{}", output))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let agent = Service::builder()
        .name("Agent")
        .package(PACKAGE)
        .method(unary("ping", "Ping", "PingRequest", "PingResponse"))
        .method(unary(
            "lookup_user",
            "LookupUser",
            "LookupUserRequest",
            "LookupUserResponse",
        ))
        .method(unary(
            "shutdown",
            "Shutdown",
            "ShutdownRequest",
            "ShutdownResponse",
        ))
        .build();

    let container = Service::builder()
        .name("Container")
        .package(PACKAGE)
        .method(unary(
            "create",
            "Create",
            "CreateContainerRequest",
            "CreateContainerResponse",
        ))
        .method(unary(
            "delete",
            "Delete",
            "DeleteContainerRequest",
            "DeleteContainerResponse",
        ))
        .build();

    let process = Service::builder()
        .name("Process")
        .package(PACKAGE)
        .method(unary(
            "create",
            "Create",
            "CreateProcessRequest",
            "CreateProcessResponse",
        ))
        .method(unary(
            "start",
            "Start",
            "StartProcessRequest",
            "StartProcessResponse",
        ))
        .method(
            Method::builder()
                .name("attach")
                .route_name("Attach")
                .input_type("crate::protocol::AttachRequest")
                .output_type("crate::protocol::OutputChunk")
                .codec_path(CODEC)
                .server_streaming()
                .build(),
        )
        .method(
            Method::builder()
                .name("send_input")
                .route_name("SendInput")
                .input_type("crate::protocol::InputChunk")
                .output_type("crate::protocol::SendInputAck")
                .codec_path(CODEC)
                .client_streaming()
                .build(),
        )
        .method(unary("wait", "Wait", "WaitRequest", "WaitResponse"))
        .method(unary("kill", "Kill", "KillRequest", "KillResponse"))
        .method(unary("resize", "Resize", "ResizeRequest", "ResizeResponse"))
        .method(unary(
            "delete",
            "Delete",
            "DeleteProcessRequest",
            "DeleteProcessResponse",
        ))
        .build();

    Builder::new()
        .build_server(true)
        .build_client(true)
        .compile(&[agent, container, process]);

    println!("cargo:rerun-if-changed=build.rs");
}
