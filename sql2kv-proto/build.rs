//! Build script for generating the bulk-load protocol buffer code.

use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Get the path to the proto files
    let proto_root = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?)
        .parent()
        .ok_or("manifest dir has no parent")?
        .join("proto");

    // Use the vendored protoc so builds do not depend on a system install
    let mut config = prost_build::Config::new();
    config.protoc_executable(protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // Suppress specific clippy warnings for generated code
        .type_attribute(
            ".",
            "#[allow(clippy::all, clippy::pedantic, clippy::nursery)]",
        )
        .server_attribute(
            ".",
            "#[allow(clippy::all, clippy::pedantic, clippy::nursery)]",
        )
        .client_attribute(
            ".",
            "#[allow(clippy::all, clippy::pedantic, clippy::nursery)]",
        )
        .compile_protos_with_config(
            config,
            &[proto_root.join("importkv/v1/import_kv.proto")],
            &[proto_root],
        )?;

    Ok(())
}
