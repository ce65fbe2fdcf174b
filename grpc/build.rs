fn main() -> Result<(), Box<dyn std::error::Error>> {
    let iface_files = &["proto/meta.proto", "proto/service.proto"];
    let dirs = &["proto"];

    println!("start build proto");

    // Vendored protoc unless PROTOC is set.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Type names are needed by `prost_types::Any::from_msg` and `to_msg`.
    let mut config = prost_build::Config::new();
    config.enable_type_names();

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos_with_config(config, iface_files, dirs)
        .unwrap_or_else(|e| panic!("protobuf compilation failed: {}", e));

    for file in iface_files {
        println!("cargo:rerun-if-changed={}", file);
    }

    Ok(())
}
