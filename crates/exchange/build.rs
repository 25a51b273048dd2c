fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/basalt_exchange.proto");

    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    // Payload fields decode as `bytes::Bytes` so broadcast channels share one
    // reference-counted buffer instead of copying per destination.
    let mut config = prost_build::Config::new();
    config.bytes(["."]);
    tonic_build::configure().compile_protos_with_config(
        config,
        &["proto/basalt_exchange.proto"],
        &["proto"],
    )?;
    Ok(())
}
