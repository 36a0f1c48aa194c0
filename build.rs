fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protobuf_src::protoc());
    println!("cargo:rerun-if-changed=proto/executor.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/executor.proto"], &["proto"])?;

    Ok(())
}
