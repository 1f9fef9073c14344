fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/delivery.proto");
    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile_protos(&["proto/delivery.proto"], &["proto"])?;
    Ok(())
}
