fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/task_runtime/v1/task_runtime.proto"], &["proto"])?;
    Ok(())
}
