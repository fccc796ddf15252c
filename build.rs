fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/raft/proto");
    println!("cargo:rerun-if-changed=src/keyvalue/proto");

    // Generated code ends up in OUT_DIR and is pulled in with include_proto!.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "src/raft/proto/common.proto",
                "src/raft/proto/service.proto",
                "src/raft/proto/persistence.proto",
            ],
            &["src/raft/proto"],
        )?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["src/keyvalue/proto/keyvalue.proto"], &["src/keyvalue/proto"])?;

    Ok(())
}
