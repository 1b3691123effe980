fn main() {
    println!("cargo:rerun-if-changed=proto/kv.proto");
    println!("cargo:rerun-if-changed=proto/rpc.proto");
    tonic_prost_build::configure()
        .compile_protos(&["proto/rpc.proto"], &["proto/"])
        .expect("Failed to compile proto/rpc.proto");
}
