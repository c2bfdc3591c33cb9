fn main() {
    tonic_build::configure()
        .build_client(false)
        .build_server(false)
        .compile_protos(&["proto/money.proto", "proto/notification.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("Failed to compile protos {:?}", e));
}
