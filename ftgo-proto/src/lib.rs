pub mod common {
    tonic::include_proto!("me.jangjunha.ftgo.common");
}

pub mod orchestration_service {
    tonic::include_proto!("me.jangjunha.ftgo.orchestration_service");
}
