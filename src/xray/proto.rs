pub mod agent {
    pub mod runtime {
        tonic::include_proto!("agent.runtime");
    }
}
