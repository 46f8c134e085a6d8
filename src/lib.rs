pub mod build {
    pub mod bazel {
        pub mod semver {
            tonic::include_proto!("build.bazel.semver");
        }
        pub mod remote {
            pub mod execution {
                pub mod v2 {
                    tonic::include_proto!("build.bazel.remote.execution.v2");
                }
            }
        }
    }
}
pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
    pub mod bytestream {
        tonic::include_proto!("google.bytestream");
    }
}
pub mod proto {
    tonic::include_proto!("casdepot");
}

pub mod digest;

pub mod blobstore;

pub mod cas;

pub mod actioncache;

pub mod server;
