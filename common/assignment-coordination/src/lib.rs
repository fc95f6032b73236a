pub mod backend;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod subscription;
pub mod util;
