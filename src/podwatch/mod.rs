pub mod informer;
pub mod store;

pub use informer::{node_field_selector, DeletedPod, PodEventHandler, PodInformer};
pub use store::PodStore;
