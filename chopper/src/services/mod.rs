//! Service layer.

mod container;

pub use container::{
    CORE_MODULE, ServiceContainer, file_cache_id, monitor_id, task_center_id,
};
