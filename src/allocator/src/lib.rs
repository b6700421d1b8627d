pub mod error;
pub mod manager;
pub mod pool_item;
pub mod port_list;
pub mod protocol;
