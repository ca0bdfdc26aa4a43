//! Order management: the two components with exclusive write access to
//! orders and position groups respectively (spec §4.1, §4.2).

pub mod group_lock;
pub mod order_service;
pub mod position_manager;
