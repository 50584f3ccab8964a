pub mod captures;
pub mod devices;
pub mod triggers;
