pub mod backend;
pub mod desk;
pub mod persistence;
pub mod poller;
pub mod types;
pub mod view;

#[cfg(test)]
pub mod testing;
