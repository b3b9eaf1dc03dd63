pub mod persister;
pub mod poller;
