mod broadcast;
mod init;
mod status;

pub use broadcast::broadcast_next;
pub use init::initialize;
pub use status::get_status;
