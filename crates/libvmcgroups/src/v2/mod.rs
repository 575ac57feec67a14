pub mod manager;
pub mod util;
