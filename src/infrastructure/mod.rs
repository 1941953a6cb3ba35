pub mod bluetooth;
pub mod bridge;
pub mod logging;
