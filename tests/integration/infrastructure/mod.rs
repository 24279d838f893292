pub mod ports;

pub use binary::StagehandBinary;
pub use http_client::{http_get, HttpResponse};
pub use log_capture::LogCapture;
pub use ports::{free_port, port_is_open};
