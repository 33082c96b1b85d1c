pub mod client_rotator;
pub mod http_client;
