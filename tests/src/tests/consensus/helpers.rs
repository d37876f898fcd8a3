pub mod fake_network;
pub mod interceptor;
