pub mod health_controller;
pub mod resolve_controller;
