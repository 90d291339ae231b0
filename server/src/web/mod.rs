pub mod app_state;
pub mod identity;
pub mod rest_api;
pub mod router;
pub mod ws_handler;
